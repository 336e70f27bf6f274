use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{AlarmSink, AlarmType};

/// Files idle longer than this are forgotten.
const EVICT_IDLE_SECS: i64 = 2 * 86400;
/// Tracked-file ceiling; crossing it drops the oldest batch.
const MAX_TRACKED_FILES: usize = 10_000;
const EVICT_BATCH: usize = 2_000;
/// High-water marks align down to this boundary.
const ALIGN: u64 = 4096;

#[derive(Debug, Error)]
pub enum CheckpointIoError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint file is not valid: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Identity of one tracked file under one config.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub config: String,
    pub path: String,
    pub dev: u64,
    pub inode: u64,
}

impl FileKey {
    pub fn new(config: impl Into<String>, path: impl Into<String>, dev: u64, inode: u64) -> Self {
        Self {
            config: config.into(),
            path: path.into(),
            dev,
            inode,
        }
    }

    fn to_persist_key(&self) -> String {
        format!("{}|{}|{}|{}", self.config, self.path, self.dev, self.inode)
    }

    fn from_persist_key(key: &str) -> Option<Self> {
        let mut parts = key.rsplitn(3, '|');
        let inode: u64 = parts.next()?.parse().ok()?;
        let dev: u64 = parts.next()?.parse().ok()?;
        let rest = parts.next()?;
        let (config, path) = rest.split_once('|')?;
        Some(Self::new(config, path, dev, inode))
    }
}

/// Outstanding sent span awaiting acknowledgement.
#[derive(Debug, Clone, Copy)]
struct SpanEntry {
    seq: i64,
    offset: u64,
    len: u64,
    acked: bool,
}

#[derive(Debug, Default)]
struct FileCheckpoint {
    /// Persistent high-water mark: everything below is acknowledged.
    offset: u64,
    last_update: i64,
    /// FIFO of sent spans; a contiguous acked prefix compacts into
    /// `offset`.
    pending: VecDeque<SpanEntry>,
    exactly_once: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    offset: u64,
    last_update_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    positions: Option<Vec<(u64, u64)>>,
}

/// Persistent map from file identity to replay state.
///
/// At-least-once configs track a plain offset advanced on ACK.
/// Exactly-once configs additionally track the FIFO of `(offset, len)`
/// spans; the acked prefix compacts to a 4 KiB-aligned high-water mark,
/// always reserving at least one byte before the end so a restart re-reads
/// across the boundary. IO failures degrade the store to memory-only until
/// the next successful dump.
pub struct CheckpointStore {
    entries: DashMap<FileKey, Arc<Mutex<FileCheckpoint>>>,
    path: PathBuf,
    next_seq: AtomicI64,
    degraded: AtomicBool,
    alarm: Arc<AlarmSink>,
    exactly_once_concurrency: usize,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, exactly_once_concurrency: usize) -> Self {
        Self {
            entries: DashMap::new(),
            path: path.into(),
            next_seq: AtomicI64::new(1),
            degraded: AtomicBool::new(false),
            alarm: Arc::new(AlarmSink::new()),
            exactly_once_concurrency: exactly_once_concurrency.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn exactly_once_concurrency(&self) -> usize {
        self.exactly_once_concurrency
    }

    fn entry(&self, key: &FileKey) -> Arc<Mutex<FileCheckpoint>> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FileCheckpoint::default())))
            .clone()
    }

    /// Offset reading should resume from after a restart.
    pub fn resume_offset(&self, key: &FileKey) -> Option<u64> {
        self.entries.get(key).map(|e| e.value().lock().offset)
    }

    /// At-least-once ACK path: the offset moves straight to the
    /// acknowledged end.
    pub fn update_offset(&self, key: &FileKey, offset: u64, now: i64) {
        let entry = self.entry(key);
        let mut cp = entry.lock();
        cp.offset = cp.offset.max(offset);
        cp.last_update = now;
    }

    /// Exactly-once send path: register the span before it enters the
    /// sender queue. Returns the sequence number and the concurrency slot.
    pub fn register_span(&self, key: &FileKey, offset: u64, len: u64, now: i64) -> (i64, usize) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = self.entry(key);
        let mut cp = entry.lock();
        cp.exactly_once = true;
        cp.last_update = now;
        cp.pending.push_back(SpanEntry {
            seq,
            offset,
            len,
            acked: false,
        });
        (seq, (seq as usize) % self.exactly_once_concurrency)
    }

    /// Exactly-once ACK path: flip the span's flag, then compact the acked
    /// prefix into the high-water mark.
    pub fn ack_span(&self, key: &FileKey, seq: i64, now: i64) {
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return;
        };
        let mut cp = entry.lock();
        if let Some(span) = cp.pending.iter_mut().find(|s| s.seq == seq) {
            span.acked = true;
        }
        let mut last_end = None;
        while let Some(front) = cp.pending.front() {
            if !front.acked {
                break;
            }
            last_end = Some(front.offset + front.len);
            cp.pending.pop_front();
        }
        if let Some(end) = last_end {
            let mut high_water = end & !(ALIGN - 1);
            if high_water == end {
                high_water = end.saturating_sub(1);
            }
            cp.offset = cp.offset.max(high_water);
        }
        cp.last_update = now;
    }

    /// Spans registered but not yet compacted, for sender-side dedup after
    /// a restart.
    pub fn outstanding_spans(&self, key: &FileKey) -> Vec<(u64, u64)> {
        self.entries
            .get(key)
            .map(|e| e.value().lock().pending.iter().map(|s| (s.offset, s.len)).collect())
            .unwrap_or_default()
    }

    /// Drop idle files, then enforce the tracked-file ceiling by dropping
    /// the oldest batch.
    pub fn evict(&self, now: i64) {
        self.entries
            .retain(|_, entry| now - entry.lock().last_update <= EVICT_IDLE_SECS);

        if self.entries.len() > MAX_TRACKED_FILES {
            let mut by_age: Vec<(FileKey, i64)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().lock().last_update))
                .collect();
            by_age.sort_by_key(|(_, t)| *t);
            for (key, _) in by_age.into_iter().take(EVICT_BATCH) {
                self.entries.remove(&key);
            }
            tracing::info!(
                remaining = self.entries.len(),
                "checkpoint store over capacity, evicted oldest files"
            );
        }
    }

    pub fn load(&self) -> Result<usize, CheckpointIoError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let data = std::fs::read(&self.path)?;
        let persisted: std::collections::BTreeMap<String, PersistedEntry> = serde_json::from_slice(&data)?;
        let mut loaded = 0;
        for (raw_key, entry) in persisted {
            let Some(key) = FileKey::from_persist_key(&raw_key) else {
                tracing::warn!(key = %raw_key, "skipping unparseable checkpoint key");
                continue;
            };
            let mut cp = FileCheckpoint {
                offset: entry.offset,
                last_update: entry.last_update_time,
                pending: VecDeque::new(),
                exactly_once: entry.positions.is_some(),
            };
            if let Some(positions) = entry.positions {
                for (offset, len) in positions {
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    cp.pending.push_back(SpanEntry {
                        seq,
                        offset,
                        len,
                        acked: false,
                    });
                }
            }
            self.entries.insert(key, Arc::new(Mutex::new(cp)));
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Serialize everything to disk, atomically via a sibling temp file.
    /// Failure leaves the store memory-only until the next dump succeeds.
    pub fn dump(&self) -> Result<(), CheckpointIoError> {
        let mut persisted = std::collections::BTreeMap::new();
        for item in self.entries.iter() {
            let cp = item.value().lock();
            persisted.insert(
                item.key().to_persist_key(),
                PersistedEntry {
                    offset: cp.offset,
                    last_update_time: cp.last_update,
                    positions: cp
                        .exactly_once
                        .then(|| cp.pending.iter().map(|s| (s.offset, s.len)).collect()),
                },
            );
        }
        let result = self.write_atomic(&persisted);
        match &result {
            Ok(()) => {
                self.degraded.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                self.degraded.store(true, Ordering::Relaxed);
                self.alarm.send(
                    AlarmType::CheckpointIo,
                    &format!("checkpoint dump failed, running memory-only: {e}"),
                );
            }
        }
        result
    }

    fn write_atomic(
        &self,
        persisted: &std::collections::BTreeMap<String, PersistedEntry>,
    ) -> Result<(), CheckpointIoError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(persisted)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> FileKey {
        FileKey::new("cfg", format!("/var/log/{n}.log"), 8, n)
    }

    #[test]
    fn test_at_least_once_offset() {
        let store = CheckpointStore::new("/tmp/unused.json", 512);
        let k = key(1);
        assert_eq!(store.resume_offset(&k), None);
        store.update_offset(&k, 100, 10);
        store.update_offset(&k, 50, 11);
        assert_eq!(store.resume_offset(&k), Some(100), "offset never moves back");
    }

    #[test]
    fn test_exactly_once_prefix_compaction() {
        let store = CheckpointStore::new("/tmp/unused.json", 512);
        let k = key(1);
        let (s1, _) = store.register_span(&k, 0, 5000, 1);
        let (s2, _) = store.register_span(&k, 5000, 5000, 1);
        let (s3, _) = store.register_span(&k, 10000, 3000, 1);

        // Out-of-order ACK: nothing compacts until the prefix is complete
        store.ack_span(&k, s2, 2);
        assert_eq!(store.resume_offset(&k), Some(0));
        assert_eq!(store.outstanding_spans(&k).len(), 3);

        store.ack_span(&k, s1, 3);
        // prefix [0,10000) acked, aligned down to 8192
        assert_eq!(store.resume_offset(&k), Some(8192));
        assert_eq!(store.outstanding_spans(&k).len(), 1);

        store.ack_span(&k, s3, 4);
        // 13000 -> aligned 12288
        assert_eq!(store.resume_offset(&k), Some(12288));
        assert!(store.outstanding_spans(&k).is_empty());
    }

    #[test]
    fn test_aligned_end_reserves_one_byte() {
        let store = CheckpointStore::new("/tmp/unused.json", 512);
        let k = key(1);
        let (s1, _) = store.register_span(&k, 0, 8192, 1);
        store.ack_span(&k, s1, 2);
        assert_eq!(store.resume_offset(&k), Some(8191));
    }

    #[test]
    fn test_concurrency_slots_cycle() {
        let store = CheckpointStore::new("/tmp/unused.json", 4);
        let k = key(1);
        let slots: Vec<usize> = (0..8).map(|i| store.register_span(&k, i * 10, 10, 1).1).collect();
        assert!(slots.iter().all(|&s| s < 4));
        let distinct: std::collections::HashSet<usize> = slots.iter().copied().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_idle_eviction() {
        let store = CheckpointStore::new("/tmp/unused.json", 512);
        store.update_offset(&key(1), 10, 0);
        store.update_offset(&key(2), 10, 3 * 86400);
        store.evict(3 * 86400 + 1);
        assert_eq!(store.len(), 1);
        assert!(store.resume_offset(&key(2)).is_some());
    }

    #[test]
    fn test_ceiling_eviction_drops_oldest() {
        let store = CheckpointStore::new("/tmp/unused.json", 512);
        for i in 0..(MAX_TRACKED_FILES as u64 + 1) {
            store.update_offset(&key(i), 1, i as i64);
        }
        store.evict(MAX_TRACKED_FILES as i64);
        assert_eq!(store.len(), MAX_TRACKED_FILES + 1 - EVICT_BATCH);
        // the oldest entries are the ones that went away
        assert!(store.resume_offset(&key(0)).is_none());
        assert!(store.resume_offset(&key(MAX_TRACKED_FILES as u64)).is_some());
    }

    #[test]
    fn test_dump_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");

        let store = CheckpointStore::new(&path, 512);
        store.update_offset(&key(1), 4096, 100);
        let (_, _) = store.register_span(&key(2), 0, 100, 101);
        store.dump().unwrap();

        let restored = CheckpointStore::new(&path, 512);
        assert_eq!(restored.load().unwrap(), 2);
        assert_eq!(restored.resume_offset(&key(1)), Some(4096));
        assert_eq!(restored.outstanding_spans(&key(2)), vec![(0, 100)]);
        assert!(!restored.is_degraded());
    }

    #[test]
    fn test_dump_failure_degrades() {
        let store = CheckpointStore::new("/proc/impossible/checkpoints.json", 512);
        store.update_offset(&key(1), 1, 1);
        assert!(store.dump().is_err());
        assert!(store.is_degraded());
    }

    #[test]
    fn test_persist_key_roundtrip() {
        let k = FileKey::new("my-config", "/var/log/pipe|odd.log", 42, 7);
        let parsed = FileKey::from_persist_key(&k.to_persist_key()).unwrap();
        assert_eq!(parsed, k);
    }
}
