use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::{EventGroup, GroupMetaKey};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::processor::parse_options;

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("flusher io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("flusher is not initialized")]
    NotInitialized,
}

/// Downstream edge of a pipeline: turns a processed group into an opaque
/// payload, and later delivers payloads popped from the sender queue.
pub trait Flusher: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError>;

    /// Stable routing identity; hashed into the pipeline's queue key.
    fn routing_key(&self) -> String;

    fn serialize(&self, group: &EventGroup) -> Vec<u8>;

    /// Deliver one payload. Called from the sender thread, never from
    /// workers.
    fn send(&self, payload: &[u8]) -> Result<(), FlushError>;

    fn flush(&self) -> Result<(), FlushError> {
        Ok(())
    }
}

/// JSON-lines encoding shared by the native flushers: one object per event
/// with the group tags attached.
pub fn serialize_group(group: &EventGroup) -> Vec<u8> {
    let mut out = Vec::new();
    let buf = group.buf();
    let mut tags = serde_json::Map::new();
    let tag_meta = [
        (GroupMetaKey::LogFilePath, "__path__"),
        (GroupMetaKey::HostName, "__hostname__"),
        (GroupMetaKey::HostIp, "__host_ip__"),
        (GroupMetaKey::AgentTag, "__user_defined_id__"),
        (GroupMetaKey::Topic, "__topic__"),
    ];
    for (meta_key, tag_name) in tag_meta {
        if let Some(value) = group.metadata(meta_key) {
            tags.insert(
                tag_name.to_string(),
                Value::String(String::from_utf8_lossy(value).into_owned()),
            );
        }
    }
    let tags = Value::Object(tags);

    for event in group.events() {
        let mut contents = serde_json::Map::new();
        for (k, v) in event.contents() {
            contents.insert(
                String::from_utf8_lossy(buf.get(*k)).into_owned(),
                Value::String(String::from_utf8_lossy(buf.get(*v)).into_owned()),
            );
        }
        let record = serde_json::json!({
            "time": event.timestamp,
            "time_ns": event.timestamp_nanos,
            "contents": contents,
            "tags": tags,
        });
        out.extend_from_slice(record.to_string().as_bytes());
        out.push(b'\n');
    }
    out
}

// ── blackhole ───────────────────────────────────────────────────

pub const FLUSHER_BLACKHOLE: &str = "flusher_blackhole";

/// Accounts for everything and delivers nothing. Useful for benchmarks and
/// as the terminal stage of drain-only pipelines.
#[derive(Debug, Default)]
pub struct FlusherBlackhole {
    config_name: String,
    groups_total: AtomicU64,
    bytes_total: AtomicU64,
}

impl FlusherBlackhole {
    pub fn boxed() -> Box<dyn Flusher> {
        Box::<Self>::default()
    }

    pub fn groups_total(&self) -> u64 {
        self.groups_total.load(Ordering::Relaxed)
    }
}

impl Flusher for FlusherBlackhole {
    fn name(&self) -> &'static str {
        FLUSHER_BLACKHOLE
    }

    fn init(&mut self, _config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        self.config_name = ctx.config_name.clone();
        Ok(())
    }

    fn routing_key(&self) -> String {
        format!("{}/{}", self.config_name, FLUSHER_BLACKHOLE)
    }

    fn serialize(&self, group: &EventGroup) -> Vec<u8> {
        serialize_group(group)
    }

    fn send(&self, payload: &[u8]) -> Result<(), FlushError> {
        self.groups_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

// ── file ────────────────────────────────────────────────────────

pub const FLUSHER_FILE: &str = "flusher_file";

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct FileOptions {
    file_path: Option<String>,
}

/// Appends serialized groups to a local file as JSON lines.
#[derive(Debug, Default)]
pub struct FlusherFile {
    path: String,
    file: Mutex<Option<File>>,
    sent_bytes: AtomicU64,
}

impl FlusherFile {
    pub fn boxed() -> Box<dyn Flusher> {
        Box::<Self>::default()
    }
}

impl Flusher for FlusherFile {
    fn name(&self) -> &'static str {
        FLUSHER_FILE
    }

    fn init(&mut self, config: &Value, _ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: FileOptions = parse_options(FLUSHER_FILE, config)?;
        self.path = opts.file_path.ok_or(ConfigError::MissingParam {
            plugin: FLUSHER_FILE,
            param: "FilePath",
        })?;
        Ok(())
    }

    fn routing_key(&self) -> String {
        format!("{}/{}", FLUSHER_FILE, self.path)
    }

    fn serialize(&self, group: &EventGroup) -> Vec<u8> {
        serialize_group(group)
    }

    fn send(&self, payload: &[u8]) -> Result<(), FlushError> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        let file = guard.as_mut().ok_or(FlushError::NotInitialized)?;
        file.write_all(payload)?;
        self.sent_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<(), FlushError> {
        if let Some(file) = self.file.lock().as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_serialize_group_shape() {
        let mut g = EventGroup::from_raw(&Bytes::from_static(b"hello"));
        g.set_metadata(GroupMetaKey::LogFilePath, b"/var/log/x.log");
        g.events_mut()[0].set_timestamp(1693833304, 500);
        let payload = serialize_group(&g);
        let line: Value = serde_json::from_slice(payload.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(line["time"], 1693833304);
        assert_eq!(line["time_ns"], 500);
        assert_eq!(line["contents"]["content"], "hello");
        assert_eq!(line["tags"]["__path__"], "/var/log/x.log");
    }

    #[test]
    fn test_file_flusher_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut flusher = FlusherFile::default();
        flusher
            .init(
                &serde_json::json!({"FilePath": path.to_str().unwrap()}),
                Arc::new(PipelineContext::new("c")),
            )
            .unwrap();
        flusher.send(b"one\n").unwrap();
        flusher.send(b"two\n").unwrap();
        flusher.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_blackhole_counts() {
        let mut flusher = FlusherBlackhole::default();
        flusher
            .init(&serde_json::json!({}), Arc::new(PipelineContext::new("c")))
            .unwrap();
        let g = EventGroup::from_raw(&Bytes::from_static(b"x"));
        let payload = flusher.serialize(&g);
        flusher.send(&payload).unwrap();
        assert_eq!(flusher.groups_total(), 1);
    }
}
