use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::checkpoint::{CheckpointStore, FileKey};
use crate::pipeline::{LogstoreKey, PipelineRegistry};
use crate::util::{AlarmSink, AlarmType};

/// Bounded wait per blocking-push round before the high-water alarm fires.
const PUSH_WAIT: Duration = Duration::from_millis(500);
/// Recently delivered idempotency keys kept for restart dedup.
const DEDUP_WINDOW: usize = 65536;

/// Serialized payload awaiting delivery, with everything needed to route
/// the acknowledgement back to the checkpoint store.
#[derive(Debug)]
pub struct SenderItem {
    pub config_name: String,
    pub key: LogstoreKey,
    pub payload: Vec<u8>,
    pub file: FileKey,
    pub offset: u64,
    pub len: u64,
    /// Present for exactly-once pipelines.
    pub seq: Option<i64>,
}

impl SenderItem {
    /// Sender-side idempotency key: `(config, dev+inode, offset)`.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}:{}|{}",
            self.config_name, self.file.dev, self.file.inode, self.offset
        )
    }
}

struct QueueInner {
    items: VecDeque<SenderItem>,
    closed: bool,
}

/// Bounded queue between workers and the sender thread. A full queue
/// blocks the pushing worker with a bounded wait and an alarm; every pop
/// signals space so blocked workers resume, which is the downstream
/// feedback the process queue relies on.
pub struct SenderQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    space: Condvar,
    available: Condvar,
    alarm: AlarmSink,
}

impl SenderQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            space: Condvar::new(),
            available: Condvar::new(),
            alarm: AlarmSink::new(),
        }
    }

    /// Block until the item fits or the queue is closed. Returns false
    /// only on a closed queue.
    pub fn push_blocking(&self, item: SenderItem) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return false;
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                drop(inner);
                self.available.notify_one();
                return true;
            }
            let timed_out = self
                .space
                .wait_for(&mut inner, PUSH_WAIT)
                .timed_out();
            if timed_out {
                self.alarm.send(
                    AlarmType::SenderQueueBlocked,
                    "sender queue full, worker blocked waiting for downstream",
                );
            }
        }
    }

    pub fn pop(&self, timeout: Duration) -> Option<SenderItem> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.space.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.available.wait_for(&mut inner, remaining);
        }
    }

    /// Close the queue: pushes fail, pops drain what is left.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.space.notify_all();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single sender thread: pops payloads, delivers them through the
/// owning pipeline's flusher, deduplicates restart replays, and routes
/// ACKs into the checkpoint store.
pub struct Sender {
    handle: Option<JoinHandle<()>>,
    queue: Arc<SenderQueue>,
    stop: Arc<AtomicBool>,
}

impl Sender {
    pub fn spawn(
        queue: Arc<SenderQueue>,
        registry: Arc<PipelineRegistry>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("sender".to_string())
            .spawn(move || {
                let mut seen: HashSet<String> = HashSet::new();
                let mut seen_order: VecDeque<String> = VecDeque::new();
                loop {
                    let Some(item) = thread_queue.pop(Duration::from_millis(100)) else {
                        if thread_stop.load(Ordering::Acquire) {
                            break;
                        }
                        continue;
                    };
                    deliver(&registry, &checkpoints, &mut seen, &mut seen_order, item);
                }
                // Drain whatever is left after stop was requested
                while let Some(item) = thread_queue.pop(Duration::from_millis(0)) {
                    deliver(&registry, &checkpoints, &mut seen, &mut seen_order, item);
                }
            })
            .expect("spawn sender thread");
        Self {
            handle: Some(handle),
            queue,
            stop,
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn deliver(
    registry: &PipelineRegistry,
    checkpoints: &CheckpointStore,
    seen: &mut HashSet<String>,
    seen_order: &mut VecDeque<String>,
    item: SenderItem,
) {
    let now = chrono::Utc::now().timestamp();
    let dedup_key = item.dedup_key();
    let duplicate = seen.contains(&dedup_key);
    if !duplicate {
        let Some(pipeline) = registry.get(&item.config_name) else {
            tracing::warn!(config = %item.config_name, "dropping payload for removed pipeline");
            return;
        };
        if let Err(e) = pipeline.flusher().send(&item.payload) {
            tracing::warn!(config = %item.config_name, error = %e, "flusher send failed, payload dropped");
            return;
        }
        seen.insert(dedup_key.clone());
        seen_order.push_back(dedup_key);
        if seen_order.len() > DEDUP_WINDOW {
            if let Some(evicted) = seen_order.pop_front() {
                seen.remove(&evicted);
            }
        }
    }

    // ACK back-propagation releases the checkpoint either way
    match item.seq {
        Some(seq) => checkpoints.ack_span(&item.file, seq, now),
        None => checkpoints.update_offset(&item.file, item.offset + item.len, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_item(n: u64) -> SenderItem {
        SenderItem {
            config_name: "cfg".to_string(),
            key: 1,
            payload: vec![b'x'],
            file: FileKey::new("cfg", "/f", 1, 1),
            offset: n * 10,
            len: 10,
            seq: None,
        }
    }

    #[test]
    fn test_fifo() {
        let queue = SenderQueue::new(8);
        assert!(queue.push_blocking(test_item(0)));
        assert!(queue.push_blocking(test_item(1)));
        assert_eq!(queue.pop(Duration::from_millis(1)).unwrap().offset, 0);
        assert_eq!(queue.pop(Duration::from_millis(1)).unwrap().offset, 10);
        assert!(queue.pop(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_blocking_push_unblocks_on_pop() {
        let queue = Arc::new(SenderQueue::new(1));
        assert!(queue.push_blocking(test_item(0)));
        let q = Arc::clone(&queue);
        let pusher = std::thread::spawn(move || q.push_blocking(test_item(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1, "second push is blocked");
        let popped = queue.pop(Duration::from_millis(100)).unwrap();
        assert_eq!(popped.offset, 0);
        assert!(pusher.join().unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_fails_push_drains_pop() {
        let queue = SenderQueue::new(4);
        assert!(queue.push_blocking(test_item(0)));
        queue.close();
        assert!(!queue.push_blocking(test_item(1)));
        assert!(queue.pop(Duration::from_millis(1)).is_some());
        assert!(queue.pop(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_dedup_key_shape() {
        let item = SenderItem {
            config_name: "c".into(),
            key: 0,
            payload: vec![],
            file: FileKey::new("c", "/f", 3, 9),
            offset: 4096,
            len: 10,
            seq: None,
        };
        assert_eq!(item.dedup_key(), "c|3:9|4096");
    }
}
