use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::pipeline::LogstoreKey;
use crate::util::{AlarmSink, AlarmType};

/// How long a worker blocks on an empty queue before polling again.
pub const POP_WAIT: Duration = Duration::from_millis(100);

/// Identity and position of the read that produced a buffer.
#[derive(Debug, Clone, Default)]
pub struct SourceMeta {
    pub path: String,
    pub dev: u64,
    pub inode: u64,
    pub offset: u64,
    /// Container runtime framing (`"1"` containerd, `"2"` docker json),
    /// absent for plain files.
    pub log_format: Option<String>,
    /// Runtime container id for container-sourced reads.
    pub container_id: Option<String>,
}

/// One raw read buffer queued for processing.
#[derive(Debug)]
pub struct ProcessItem {
    pub config_name: String,
    pub key: LogstoreKey,
    pub data: Bytes,
    pub source: SourceMeta,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<ProcessItem>,
    capacity: usize,
    priority: u32,
}

/// Per-key bounded FIFOs feeding the worker pool.
///
/// A key is pinned to worker `key % N`, which preserves per-key submission
/// order without per-key locks. `hold_on` drains the pool to quiescence
/// for reconfiguration; `flush_out` drains with a deadline at shutdown.
pub struct ProcessQueueManager {
    state: Mutex<HashMap<LogstoreKey, QueueState>>,
    /// One wakeup channel per worker, all guarding `state`.
    worker_signals: Vec<Condvar>,
    hold: AtomicBool,
    in_flight: AtomicUsize,
    workers: usize,
    default_capacity: usize,
    alarm: AlarmSink,
}

impl ProcessQueueManager {
    pub fn new(workers: usize, default_capacity: usize) -> Self {
        let workers = workers.max(1);
        Self {
            state: Mutex::new(HashMap::new()),
            worker_signals: (0..workers).map(|_| Condvar::new()).collect(),
            hold: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            workers,
            default_capacity: default_capacity.max(1),
            alarm: AlarmSink::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn worker_for(&self, key: LogstoreKey) -> usize {
        (key % self.workers as u64) as usize
    }

    /// Declare a queue's priority ahead of pushes (idempotent).
    pub fn ensure_queue(&self, key: LogstoreKey, priority: u32, capacity: Option<usize>) {
        let mut state = self.state.lock();
        let default_capacity = self.default_capacity;
        let queue = state.entry(key).or_insert_with(|| QueueState {
            items: VecDeque::new(),
            capacity: capacity.unwrap_or(default_capacity),
            priority,
        });
        queue.priority = priority;
        if let Some(capacity) = capacity {
            queue.capacity = capacity;
        }
    }

    /// False on overflow; the reader retries with backoff.
    pub fn push(&self, item: ProcessItem) -> bool {
        let worker = self.worker_for(item.key);
        let mut state = self.state.lock();
        let default_capacity = self.default_capacity;
        let queue = state.entry(item.key).or_insert_with(|| QueueState {
            items: VecDeque::new(),
            capacity: default_capacity,
            priority: 0,
        });
        if queue.items.len() >= queue.capacity {
            drop(state);
            self.alarm.send(
                AlarmType::ProcessQueueFull,
                &format!("process queue full for config {}", item.config_name),
            );
            return false;
        }
        queue.items.push_back(item);
        drop(state);
        self.worker_signals[worker].notify_one();
        true
    }

    /// Pop the next ready buffer for this worker: highest priority first,
    /// FIFO within a key. Blocks up to [`POP_WAIT`], then returns None.
    pub fn pop(&self, worker: usize) -> Option<ProcessItem> {
        let deadline = Instant::now() + POP_WAIT;
        let mut state = self.state.lock();
        loop {
            if !self.hold.load(Ordering::Acquire) {
                let best_key = state
                    .iter()
                    .filter(|(key, queue)| {
                        self.worker_for(**key) == worker && !queue.items.is_empty()
                    })
                    .max_by_key(|(_, queue)| queue.priority)
                    .map(|(key, _)| *key);
                if let Some(key) = best_key {
                    let item = state
                        .get_mut(&key)
                        .and_then(|queue| queue.items.pop_front());
                    if item.is_some() {
                        self.in_flight.fetch_add(1, Ordering::AcqRel);
                        return item;
                    }
                }
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return None;
            }
            self.worker_signals[worker].wait_for(&mut state, timeout);
        }
    }

    /// Worker bookkeeping after a popped buffer is fully handed off.
    pub fn complete(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Block pops and wait until every worker is parked between groups.
    pub fn hold_on(&self) {
        self.hold.store(true, Ordering::Release);
        for signal in &self.worker_signals {
            signal.notify_all();
        }
        while self.in_flight.load(Ordering::Acquire) != 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        tracing::debug!("process queues held, workers quiescent");
    }

    pub fn resume(&self) {
        self.hold.store(false, Ordering::Release);
        for signal in &self.worker_signals {
            signal.notify_all();
        }
    }

    pub fn is_held(&self) -> bool {
        self.hold.load(Ordering::Acquire)
    }

    /// Wait for every queue to drain and every worker to finish, up to
    /// `wait`. Returns whether the drain completed.
    pub fn flush_out(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.total_len() == 0 && self.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn total_len(&self) -> usize {
        self.state.lock().values().map(|q| q.items.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(key: LogstoreKey, tag: &str) -> ProcessItem {
        ProcessItem {
            config_name: tag.to_string(),
            key,
            data: Bytes::from(tag.as_bytes().to_vec()),
            source: SourceMeta::default(),
        }
    }

    #[test]
    fn test_push_pop_fifo_per_key() {
        let manager = ProcessQueueManager::new(2, 16);
        assert!(manager.push(item(0, "a")));
        assert!(manager.push(item(0, "b")));
        assert!(manager.push(item(2, "c")));

        // keys 0 and 2 both map to worker 0
        let first = manager.pop(0).unwrap();
        manager.complete();
        let second = manager.pop(0).unwrap();
        manager.complete();
        let third = manager.pop(0).unwrap();
        manager.complete();
        let order: Vec<String> = vec![first.config_name, second.config_name, third.config_name];
        let key0: Vec<&String> = order.iter().filter(|n| *n == "a" || *n == "b").collect();
        assert_eq!(key0, vec!["a", "b"], "per-key order is FIFO");
        assert!(order.contains(&"c".to_string()));
    }

    #[test]
    fn test_pop_respects_worker_assignment() {
        let manager = ProcessQueueManager::new(2, 16);
        assert!(manager.push(item(1, "odd")));
        assert!(manager.pop(0).is_none(), "key 1 belongs to worker 1");
        let got = manager.pop(1).unwrap();
        assert_eq!(got.config_name, "odd");
        manager.complete();
    }

    #[test]
    fn test_overflow_returns_false() {
        let manager = ProcessQueueManager::new(1, 2);
        assert!(manager.push(item(0, "x")));
        assert!(manager.push(item(0, "y")));
        assert!(!manager.push(item(0, "z")));
    }

    #[test]
    fn test_priority_drained_first() {
        let manager = ProcessQueueManager::new(1, 16);
        manager.ensure_queue(0, 0, None);
        manager.ensure_queue(1, 5, None);
        assert!(manager.push(item(0, "low")));
        assert!(manager.push(item(1, "high")));
        let got = manager.pop(0).unwrap();
        assert_eq!(got.config_name, "high");
        manager.complete();
    }

    #[test]
    fn test_hold_on_blocks_pop() {
        let manager = Arc::new(ProcessQueueManager::new(1, 16));
        assert!(manager.push(item(0, "x")));
        manager.hold_on();
        assert!(manager.is_held());
        assert!(manager.pop(0).is_none());
        manager.resume();
        assert!(manager.pop(0).is_some());
        manager.complete();
    }

    #[test]
    fn test_flush_out_drains() {
        let manager = Arc::new(ProcessQueueManager::new(1, 16));
        assert!(manager.push(item(0, "x")));
        let m = Arc::clone(&manager);
        let handle = std::thread::spawn(move || {
            let popped = m.pop(0);
            assert!(popped.is_some());
            std::thread::sleep(Duration::from_millis(20));
            m.complete();
        });
        assert!(manager.flush_out(Duration::from_secs(2)));
        handle.join().unwrap();
        assert_eq!(manager.total_len(), 0);
    }
}
