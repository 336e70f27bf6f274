/// Buffer routing: per-key process queues, the worker pool, and the
/// sender queue with ACK feedback.
pub mod process_queue;
pub mod sender;
pub mod worker;

pub use process_queue::{ProcessItem, ProcessQueueManager, SourceMeta};
pub use sender::{Sender, SenderItem, SenderQueue};
pub use worker::WorkerPool;
