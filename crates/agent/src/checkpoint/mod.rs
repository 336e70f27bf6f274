/// Offset and exactly-once span checkpointing.
pub mod store;

pub use store::{CheckpointIoError, CheckpointStore, FileKey};
