/// Event model: the arena contract and the types flowing through a pipeline.
pub mod arena;
pub mod event;
pub mod group;

pub use arena::{keys, SourceBuffer, StrRef};
pub use event::LogEvent;
pub use group::{EventGroup, GroupMetaKey};
