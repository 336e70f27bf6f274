/// Plugin surface: the registry, input descriptors, flushers, and the
/// C-ABI loader for out-of-tree processors.
pub mod dynamic;
pub mod flusher;
pub mod input;
pub mod registry;

pub use flusher::{Flusher, FlushError};
pub use input::InputSpec;
pub use registry::PluginRegistry;
