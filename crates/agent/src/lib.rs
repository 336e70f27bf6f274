// Module structure for the log collection agent core.

// Event model and shared utilities
pub mod meta;
pub mod model;
pub mod util;

// Processing pipeline
pub mod pipeline;
pub mod plugin;
pub mod processor;

// Runtime
pub mod checkpoint;
pub mod config;
pub mod queue;
