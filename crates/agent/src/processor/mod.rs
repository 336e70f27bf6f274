/// Native processors and the processor seam.
///
/// Every stage implements [`Processor`]: a fallible `init` taking the typed
/// options from the config document and the pipeline context, then an
/// infallible `process` that mutates the event group in place. Parse errors
/// are per-event: counted and alarmed, never aborting a pipeline.
pub mod apsara;
pub mod common;
pub mod container_log;
pub mod delimiter;
pub mod desensitize;
pub mod filter;
pub mod json;
pub mod multiline;
pub mod regex_parse;
pub mod split;
pub mod tag;
pub mod timestamp;

use std::sync::Arc;

use serde_json::Value;

use crate::model::EventGroup;
use crate::pipeline::{ConfigError, PipelineContext};

pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError>;

    fn process(&self, group: &mut EventGroup);
}

/// Deserialize a plugin's option block, tolerating unknown fields the way
/// the config document allows.
pub fn parse_options<T: serde::de::DeserializeOwned>(
    plugin: &'static str,
    config: &Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(config.clone())
        .map_err(|source| ConfigError::InvalidOptions { plugin, source })
}
