use std::sync::Arc;

use crate::meta::ContainerMetaProvider;
use crate::util::AlarmSink;

/// Per-pipeline settings resolved from the config document's `global`
/// section plus agent-level defaults.
#[derive(Debug, Clone)]
pub struct GlobalParams {
    /// Parsed event times older than this many seconds are dropped as
    /// history data. 0 disables the check.
    pub discard_old_interval_secs: i64,
    /// Attach `__file_offset__` to every event in the tag stage.
    pub appending_log_position_meta: bool,
    pub enable_exactly_once: bool,
    /// Higher priorities are drained first by the process queue.
    pub priority: u32,
    /// Agent-level tag written as `__user_defined_id__`.
    pub agent_tag: Option<String>,
    /// Additional user tags attached by the tag stage.
    pub tags: Vec<(String, String)>,
    pub topic: Option<String>,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            discard_old_interval_secs: 43200,
            appending_log_position_meta: false,
            enable_exactly_once: false,
            priority: 0,
            agent_tag: None,
            tags: Vec::new(),
            topic: None,
        }
    }
}

/// Everything a processor needs from its owning pipeline: the config name
/// for diagnostics, the alarm sink, the resolved global parameters, and
/// the container metadata provider the tag stage resolves ids against.
/// Passed to every processor at init so no stage reaches for globals.
#[derive(Debug)]
pub struct PipelineContext {
    pub config_name: String,
    pub alarm: Arc<AlarmSink>,
    pub global: GlobalParams,
    pub container_meta: Option<Arc<dyn ContainerMetaProvider>>,
}

impl PipelineContext {
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            alarm: Arc::new(AlarmSink::new()),
            global: GlobalParams::default(),
            container_meta: None,
        }
    }

    pub fn with_global(mut self, global: GlobalParams) -> Self {
        self.global = global;
        self
    }

    pub fn with_container_meta(mut self, provider: Option<Arc<dyn ContainerMetaProvider>>) -> Self {
        self.container_meta = provider;
        self
    }
}
