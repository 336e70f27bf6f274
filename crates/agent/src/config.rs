use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::ConfigError;

/// Process-level configuration.
/// Priority: Environment Variables > Config File > Defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory of pipeline config documents (`*.json`).
    pub config_dir: String,
    /// Directory scanned for dynamic processor libraries.
    pub plugin_dir: String,
    pub checkpoint_path: String,
    pub checkpoint_dump_interval_secs: u64,
    /// Worker pool size.
    pub process_threads: usize,
    /// Per-key process queue capacity (soft limit).
    pub process_queue_capacity: usize,
    pub sender_queue_capacity: usize,
    pub batch_send_interval_secs: u64,
    /// Drain deadline for the process queue at shutdown.
    pub flush_timeout_ms: u64,
    /// Parsed event times older than this are discarded. 0 disables.
    pub discard_old_interval_secs: i64,
    /// Default for pipelines that do not set EnableExactlyOnce themselves.
    pub enable_exactly_once: bool,
    pub exactly_once_concurrency: usize,
    /// Written as `__user_defined_id__` by the tag stage when set.
    pub agent_tag: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_dir: "/etc/logpipe/pipelines".to_string(),
            plugin_dir: "/usr/lib/logpipe/plugins".to_string(),
            checkpoint_path: "/var/lib/logpipe/checkpoints.json".to_string(),
            checkpoint_dump_interval_secs: 30,
            process_threads: 2,
            process_queue_capacity: 20,
            sender_queue_capacity: 128,
            batch_send_interval_secs: 3,
            flush_timeout_ms: 5000,
            discard_old_interval_secs: 43200,
            enable_exactly_once: false,
            exactly_once_concurrency: 512,
            agent_tag: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from file or environment variables.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path =
            std::env::var("AGENT_CONFIG_FILE").unwrap_or_else(|_| "/etc/logpipe/agent.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            tracing::info!("Loading configuration from: {}", config_path);
            Self::from_file(&config_path)?
        } else {
            tracing::info!("Config file not found at {}, using defaults", config_path);
            Self::default()
        };

        // Environment variables override file config for critical settings
        if let Ok(dir) = std::env::var("AGENT_CONFIG_DIR") {
            config.config_dir = dir;
        }
        if let Ok(dir) = std::env::var("AGENT_PLUGIN_DIR") {
            config.plugin_dir = dir;
        }
        if let Ok(path) = std::env::var("AGENT_CHECKPOINT_PATH") {
            config.checkpoint_path = path;
        }
        if let Ok(threads) = std::env::var("AGENT_PROCESS_THREADS") {
            if let Ok(threads) = threads.parse() {
                config.process_threads = threads;
            }
        }
        if let Ok(tag) = std::env::var("AGENT_TAG") {
            config.agent_tag = Some(tag);
        }

        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration values. Fast, no IO.
    pub fn validate(&self) -> Result<(), String> {
        if self.process_threads == 0 {
            return Err("process_threads must be > 0".to_string());
        }
        if self.process_queue_capacity == 0 {
            return Err("process_queue_capacity must be > 0".to_string());
        }
        if self.sender_queue_capacity == 0 {
            return Err("sender_queue_capacity must be > 0".to_string());
        }
        if self.batch_send_interval_secs == 0 {
            return Err("batch_send_interval_secs must be > 0".to_string());
        }
        if self.checkpoint_dump_interval_secs == 0 {
            return Err("checkpoint_dump_interval_secs must be > 0".to_string());
        }
        if !(1..=4096).contains(&self.exactly_once_concurrency) {
            return Err("exactly_once_concurrency must be within 1..=4096".to_string());
        }
        if self.config_dir.is_empty() {
            return Err("config_dir must not be empty".to_string());
        }
        Ok(())
    }
}

// ── pipeline config document ────────────────────────────────────

/// One plugin entry: `{"Type": "<name>", ...typed options}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginBlock {
    #[serde(rename = "Type")]
    pub type_name: String,
    #[serde(flatten)]
    pub options: serde_json::Value,
}

/// The `global` section of a config document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct GlobalOptions {
    pub topic_type: Option<String>,
    pub topic: Option<String>,
    pub enable_exactly_once: bool,
    pub appending_log_position_meta: bool,
    pub priority: u32,
    pub tags: BTreeMap<String, String>,
}

/// A whole config document, applied atomically under its name.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<PluginBlock>,
    #[serde(default)]
    pub processors: Vec<PluginBlock>,
    #[serde(default)]
    pub flushers: Vec<PluginBlock>,
    #[serde(default)]
    pub global: GlobalOptions,
}

impl PipelineConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(data).map_err(|e| ConfigError::BadDocument(e.to_string()))
    }
}

/// Read every `*.json` document in a directory. Bad files are reported
/// per-file so one broken config cannot block the rest.
pub fn load_pipeline_configs(dir: &Path) -> Vec<(PathBuf, Result<PipelineConfig, ConfigError>)> {
    let mut results = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "pipeline config directory is not readable");
            return results;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|ext| ext == "json") != Some(true) {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(|e| ConfigError::BadDocument(format!("cannot read {}: {e}", path.display())))
            .and_then(|data| PipelineConfig::from_json(&data));
        results.push((path, parsed));
    }
    results.sort_by(|(a, _), (b, _)| a.cmp(b));
    results
}
