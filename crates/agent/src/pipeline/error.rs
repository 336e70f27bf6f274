use thiserror::Error;

/// Rejections raised while compiling a config document into a pipeline.
/// A config error is reported and the previously installed pipeline (if
/// any) stays in place.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("plugin {plugin}: invalid options: {source}")]
    InvalidOptions {
        plugin: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("plugin {plugin}: missing required param {param}")]
    MissingParam {
        plugin: &'static str,
        param: &'static str,
    },

    #[error("plugin {plugin}: param {param} is not valid: {reason}")]
    InvalidParam {
        plugin: &'static str,
        param: &'static str,
        reason: String,
    },

    #[error("plugin {plugin}: bad regex {pattern:?}: {source}")]
    BadRegex {
        plugin: &'static str,
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("unknown {category} plugin type {name:?}")]
    UnknownPlugin { category: &'static str, name: String },

    #[error("config document is not valid: {0}")]
    BadDocument(String),

    #[error("failed to load dynamic plugin: {0}")]
    PluginLoad(String),
}

impl ConfigError {
    pub fn bad_regex(plugin: &'static str, pattern: &str, source: regex::Error) -> Self {
        ConfigError::BadRegex {
            plugin,
            pattern: pattern.to_string(),
            source: Box::new(source),
        }
    }
}
