use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::pipeline::ConfigError;
use crate::processor::parse_options;

pub const INPUT_FILE: &str = "input_file";
pub const INPUT_CONTAINER_STDIO: &str = "input_container_stdio";

/// Validated input descriptor. The core does not read files or container
/// streams itself; the external reader consumes this spec and feeds raw
/// buffers into the process queue under the pipeline's config name.
#[derive(Debug, Clone)]
pub enum InputSpec {
    File(InputFileOptions),
    ContainerStdio(InputContainerStdioOptions),
}

impl InputSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            InputSpec::File(_) => INPUT_FILE,
            InputSpec::ContainerStdio(_) => INPUT_CONTAINER_STDIO,
        }
    }

    pub fn parse(type_name: &str, options: &Value) -> Result<Self, ConfigError> {
        match type_name {
            INPUT_FILE => {
                let opts: InputFileOptions = parse_options(INPUT_FILE, options)?;
                if opts.file_paths.is_empty() {
                    return Err(ConfigError::MissingParam {
                        plugin: INPUT_FILE,
                        param: "FilePaths",
                    });
                }
                Ok(InputSpec::File(opts))
            }
            INPUT_CONTAINER_STDIO => {
                let opts: InputContainerStdioOptions = parse_options(INPUT_CONTAINER_STDIO, options)?;
                if !opts.stdout && !opts.stderr {
                    return Err(ConfigError::InvalidParam {
                        plugin: INPUT_CONTAINER_STDIO,
                        param: "Stdout/Stderr",
                        reason: "at least one stream must be enabled".to_string(),
                    });
                }
                Ok(InputSpec::ContainerStdio(opts))
            }
            other => Err(ConfigError::UnknownPlugin {
                category: "input",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InputFileOptions {
    pub file_paths: Vec<String>,
    pub max_dir_search_depth: u32,
    pub tailing_all_matched_files: bool,
    pub enable_container_discovery: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InputContainerStdioOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub container_filters: HashMap<String, String>,
}

impl Default for InputContainerStdioOptions {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            container_filters: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_input_requires_paths() {
        let err = InputSpec::parse(INPUT_FILE, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ConfigError::MissingParam { .. }));

        let spec = InputSpec::parse(
            INPUT_FILE,
            &serde_json::json!({"FilePaths": ["/var/log/*.log"]}),
        )
        .unwrap();
        assert!(matches!(spec, InputSpec::File(_)));
    }

    #[test]
    fn test_container_input_needs_a_stream() {
        let err = InputSpec::parse(
            INPUT_CONTAINER_STDIO,
            &serde_json::json!({"Stdout": false, "Stderr": false}),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParam { .. }));
    }

    #[test]
    fn test_unknown_input_rejected() {
        let err = InputSpec::parse("input_bogus", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPlugin { .. }));
    }
}
