use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::pipeline::ConfigError;
use crate::processor::{
    apsara, container_log, delimiter, desensitize, filter, json, multiline, regex_parse, split, tag,
    timestamp, Processor,
};

use super::dynamic::DynamicProcessorLib;
use super::flusher::{Flusher, FlusherBlackhole, FlusherFile, FLUSHER_BLACKHOLE, FLUSHER_FILE};
use super::input::{INPUT_CONTAINER_STDIO, INPUT_FILE};

type ProcessorFactory = fn() -> Box<dyn Processor>;
type FlusherFactory = fn() -> Box<dyn Flusher>;

enum ProcessorCreator {
    Native(ProcessorFactory),
    Dynamic(Arc<DynamicProcessorLib>),
}

/// Central plugin map: `(category, type name) -> factory`. Native plugins
/// are registered at construction; dynamic processors join via
/// [`load_dynamic_plugins`](Self::load_dynamic_plugins), and the registry
/// keeps their library handles alive until process exit.
pub struct PluginRegistry {
    processors: HashMap<String, ProcessorCreator>,
    flushers: HashMap<String, FlusherFactory>,
    inputs: Vec<&'static str>,
}

impl PluginRegistry {
    /// Registry with every native plugin installed.
    pub fn with_natives() -> Self {
        let mut registry = Self {
            processors: HashMap::new(),
            flushers: HashMap::new(),
            inputs: vec![INPUT_FILE, INPUT_CONTAINER_STDIO],
        };
        registry.register_native_processor(split::NAME, split::SplitLogString::boxed);
        registry.register_native_processor(container_log::NAME, container_log::ContainerLogParser::boxed);
        registry.register_native_processor(multiline::NAME, multiline::MultilineMerger::boxed);
        registry.register_native_processor(apsara::NAME, apsara::ApsaraParser::boxed);
        registry.register_native_processor(regex_parse::NAME, regex_parse::RegexParser::boxed);
        registry.register_native_processor(json::NAME, json::JsonParser::boxed);
        registry.register_native_processor(delimiter::NAME, delimiter::DelimiterParser::boxed);
        registry.register_native_processor(timestamp::NAME, timestamp::TimestampParser::boxed);
        registry.register_native_processor(desensitize::NAME, desensitize::Desensitizer::boxed);
        registry.register_native_processor(filter::NAME, filter::RegexFilter::boxed);
        registry.register_native_processor(tag::NAME, tag::Tagger::boxed);
        registry.register_native_flusher(FLUSHER_BLACKHOLE, FlusherBlackhole::boxed);
        registry.register_native_flusher(FLUSHER_FILE, FlusherFile::boxed);
        registry
    }

    fn register_native_processor(&mut self, name: &str, factory: ProcessorFactory) {
        self.processors
            .insert(name.to_string(), ProcessorCreator::Native(factory));
    }

    fn register_native_flusher(&mut self, name: &str, factory: FlusherFactory) {
        self.flushers.insert(name.to_string(), factory);
    }

    /// Load every shared library in `dir` as a dynamic processor. A bad
    /// library is skipped with an error; it only becomes fatal for a
    /// pipeline that references it.
    pub fn load_dynamic_plugins(&mut self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "plugin directory is not readable");
                return 0;
            }
        };
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_lib = path
                .extension()
                .map(|ext| ext == "so" || ext == "dylib")
                .unwrap_or(false);
            if !is_lib {
                continue;
            }
            match DynamicProcessorLib::load(&path) {
                Ok(lib) => {
                    let name = lib.plugin_name().to_string();
                    self.processors
                        .insert(name, ProcessorCreator::Dynamic(Arc::new(lib)));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "refusing dynamic processor");
                }
            }
        }
        loaded
    }

    pub fn create_processor(&self, name: &str) -> Result<Box<dyn Processor>, ConfigError> {
        match self.processors.get(name) {
            Some(ProcessorCreator::Native(factory)) => Ok(factory()),
            Some(ProcessorCreator::Dynamic(lib)) => Ok(lib.instantiate()),
            None => Err(ConfigError::UnknownPlugin {
                category: "processor",
                name: name.to_string(),
            }),
        }
    }

    pub fn create_flusher(&self, name: &str) -> Result<Box<dyn Flusher>, ConfigError> {
        match self.flushers.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(ConfigError::UnknownPlugin {
                category: "flusher",
                name: name.to_string(),
            }),
        }
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains(&name)
    }

    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natives_registered() {
        let registry = PluginRegistry::with_natives();
        for name in [
            "split_log_string_native",
            "parse_container_log_native",
            "merge_multiline_log_native",
            "parse_apsara_native",
            "parse_regex_native",
            "parse_json_native",
            "parse_delimiter_native",
            "parse_timestamp_native",
            "desensitize_native",
            "filter_regex_native",
            "tag_native",
        ] {
            assert!(registry.create_processor(name).is_ok(), "missing {name}");
        }
        assert!(registry.create_flusher("flusher_blackhole").is_ok());
        assert!(registry.create_flusher("flusher_file").is_ok());
        assert!(registry.has_input("input_file"));
        assert!(registry.has_input("input_container_stdio"));
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let registry = PluginRegistry::with_natives();
        assert!(matches!(
            registry.create_processor("processor_bogus"),
            Err(ConfigError::UnknownPlugin { .. })
        ));
        assert!(matches!(
            registry.create_flusher("flusher_bogus"),
            Err(ConfigError::UnknownPlugin { .. })
        ));
        assert!(!registry.has_input("input_bogus"));
    }

    #[test]
    fn test_missing_plugin_dir_is_not_fatal() {
        let mut registry = PluginRegistry::with_natives();
        assert_eq!(registry.load_dynamic_plugins(Path::new("/nonexistent")), 0);
    }
}
