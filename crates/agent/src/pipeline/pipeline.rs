use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{AgentConfig, PipelineConfig};
use crate::meta::ContainerMetaProvider;
use crate::model::EventGroup;
use crate::plugin::{Flusher, InputSpec, PluginRegistry};
use crate::processor::{split, tag, Processor};

use super::context::{GlobalParams, PipelineContext};
use super::error::ConfigError;

/// Stable routing identity of a pipeline's sender queue.
pub type LogstoreKey = u64;

/// One processor plus its pipeline-level accounting.
pub struct ProcessorInstance {
    processor: Box<dyn Processor>,
    plugin_id: String,
    in_events: AtomicU64,
    out_events: AtomicU64,
}

impl ProcessorInstance {
    fn new(processor: Box<dyn Processor>, index: usize) -> Self {
        let plugin_id = format!("{}/{}", processor.name(), index);
        Self {
            processor,
            plugin_id,
            in_events: AtomicU64::new(0),
            out_events: AtomicU64::new(0),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn in_events(&self) -> u64 {
        self.in_events.load(Ordering::Relaxed)
    }

    pub fn out_events(&self) -> u64 {
        self.out_events.load(Ordering::Relaxed)
    }

    /// Events the processor dropped so far.
    pub fn discarded_events(&self) -> u64 {
        self.in_events().saturating_sub(self.out_events())
    }
}

/// Immutable compiled pipeline: input spec, processor chain, flusher.
/// Replaced wholesale by the registry on reconfig; in-flight groups finish
/// on the instance they started with.
pub struct Pipeline {
    name: String,
    ctx: Arc<PipelineContext>,
    input: InputSpec,
    processors: Vec<ProcessorInstance>,
    flusher: Box<dyn Flusher>,
    queue_key: LogstoreKey,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("queue_key", &self.queue_key)
            .finish()
    }
}

impl Pipeline {
    /// Compile a config document. Any error rejects the whole document and
    /// leaves a previously installed pipeline untouched.
    pub fn build(
        config: &PipelineConfig,
        registry: &PluginRegistry,
        agent: &AgentConfig,
    ) -> Result<Self, ConfigError> {
        Self::build_with_meta(config, registry, agent, None)
    }

    /// [`build`](Self::build) with a container metadata provider threaded
    /// into the context; the tag stage resolves container ids against it.
    pub fn build_with_meta(
        config: &PipelineConfig,
        registry: &PluginRegistry,
        agent: &AgentConfig,
        container_meta: Option<Arc<dyn ContainerMetaProvider>>,
    ) -> Result<Self, ConfigError> {
        if config.name.is_empty() {
            return Err(ConfigError::BadDocument("config has no name".to_string()));
        }
        if config.inputs.len() != 1 {
            return Err(ConfigError::BadDocument(format!(
                "config {:?} must have exactly one input, found {}",
                config.name,
                config.inputs.len()
            )));
        }
        if config.flushers.len() != 1 {
            return Err(ConfigError::BadDocument(format!(
                "config {:?} must have exactly one flusher, found {}",
                config.name,
                config.flushers.len()
            )));
        }

        let mut tags: Vec<(String, String)> = config
            .global
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        tags.sort();
        let global = GlobalParams {
            discard_old_interval_secs: agent.discard_old_interval_secs,
            appending_log_position_meta: config.global.appending_log_position_meta,
            enable_exactly_once: config.global.enable_exactly_once || agent.enable_exactly_once,
            priority: config.global.priority,
            agent_tag: agent.agent_tag.clone(),
            tags,
            topic: config.global.topic.clone(),
        };
        let ctx = Arc::new(
            PipelineContext::new(&config.name)
                .with_global(global)
                .with_container_meta(container_meta),
        );

        let input_block = &config.inputs[0];
        let input = InputSpec::parse(&input_block.type_name, &input_block.options)?;

        // Chain shape: implicit line split, configured processors, implicit
        // tagger. The tagger is always the last native stage.
        let mut processors = Vec::with_capacity(config.processors.len() + 2);
        let mut splitter = registry.create_processor(split::NAME)?;
        splitter.init(&serde_json::json!({}), Arc::clone(&ctx))?;
        processors.push(ProcessorInstance::new(splitter, 0));
        for (i, block) in config.processors.iter().enumerate() {
            let mut processor = registry.create_processor(&block.type_name)?;
            processor.init(&block.options, Arc::clone(&ctx))?;
            processors.push(ProcessorInstance::new(processor, i + 1));
        }
        let mut tagger = registry.create_processor(tag::NAME)?;
        tagger.init(&serde_json::json!({}), Arc::clone(&ctx))?;
        processors.push(ProcessorInstance::new(tagger, config.processors.len() + 1));

        let flusher_block = &config.flushers[0];
        let mut flusher = registry.create_flusher(&flusher_block.type_name)?;
        flusher.init(&flusher_block.options, Arc::clone(&ctx))?;

        let mut hasher = DefaultHasher::new();
        flusher.routing_key().hash(&mut hasher);
        let queue_key = hasher.finish();

        Ok(Self {
            name: config.name.clone(),
            ctx,
            input,
            processors,
            flusher,
            queue_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn input(&self) -> &InputSpec {
        &self.input
    }

    pub fn flusher(&self) -> &dyn Flusher {
        self.flusher.as_ref()
    }

    pub fn queue_key(&self) -> LogstoreKey {
        self.queue_key
    }

    pub fn priority(&self) -> u32 {
        self.ctx.global.priority
    }

    pub fn exactly_once(&self) -> bool {
        self.ctx.global.enable_exactly_once
    }

    /// Run the processor chain in order, accounting events in/out around
    /// every stage.
    pub fn process(&self, group: &mut EventGroup) {
        for instance in &self.processors {
            instance
                .in_events
                .fetch_add(group.events().len() as u64, Ordering::Relaxed);
            instance.processor.process(group);
            instance
                .out_events
                .fetch_add(group.events().len() as u64, Ordering::Relaxed);
        }
    }

    pub fn processor_instances(&self) -> &[ProcessorInstance] {
        &self.processors
    }

    pub fn flush_all(&self) {
        if let Err(e) = self.flusher.flush() {
            tracing::warn!(config = %self.name, error = %e, "flusher flush failed");
        }
    }
}
