use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::pipeline::Pipeline;

/// Installed pipelines keyed by config name.
///
/// Reconfiguration is an atomic swap: readers clone the `Arc` under a
/// short read lock and keep processing on the old instance until their
/// group is done; the old pipeline drops with its last reference.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.read().get(name).cloned()
    }

    /// Install or replace; returns the previous instance if any.
    pub fn install(&self, pipeline: Arc<Pipeline>) -> Option<Arc<Pipeline>> {
        let name = pipeline.name().to_string();
        let old = self.pipelines.write().insert(name.clone(), pipeline);
        match &old {
            Some(_) => tracing::info!(config = %name, "pipeline replaced"),
            None => tracing::info!(config = %name, "pipeline installed"),
        }
        old
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Pipeline>> {
        let old = self.pipelines.write().remove(name);
        if old.is_some() {
            tracing::info!(config = %name, "pipeline removed");
        }
        old
    }

    pub fn names(&self) -> Vec<String> {
        self.pipelines.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.read().is_empty()
    }

    pub fn flush_all(&self) {
        let pipelines: Vec<Arc<Pipeline>> = self.pipelines.read().values().cloned().collect();
        for pipeline in pipelines {
            pipeline.flush_all();
        }
    }
}
