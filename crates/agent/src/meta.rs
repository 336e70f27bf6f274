use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Metadata attached to container-sourced events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMeta {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Lookup seam consumed by the tag stage: a pipeline built with a provider
/// resolves a group's container id into name/image/label fields. The
/// runtime client that feeds the cache lives outside the core.
pub trait ContainerMetaProvider: Send + Sync + std::fmt::Debug {
    fn lookup(&self, container_id: &str) -> Option<Arc<ContainerMeta>>;
}

/// Single-writer / many-reader cache with a soft TTL.
///
/// One refresh thread upserts entries; taggers read concurrently under the
/// shared lock. Reads past the TTL still return the stale entry, they only
/// mark it for the refresher.
#[derive(Debug)]
pub struct ContainerMetaCache {
    entries: RwLock<HashMap<String, (Arc<ContainerMeta>, Instant)>>,
    ttl: Duration,
}

impl ContainerMetaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Refresh-thread path.
    pub fn upsert(&self, meta: ContainerMeta) {
        let id = meta.id.clone();
        self.entries.write().insert(id, (Arc::new(meta), Instant::now()));
    }

    pub fn remove(&self, container_id: &str) {
        self.entries.write().remove(container_id);
    }

    /// Ids whose soft TTL has lapsed; the refresher re-fetches these.
    pub fn stale_ids(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ContainerMetaProvider for ContainerMetaCache {
    fn lookup(&self, container_id: &str) -> Option<Arc<ContainerMeta>> {
        self.entries.read().get(container_id).map(|(meta, _)| Arc::clone(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, name: &str) -> ContainerMeta {
        ContainerMeta {
            id: id.to_string(),
            name: name.to_string(),
            image: "app:latest".to_string(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_lookup_after_upsert() {
        let cache = ContainerMetaCache::new(Duration::from_secs(30));
        cache.upsert(meta("c1", "web"));
        let got = cache.lookup("c1").unwrap();
        assert_eq!(got.name, "web");
        assert!(cache.lookup("c2").is_none());
    }

    #[test]
    fn test_stale_reads_still_served() {
        let cache = ContainerMetaCache::new(Duration::from_millis(1));
        cache.upsert(meta("c1", "web"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.lookup("c1").is_some(), "soft TTL never blocks readers");
        assert_eq!(cache.stale_ids(), vec!["c1".to_string()]);
    }

    #[test]
    fn test_remove() {
        let cache = ContainerMetaCache::new(Duration::from_secs(30));
        cache.upsert(meta("c1", "web"));
        cache.remove("c1");
        assert!(cache.is_empty());
    }
}
