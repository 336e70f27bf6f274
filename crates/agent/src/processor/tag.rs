use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::Value;

use super::Processor;
use crate::meta::ContainerMetaProvider;
use crate::model::{keys, EventGroup, GroupMetaKey, StrRef};
use crate::pipeline::{ConfigError, PipelineContext};

pub const NAME: &str = "tag_native";

/// Host identity resolved once per process.
pub struct HostInfo {
    pub name: String,
    pub ip: String,
}

pub static HOST_INFO: Lazy<HostInfo> = Lazy::new(|| HostInfo {
    name: hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string()),
    ip: detect_host_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
});

/// Routing-table trick: connecting a UDP socket picks the outbound
/// interface without sending a packet.
fn detect_host_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Always the last native stage. Attaches the reserved keys (file path,
/// agent tag, file offset, user tags) to events, host identity to the
/// group, and container name/image/labels resolved through the pipeline's
/// metadata provider. Running it twice changes nothing.
#[derive(Debug, Default)]
pub struct Tagger {
    agent_tag: Option<String>,
    user_tags: Vec<(String, String)>,
    log_position_meta: bool,
    container_meta: Option<Arc<dyn ContainerMetaProvider>>,
}

impl Tagger {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }
}

impl Processor for Tagger {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, _config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        self.agent_tag = ctx.global.agent_tag.clone();
        self.user_tags = ctx.global.tags.clone();
        self.log_position_meta = ctx.global.appending_log_position_meta;
        self.container_meta = ctx.container_meta.clone();
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        group.set_metadata(GroupMetaKey::HostName, HOST_INFO.name.as_bytes());
        group.set_metadata(GroupMetaKey::HostIp, HOST_INFO.ip.as_bytes());
        if let Some(tag) = &self.agent_tag {
            group.set_metadata(GroupMetaKey::AgentTag, tag.as_bytes());
        }

        let path = group.metadata_ref(GroupMetaKey::LogFilePath);
        let group_offset: Option<u64> = group
            .metadata(GroupMetaKey::LogFileOffset)
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse().ok());
        let raw_base = group.raw_base();

        let container = self.container_meta.as_ref().and_then(|provider| {
            let id = group.metadata(GroupMetaKey::ContainerId)?;
            let id = std::str::from_utf8(id).ok()?;
            provider.lookup(id)
        });
        let container_refs = container.map(|meta| {
            let buf = group.buf_mut();
            let name = (buf.alloc(b"_container_name_"), buf.alloc(meta.name.as_bytes()));
            let image = (buf.alloc(b"_image_name_"), buf.alloc(meta.image.as_bytes()));
            let labels: Vec<(StrRef, StrRef)> = meta
                .labels
                .iter()
                .map(|(k, v)| (buf.alloc(k.as_bytes()), buf.alloc(v.as_bytes())))
                .collect();
            (name, image, labels)
        });

        let agent_tag_ref = self
            .agent_tag
            .as_ref()
            .map(|t| group.buf_mut().alloc(t.as_bytes()));
        let user_tag_refs: Vec<_> = self
            .user_tags
            .iter()
            .map(|(k, v)| {
                let kr = group.buf_mut().alloc(k.as_bytes());
                let vr = group.buf_mut().alloc(v.as_bytes());
                (kr, vr)
            })
            .collect();

        let (buf, events) = group.split_mut();
        for event in events.iter_mut() {
            if let Some(path) = path {
                event.set_content(buf, keys::FILE_PATH, path);
            }
            if let Some(tag) = agent_tag_ref {
                event.set_content(buf, keys::USER_DEFINED_ID, tag);
            }
            for (kr, vr) in &user_tag_refs {
                event.set_content(buf, *kr, *vr);
            }
            if let Some((name, image, labels)) = &container_refs {
                event.set_content(buf, name.0, name.1);
                event.set_content(buf, image.0, image.1);
                for (kr, vr) in labels {
                    event.set_content(buf, *kr, *vr);
                }
            }
            if self.log_position_meta {
                if let (Some(base_offset), Some(content)) =
                    (group_offset, event.get_content(buf, b"content"))
                {
                    let event_offset = base_offset + content.offset().saturating_sub(raw_base) as u64;
                    let value = buf.alloc(event_offset.to_string().as_bytes());
                    event.set_content(buf, keys::FILE_OFFSET, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ContainerMeta, ContainerMetaCache};
    use crate::model::LogEvent;
    use crate::pipeline::GlobalParams;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::time::Duration;

    fn tagger(global: GlobalParams) -> Tagger {
        let mut t = Tagger::default();
        let ctx = Arc::new(PipelineContext::new("test-config").with_global(global));
        t.init(&serde_json::json!({}), ctx).unwrap();
        t
    }

    fn field(group: &EventGroup, idx: usize, key: &[u8]) -> Option<Vec<u8>> {
        group.events()[idx]
            .get_content(group.buf(), key)
            .map(|s| group.buf().get(s).to_vec())
    }

    #[test]
    fn test_reserved_keys_written() {
        let t = tagger(GlobalParams {
            agent_tag: Some("agent-007".to_string()),
            tags: vec![("env".to_string(), "prod".to_string())],
            ..GlobalParams::default()
        });
        let mut g = EventGroup::from_raw(&Bytes::from_static(b"line"));
        g.set_metadata(GroupMetaKey::LogFilePath, b"/var/log/app.log");
        t.process(&mut g);

        assert_eq!(field(&g, 0, b"__path__").unwrap(), b"/var/log/app.log");
        assert_eq!(field(&g, 0, b"__user_defined_id__").unwrap(), b"agent-007");
        assert_eq!(field(&g, 0, b"env").unwrap(), b"prod");
        assert!(g.metadata(GroupMetaKey::HostName).is_some());
        assert!(g.metadata(GroupMetaKey::HostIp).is_some());
        assert_eq!(g.metadata(GroupMetaKey::AgentTag).unwrap(), b"agent-007");
    }

    #[test]
    fn test_disabled_features_absent() {
        let t = tagger(GlobalParams::default());
        let mut g = EventGroup::from_raw(&Bytes::from_static(b"line"));
        t.process(&mut g);
        assert!(field(&g, 0, b"__user_defined_id__").is_none());
        assert!(field(&g, 0, b"__file_offset__").is_none());
        assert!(field(&g, 0, b"__path__").is_none());
    }

    #[test]
    fn test_file_offset_per_event() {
        let t = tagger(GlobalParams {
            appending_log_position_meta: true,
            ..GlobalParams::default()
        });
        let mut g = EventGroup::from_raw(&Bytes::from_static(b"aaa\nbb"));
        g.set_metadata(GroupMetaKey::LogFileOffset, b"1000");
        // split the raw event into two lines the way the split stage does
        {
            let (buf, events) = g.split_mut();
            let raw = events[0].get_content(buf, b"content").unwrap();
            let first = raw.slice(0, 3);
            let second = raw.slice(4, 6);
            events.clear();
            events.push(LogEvent::with_content(keys::DEFAULT_CONTENT, first));
            events.push(LogEvent::with_content(keys::DEFAULT_CONTENT, second));
        }
        t.process(&mut g);
        assert_eq!(field(&g, 0, b"__file_offset__").unwrap(), b"1000");
        assert_eq!(field(&g, 1, b"__file_offset__").unwrap(), b"1004");
    }

    #[test]
    fn test_container_meta_enrichment() {
        let cache = Arc::new(ContainerMetaCache::new(Duration::from_secs(30)));
        cache.upsert(ContainerMeta {
            id: "abc123".to_string(),
            name: "web-1".to_string(),
            image: "nginx:1.25".to_string(),
            labels: HashMap::from([("app".to_string(), "store".to_string())]),
        });
        let ctx = Arc::new(
            PipelineContext::new("test-config")
                .with_container_meta(Some(cache as Arc<dyn ContainerMetaProvider>)),
        );
        let mut t = Tagger::default();
        t.init(&serde_json::json!({}), ctx).unwrap();

        let mut g = EventGroup::from_raw(&Bytes::from_static(b"line"));
        g.set_metadata(GroupMetaKey::ContainerId, b"abc123");
        t.process(&mut g);
        assert_eq!(field(&g, 0, b"_container_name_").unwrap(), b"web-1");
        assert_eq!(field(&g, 0, b"_image_name_").unwrap(), b"nginx:1.25");
        assert_eq!(field(&g, 0, b"app").unwrap(), b"store");
    }

    #[test]
    fn test_unknown_container_id_adds_nothing() {
        let cache = Arc::new(ContainerMetaCache::new(Duration::from_secs(30)));
        let ctx = Arc::new(
            PipelineContext::new("test-config")
                .with_container_meta(Some(cache as Arc<dyn ContainerMetaProvider>)),
        );
        let mut t = Tagger::default();
        t.init(&serde_json::json!({}), ctx).unwrap();

        let mut g = EventGroup::from_raw(&Bytes::from_static(b"line"));
        g.set_metadata(GroupMetaKey::ContainerId, b"missing");
        t.process(&mut g);
        assert!(field(&g, 0, b"_container_name_").is_none());
    }

    #[test]
    fn test_idempotent() {
        let t = tagger(GlobalParams {
            agent_tag: Some("x".to_string()),
            appending_log_position_meta: true,
            tags: vec![("a".to_string(), "b".to_string())],
            ..GlobalParams::default()
        });
        let mut g = EventGroup::from_raw(&Bytes::from_static(b"line"));
        g.set_metadata(GroupMetaKey::LogFilePath, b"/l");
        g.set_metadata(GroupMetaKey::LogFileOffset, b"5");
        t.process(&mut g);
        let snapshot: Vec<Vec<(Vec<u8>, Vec<u8>)>> = g
            .events()
            .iter()
            .map(|e| {
                e.contents()
                    .iter()
                    .map(|(k, v)| (g.buf().get(*k).to_vec(), g.buf().get(*v).to_vec()))
                    .collect()
            })
            .collect();
        t.process(&mut g);
        let again: Vec<Vec<(Vec<u8>, Vec<u8>)>> = g
            .events()
            .iter()
            .map(|e| {
                e.contents()
                    .iter()
                    .map(|(k, v)| (g.buf().get(*k).to_vec(), g.buf().get(*v).to_vec()))
                    .collect()
            })
            .collect();
        assert_eq!(snapshot, again);
    }
}
