use bytes::Bytes;

use super::arena::{SourceBuffer, StrRef};
use super::event::LogEvent;

/// Group-level metadata attached by the input boundary and consumed by
/// processors and the flusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupMetaKey {
    LogFilePath,
    LogFileInode,
    LogFileOffset,
    LogReadLength,
    HostIp,
    HostName,
    AgentTag,
    /// `"1"` containerd text, `"2"` docker json-file.
    LogFormat,
    /// Set by the container-log parser when it sees a partial fragment.
    HasPartLog,
    /// Runtime id of the container the read came from; resolved to
    /// name/image/labels by the tag stage.
    ContainerId,
    Topic,
}

/// Batch of events sharing one arena.
///
/// Created at the input boundary from a single raw read; every downstream
/// stage mutates it in place. Dropping the group drops the arena and with it
/// every view handed out for its events.
#[derive(Debug)]
pub struct EventGroup {
    buf: SourceBuffer,
    events: Vec<LogEvent>,
    metadata: Vec<(GroupMetaKey, StrRef)>,
    raw_base: usize,
}

impl EventGroup {
    pub fn new() -> Self {
        Self {
            buf: SourceBuffer::new(),
            events: Vec::new(),
            metadata: Vec::new(),
            raw_base: 0,
        }
    }

    /// Build a group holding a single raw event whose content spans the
    /// entire read buffer, the shape the worker hands to a pipeline.
    pub fn from_raw(raw: &Bytes) -> Self {
        let (buf, span) = SourceBuffer::from_raw(raw);
        let raw_base = span.offset();
        let event = LogEvent::with_content(super::arena::keys::DEFAULT_CONTENT, span);
        Self {
            buf,
            events: vec![event],
            metadata: Vec::new(),
            raw_base,
        }
    }

    /// Arena offset where the raw read region starts; views into it are at
    /// `raw_base() + <offset within the read>`.
    pub fn raw_base(&self) -> usize {
        self.raw_base
    }

    pub fn buf(&self) -> &SourceBuffer {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut SourceBuffer {
        &mut self.buf
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut Vec<LogEvent> {
        &mut self.events
    }

    /// Borrow arena and events independently; processors that rewrite
    /// content while walking the event vector need both.
    pub fn split_mut(&mut self) -> (&mut SourceBuffer, &mut Vec<LogEvent>) {
        (&mut self.buf, &mut self.events)
    }

    pub fn set_metadata(&mut self, key: GroupMetaKey, value: &[u8]) {
        let r = self.buf.alloc(value);
        self.set_metadata_ref(key, r);
    }

    pub fn set_metadata_ref(&mut self, key: GroupMetaKey, value: StrRef) {
        match self.metadata.iter().position(|(k, _)| *k == key) {
            Some(i) => self.metadata[i] = (key, value),
            None => self.metadata.push((key, value)),
        }
    }

    pub fn metadata_ref(&self, key: GroupMetaKey) -> Option<StrRef> {
        self.metadata
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    pub fn metadata(&self, key: GroupMetaKey) -> Option<&[u8]> {
        self.metadata_ref(key).map(|r| self.buf.get(r))
    }

    pub fn has_metadata(&self, key: GroupMetaKey) -> bool {
        self.metadata_ref(key).is_some()
    }

    pub fn del_metadata(&mut self, key: GroupMetaKey) {
        self.metadata.retain(|(k, _)| *k != key);
    }

    /// Total content bytes across events, for sender accounting.
    pub fn total_bytes(&self) -> usize {
        self.events.iter().map(|e| e.content_bytes()).sum()
    }
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_single_event() {
        let g = EventGroup::from_raw(&Bytes::from_static(b"a\nb\nc"));
        assert_eq!(g.events().len(), 1);
        let content = g.events()[0].get_content(g.buf(), b"content").unwrap();
        assert_eq!(g.buf().get(content), b"a\nb\nc");
    }

    #[test]
    fn test_metadata_set_get_replace() {
        let mut g = EventGroup::new();
        g.set_metadata(GroupMetaKey::LogFilePath, b"/var/log/app.log");
        g.set_metadata(GroupMetaKey::LogFormat, b"1");
        g.set_metadata(GroupMetaKey::LogFormat, b"2");
        assert_eq!(g.metadata(GroupMetaKey::LogFilePath).unwrap(), b"/var/log/app.log");
        assert_eq!(g.metadata(GroupMetaKey::LogFormat).unwrap(), b"2");
        assert!(!g.has_metadata(GroupMetaKey::HasPartLog));
        g.del_metadata(GroupMetaKey::LogFormat);
        assert!(!g.has_metadata(GroupMetaKey::LogFormat));
    }
}
