use super::arena::{SourceBuffer, StrRef};

/// One structured log record: a timestamp and an ordered key/value list.
///
/// Keys and values are views into the owning group's arena. The list keeps
/// insertion order; `set_content` replaces an existing key in place, so
/// duplicates only appear where a stage explicitly permits them (UTF-8
/// sanitation may collide rewritten keys).
#[derive(Debug, Clone, Default)]
pub struct LogEvent {
    pub timestamp: i64,
    pub timestamp_nanos: u32,
    contents: Vec<(StrRef, StrRef)>,
}

impl LogEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(key: StrRef, value: StrRef) -> Self {
        Self {
            timestamp: 0,
            timestamp_nanos: 0,
            contents: vec![(key, value)],
        }
    }

    pub fn set_timestamp(&mut self, secs: i64, nanos: u32) {
        self.timestamp = secs;
        self.timestamp_nanos = nanos;
    }

    pub fn contents(&self) -> &[(StrRef, StrRef)] {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut Vec<(StrRef, StrRef)> {
        &mut self.contents
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    fn find(&self, buf: &SourceBuffer, key: &[u8]) -> Option<usize> {
        self.contents.iter().position(|(k, _)| buf.get(*k) == key)
    }

    pub fn has_content(&self, buf: &SourceBuffer, key: &[u8]) -> bool {
        self.find(buf, key).is_some()
    }

    pub fn get_content(&self, buf: &SourceBuffer, key: &[u8]) -> Option<StrRef> {
        self.find(buf, key).map(|i| self.contents[i].1)
    }

    /// Insert or replace; the replaced entry keeps its position.
    pub fn set_content(&mut self, buf: &SourceBuffer, key: StrRef, value: StrRef) {
        let key_bytes = buf.get(key);
        match self.contents.iter().position(|(k, _)| buf.get(*k) == key_bytes) {
            Some(i) => self.contents[i] = (key, value),
            None => self.contents.push((key, value)),
        }
    }

    /// Append without the duplicate check. Only for stages where duplicate
    /// keys are permitted.
    pub fn push_content(&mut self, key: StrRef, value: StrRef) {
        self.contents.push((key, value));
    }

    /// Overwrite the value of an existing key, keeping its key view and
    /// position. Returns false when the key is absent.
    pub fn set_content_by_key(&mut self, buf: &SourceBuffer, key: &[u8], value: StrRef) -> bool {
        match self.find(buf, key) {
            Some(i) => {
                self.contents[i].1 = value;
                true
            }
            None => false,
        }
    }

    pub fn del_content(&mut self, buf: &SourceBuffer, key: &[u8]) -> bool {
        match self.find(buf, key) {
            Some(i) => {
                self.contents.remove(i);
                true
            }
            None => false,
        }
    }

    /// Total key + value bytes, the size a sender accounts for.
    pub fn content_bytes(&self) -> usize {
        self.contents
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::arena::keys;

    #[test]
    fn test_set_content_replaces_in_place() {
        let mut buf = SourceBuffer::new();
        let v1 = buf.alloc(b"first");
        let v2 = buf.alloc(b"second");
        let other_k = buf.alloc(b"other");
        let other_v = buf.alloc(b"x");

        let mut ev = LogEvent::new();
        ev.set_content(&buf, keys::DEFAULT_CONTENT, v1);
        ev.set_content(&buf, other_k, other_v);
        ev.set_content(&buf, keys::DEFAULT_CONTENT, v2);

        assert_eq!(ev.contents().len(), 2);
        assert_eq!(buf.get(ev.contents()[0].1), b"second");
        assert_eq!(ev.get_content(&buf, b"content"), Some(v2));
    }

    #[test]
    fn test_del_content() {
        let mut buf = SourceBuffer::new();
        let v = buf.alloc(b"x");
        let mut ev = LogEvent::new();
        ev.set_content(&buf, keys::DEFAULT_CONTENT, v);
        assert!(ev.del_content(&buf, b"content"));
        assert!(!ev.del_content(&buf, b"content"));
        assert!(ev.is_empty());
    }

    #[test]
    fn test_push_content_allows_duplicates() {
        let mut buf = SourceBuffer::new();
        let k = buf.alloc(b"k");
        let v = buf.alloc(b"v");
        let mut ev = LogEvent::new();
        ev.push_content(k, v);
        ev.push_content(k, v);
        assert_eq!(ev.contents().len(), 2);
    }
}
