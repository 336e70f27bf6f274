//! Byte arena backing all string storage of one event group.
//!
//! Every key and value inside an [`crate::model::EventGroup`] is a
//! [`StrRef`]: an `(offset, len)` pair resolved against exactly one
//! `SourceBuffer`. Views are plain integers, so growing the arena never
//! invalidates them and none of them can outlive the group that owns the
//! buffer. Parsers rewrite content in place (`get_mut`, `copy_within`) or
//! append derived strings with `alloc`; they never hold heap strings of
//! their own.
//!
//! The arena is seeded with a fixed prelude of well-known key names so
//! processors can attach reserved keys without allocating per event.

use bytes::Bytes;

/// Non-owning view into a [`SourceBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrRef {
    off: u32,
    len: u32,
}

impl StrRef {
    pub const EMPTY: StrRef = StrRef { off: 0, len: 0 };

    pub fn new(off: usize, len: usize) -> Self {
        Self {
            off: off as u32,
            len: len as u32,
        }
    }

    pub fn offset(&self) -> usize {
        self.off as usize
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        (self.off + self.len) as usize
    }

    /// Sub-view relative to this one. `from..to` must lie inside `0..len`.
    pub fn slice(&self, from: usize, to: usize) -> StrRef {
        debug_assert!(from <= to && to <= self.len as usize);
        StrRef {
            off: self.off + from as u32,
            len: (to - from) as u32,
        }
    }

    /// Extend the view to cover `new_len` bytes from its start.
    pub fn resized(&self, new_len: usize) -> StrRef {
        StrRef {
            off: self.off,
            len: new_len as u32,
        }
    }
}

macro_rules! prelude_keys {
    ($(($const_name:ident, $text:literal)),+ $(,)?) => {
        /// Well-known keys baked into every arena at fixed offsets.
        pub mod keys {
            use super::StrRef;

            pub(super) const PRELUDE: &str = concat!($($text),+);

            prelude_keys!(@refs 0u32; $(($const_name, $text)),+);
        }
    };
    (@refs $off:expr; ($const_name:ident, $text:literal)) => {
        pub const $const_name: StrRef = StrRef { off: $off, len: $text.len() as u32 };
    };
    (@refs $off:expr; ($const_name:ident, $text:literal), $(($rest_name:ident, $rest_text:literal)),+) => {
        pub const $const_name: StrRef = StrRef { off: $off, len: $text.len() as u32 };
        prelude_keys!(@refs $off + $text.len() as u32; $(($rest_name, $rest_text)),+);
    };
}

prelude_keys! {
    (DEFAULT_CONTENT, "content"),
    (CONTAINER_TIME, "_time_"),
    (CONTAINER_SOURCE, "_source_"),
    (RAW_LOG, "__raw__"),
    (UNMATCHED_RAW_LOG, "__raw_log__"),
    (FILE_OFFSET, "__file_offset__"),
    (FILE_PATH, "__path__"),
    (USER_DEFINED_ID, "__user_defined_id__"),
    (LEVEL, "__LEVEL__"),
    (THREAD, "__THREAD__"),
    (FILE, "__FILE__"),
    (LINE, "__LINE__"),
    (MICROTIME, "microtime"),
    (PART_LOG_FLAG, "P"),
}

/// Append-only bump arena plus in-place rewrite support.
#[derive(Debug)]
pub struct SourceBuffer {
    bytes: Vec<u8>,
}

impl SourceBuffer {
    pub fn new() -> Self {
        Self {
            bytes: keys::PRELUDE.as_bytes().to_vec(),
        }
    }

    /// Seed the arena with one raw read buffer and return its view.
    pub fn from_raw(raw: &Bytes) -> (Self, StrRef) {
        let mut bytes = Vec::with_capacity(keys::PRELUDE.len() + raw.len());
        bytes.extend_from_slice(keys::PRELUDE.as_bytes());
        let off = bytes.len();
        bytes.extend_from_slice(raw);
        (Self { bytes }, StrRef::new(off, raw.len()))
    }

    /// Copy `data` into the arena and return its view.
    pub fn alloc(&mut self, data: &[u8]) -> StrRef {
        let off = self.bytes.len();
        self.bytes.extend_from_slice(data);
        StrRef::new(off, data.len())
    }

    pub fn get(&self, r: StrRef) -> &[u8] {
        &self.bytes[r.offset()..r.end()]
    }

    pub fn get_mut(&mut self, r: StrRef) -> &mut [u8] {
        let (off, end) = (r.offset(), r.end());
        &mut self.bytes[off..end]
    }

    /// `memmove` semantics inside the arena: copy `src` over the bytes
    /// starting at `dest_off`. Ranges may overlap.
    pub fn copy_within(&mut self, src: StrRef, dest_off: usize) {
        self.bytes
            .copy_within(src.offset()..src.end(), dest_off);
    }

    pub fn write_byte(&mut self, off: usize, b: u8) {
        self.bytes[off] = b;
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Default for SourceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_keys_resolve() {
        let buf = SourceBuffer::new();
        assert_eq!(buf.get(keys::DEFAULT_CONTENT), b"content");
        assert_eq!(buf.get(keys::CONTAINER_TIME), b"_time_");
        assert_eq!(buf.get(keys::CONTAINER_SOURCE), b"_source_");
        assert_eq!(buf.get(keys::RAW_LOG), b"__raw__");
        assert_eq!(buf.get(keys::UNMATCHED_RAW_LOG), b"__raw_log__");
        assert_eq!(buf.get(keys::FILE_OFFSET), b"__file_offset__");
        assert_eq!(buf.get(keys::FILE_PATH), b"__path__");
        assert_eq!(buf.get(keys::USER_DEFINED_ID), b"__user_defined_id__");
        assert_eq!(buf.get(keys::LEVEL), b"__LEVEL__");
        assert_eq!(buf.get(keys::THREAD), b"__THREAD__");
        assert_eq!(buf.get(keys::FILE), b"__FILE__");
        assert_eq!(buf.get(keys::LINE), b"__LINE__");
        assert_eq!(buf.get(keys::MICROTIME), b"microtime");
        assert_eq!(buf.get(keys::PART_LOG_FLAG), b"P");
    }

    #[test]
    fn test_alloc_survives_growth() {
        let mut buf = SourceBuffer::new();
        let a = buf.alloc(b"hello");
        // Force reallocation with a large append
        let big = vec![b'x'; 1 << 16];
        let b = buf.alloc(&big);
        assert_eq!(buf.get(a), b"hello");
        assert_eq!(buf.get(b).len(), 1 << 16);
    }

    #[test]
    fn test_from_raw_view_spans_read() {
        let raw = Bytes::from_static(b"line1\nline2");
        let (buf, r) = SourceBuffer::from_raw(&raw);
        assert_eq!(buf.get(r), b"line1\nline2");
    }

    #[test]
    fn test_copy_within_overlapping() {
        let mut buf = SourceBuffer::new();
        let r = buf.alloc(b"abc\ndef");
        // Pull "def" left over the separator, like a merge would
        buf.copy_within(r.slice(4, 7), r.offset() + 3);
        assert_eq!(&buf.get(r)[..6], b"abcdef");
    }

    #[test]
    fn test_slice_and_resize() {
        let mut buf = SourceBuffer::new();
        let r = buf.alloc(b"key:value");
        let key = r.slice(0, 3);
        let value = r.slice(4, 9);
        assert_eq!(buf.get(key), b"key");
        assert_eq!(buf.get(value), b"value");
        assert_eq!(buf.get(key.resized(9)), b"key:value");
    }
}
