use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::common::ParseCounters;
use super::{parse_options, Processor};
use crate::model::{keys, EventGroup, GroupMetaKey, LogEvent, SourceBuffer, StrRef};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::util::AlarmType;

pub const NAME: &str = "parse_container_log_native";

/// `log_format` metadata values selecting the framing.
pub const CONTAINERD_TEXT: &[u8] = b"1";
pub const DOCKER_JSON_FILE: &[u8] = b"2";

const CONTAINERD_DELIMITER: u8 = b' ';
const CONTAINERD_FULL_TAG: u8 = b'F';
const CONTAINERD_PART_TAG: u8 = b'P';

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    ignoring_stdout: bool,
    ignoring_stderr: bool,
    ignore_parse_warning: bool,
    keeping_source_when_parse_fail: bool,
}

/// Normalizes one raw container runtime line into the canonical
/// `_time_` / `_source_` / `content` triple and flags partial fragments
/// for the multiline merger.
///
/// containerd text framing is split into three zero-copy views; the docker
/// json-file framing is decoded by an in-place scanner that compacts
/// unescaped bytes into the value span, so neither path allocates per line.
#[derive(Debug, Default)]
pub struct ContainerLogParser {
    source_key: String,
    ignoring_stdout: bool,
    ignoring_stderr: bool,
    ignore_parse_warning: bool,
    keeping_source_when_parse_fail: bool,
    ctx: Option<Arc<PipelineContext>>,
    counters: ParseCounters,
    stdout_total: AtomicU64,
    stderr_total: AtomicU64,
}

impl ContainerLogParser {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    fn warn_parse_failure(&self, what: &str, sample: &[u8]) {
        self.counters.record_error();
        if self.ignore_parse_warning {
            return;
        }
        if let Some(ctx) = &self.ctx {
            if ctx.alarm.allow(AlarmType::ParseLogFail) {
                tracing::warn!(
                    processor = NAME,
                    config = %ctx.config_name,
                    error = what,
                    sample = %String::from_utf8_lossy(&sample[..sample.len().min(1024)]),
                    "failed to parse container log line"
                );
            }
        }
    }

    /// Count the stream and apply stdout/stderr filtering. Returns false
    /// when the event must be dropped.
    fn admit_stream(&self, source: &[u8]) -> bool {
        if source == b"stdout" {
            self.stdout_total.fetch_add(1, Ordering::Relaxed);
            !self.ignoring_stdout
        } else {
            self.stderr_total.fetch_add(1, Ordering::Relaxed);
            !self.ignoring_stderr
        }
    }

    fn set_parsed(
        &self,
        buf: &SourceBuffer,
        event: &mut LogEvent,
        time: StrRef,
        source: StrRef,
        content: StrRef,
        partial: bool,
    ) {
        event.set_content(buf, keys::CONTAINER_TIME, time);
        event.set_content(buf, keys::CONTAINER_SOURCE, source);
        if partial {
            event.set_content(buf, keys::PART_LOG_FLAG, StrRef::EMPTY);
        }
        event.set_content(buf, keys::DEFAULT_CONTENT, content);
        self.counters
            .add_out_bytes(time.len() + source.len() + content.len());
    }

    fn parse_containerd(
        &self,
        buf: &mut SourceBuffer,
        event: &mut LogEvent,
        span: StrRef,
        has_part: &mut bool,
    ) -> bool {
        let bytes = buf.get(span);
        let len = bytes.len();

        let Some(p1) = bytes.iter().position(|&b| b == CONTAINERD_DELIMITER) else {
            self.warn_parse_failure("time field cannot be found in log line", bytes);
            return self.keeping_source_when_parse_fail;
        };
        let Some(p2) = bytes[p1 + 1..]
            .iter()
            .position(|&b| b == CONTAINERD_DELIMITER)
            .map(|i| i + p1 + 1)
        else {
            self.warn_parse_failure("source field cannot be found in log line", bytes);
            return self.keeping_source_when_parse_fail;
        };

        let source_bytes = &bytes[p1 + 1..p2];
        if source_bytes != b"stdout" && source_bytes != b"stderr" {
            self.warn_parse_failure("source field is not valid", bytes);
            return self.keeping_source_when_parse_fail;
        }
        if !self.admit_stream(source_bytes) {
            return false;
        }

        let time = span.slice(0, p1);
        let source = span.slice(p1 + 1, p2);

        // Tag position: a single F/P followed by a delimiter. Anything else
        // (absent tag, multi-char token, tag at end of line) makes the rest
        // of the line full content.
        let tag = if p2 + 1 < len { bytes[p2 + 1] } else { 0 };
        if tag != CONTAINERD_PART_TAG && tag != CONTAINERD_FULL_TAG {
            let content = span.slice((p2 + 1).min(len), len);
            self.set_parsed(buf, event, time, source, content, false);
            return true;
        }
        if p2 + 2 >= len || bytes[p2 + 2] != CONTAINERD_DELIMITER {
            // case: "... stdout P"  /  "... stdout PP 1"
            let content = span.slice(p2 + 1, len);
            self.set_parsed(buf, event, time, source, content, false);
            return true;
        }
        let content = span.slice(p2 + 3, len);
        let partial = tag == CONTAINERD_PART_TAG;
        self.set_parsed(buf, event, time, source, content, partial);
        if partial {
            *has_part = true;
        }
        true
    }

    fn parse_docker_json(&self, buf: &mut SourceBuffer, event: &mut LogEvent, span: StrRef) -> bool {
        let parsed = parse_docker_line(buf.get_mut(span));
        let Some(entry) = parsed else {
            self.warn_parse_failure("docker stdout json log line is not a valid json object", buf.get(span));
            return self.keeping_source_when_parse_fail;
        };

        let source = span.slice(entry.stream.0, entry.stream.1);
        let time = span.slice(entry.time.0, entry.time.1);
        let mut content = span.slice(entry.log.0, entry.log.1);

        let source_bytes = buf.get(source);
        if source_bytes.is_empty() || (source_bytes != b"stdout" && source_bytes != b"stderr") {
            self.warn_parse_failure("source field cannot be found in log line", buf.get(span));
            return self.keeping_source_when_parse_fail;
        }
        if !self.admit_stream(buf.get(source)) {
            return false;
        }

        if span.len() < content.len() + time.len() + source.len() {
            self.warn_parse_failure(
                "the original log line length is smaller than the sum of parsed fields",
                buf.get(span),
            );
            return self.keeping_source_when_parse_fail;
        }

        if buf.get(content).last() == Some(&b'\n') {
            content = content.resized(content.len() - 1);
        }
        self.set_parsed(buf, event, time, source, content, false);
        true
    }
}

impl Processor for ContainerLogParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.unwrap_or_else(|| "content".to_string());
        self.ignoring_stdout = opts.ignoring_stdout;
        self.ignoring_stderr = opts.ignoring_stderr;
        self.ignore_parse_warning = opts.ignore_parse_warning;
        self.keeping_source_when_parse_fail = opts.keeping_source_when_parse_fail;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if group.events().is_empty() {
            return;
        }
        let format = match group.metadata(GroupMetaKey::LogFormat) {
            Some(f) if f == CONTAINERD_TEXT => 1u8,
            Some(f) if f == DOCKER_JSON_FILE => 2u8,
            _ => return,
        };

        let mut has_part = false;
        let (buf, events) = group.split_mut();
        events.retain_mut(|event| {
            let Some(span) = event.get_content(buf, self.source_key.as_bytes()) else {
                return true;
            };
            self.counters.add_in_bytes(self.source_key.len() + span.len());
            match format {
                1 => self.parse_containerd(buf, event, span, &mut has_part),
                _ => self.parse_docker_json(buf, event, span),
            }
        });
        if has_part {
            group.set_metadata(GroupMetaKey::HasPartLog, b"P");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DockerField {
    Log,
    Stream,
    Time,
}

/// `(start, end)` spans of the three values within the scanned slice.
struct DockerLine {
    log: (usize, usize),
    stream: (usize, usize),
    time: (usize, usize),
}

fn skip_spaces(data: &[u8], mut idx: usize) -> usize {
    while idx < data.len() && data[idx] == b' ' {
        idx += 1;
    }
    idx
}

/// Scan a one-line docker json-file record
/// (`{"log":"...","stream":"stdout","time":"..."}`), unescaping the `log`
/// value in place. Escapes never expand, so the value compacts toward its
/// start and the returned span covers the decoded bytes.
fn parse_docker_line(data: &mut [u8]) -> Option<DockerLine> {
    let size = data.len();
    if size == 0 || data[0] != b'{' || data[size - 1] != b'}' {
        return None;
    }

    let mut line = DockerLine {
        log: (0, 0),
        stream: (0, 0),
        time: (0, 0),
    };
    let mut pairs = 0;
    let mut idx = 1;
    while idx < size {
        idx = skip_spaces(data, idx);
        if idx >= size {
            return None;
        }
        if data[idx] == b'}' {
            return if idx == size - 1 { Some(line) } else { None };
        }

        if data[idx] != b'"' {
            return None;
        }
        idx += 1;

        let field = if data[idx..].starts_with(b"log") {
            idx += 3;
            DockerField::Log
        } else if data[idx..].starts_with(b"stream") {
            idx += 6;
            DockerField::Stream
        } else if data[idx..].starts_with(b"time") {
            idx += 4;
            DockerField::Time
        } else {
            return None;
        };
        pairs += 1;

        if idx >= size || data[idx] != b'"' {
            return None;
        }
        idx += 1;
        idx = skip_spaces(data, idx);
        if idx >= size || data[idx] != b':' {
            return None;
        }
        idx += 1;
        idx = skip_spaces(data, idx);
        if idx >= size || data[idx] != b'"' {
            return None;
        }
        idx += 1;
        if idx >= size {
            return None;
        }

        let value_start = idx;
        let mut end = idx;
        while idx < size && data[idx] != b'"' {
            if data[idx] == b'\\' {
                // Escapes are only legal inside the log payload
                if field != DockerField::Log {
                    return None;
                }
                idx += 1;
                if idx >= size {
                    return None;
                }
                match data[idx] {
                    b'"' => push_byte(data, &mut end, b'"'),
                    b'\\' => push_byte(data, &mut end, b'\\'),
                    b'/' => push_byte(data, &mut end, b'/'),
                    b'b' => push_byte(data, &mut end, 0x08),
                    b'f' => push_byte(data, &mut end, 0x0c),
                    b'n' => push_byte(data, &mut end, b'\n'),
                    b'r' => push_byte(data, &mut end, b'\r'),
                    b't' => push_byte(data, &mut end, b'\t'),
                    b'u' if idx + 4 < size => {
                        let code = parse_hex4(&data[idx + 1..idx + 5])?;
                        let ch = char::from_u32(code).unwrap_or('\u{fffd}');
                        let mut utf8 = [0u8; 4];
                        for &b in ch.encode_utf8(&mut utf8).as_bytes() {
                            push_byte(data, &mut end, b);
                        }
                        idx += 4;
                    }
                    other => {
                        // Unknown escape is copied through verbatim
                        push_byte(data, &mut end, b'\\');
                        push_byte(data, &mut end, other);
                    }
                }
            } else {
                let b = data[idx];
                push_byte(data, &mut end, b);
            }
            idx += 1;
        }
        if idx >= size {
            return None;
        }
        idx += 1; // closing quote
        idx = skip_spaces(data, idx);
        if idx >= size {
            return None;
        }

        if pairs < 3 {
            if data[idx] != b',' {
                return None;
            }
            idx += 1;
        }
        idx = skip_spaces(data, idx);
        if idx >= size {
            return None;
        }

        let span = (value_start, end);
        match field {
            DockerField::Log => line.log = span,
            DockerField::Stream => line.stream = span,
            DockerField::Time => line.time = span,
        }
    }
    Some(line)
}

#[inline]
fn push_byte(data: &mut [u8], end: &mut usize, b: u8) {
    data[*end] = b;
    *end += 1;
}

fn parse_hex4(hex: &[u8]) -> Option<u32> {
    let mut value = 0u32;
    for &b in hex {
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as u32,
            b'a'..=b'f' => (b - b'a' + 10) as u32,
            b'A'..=b'F' => (b - b'A' + 10) as u32,
            _ => return None,
        };
        value = value * 16 + digit;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn parser(opts: Value) -> ContainerLogParser {
        let mut p = ContainerLogParser::default();
        p.init(&opts, Arc::new(PipelineContext::new("test-config"))).unwrap();
        p
    }

    fn group_with_lines(format: &[u8], lines: &[&[u8]]) -> EventGroup {
        let mut group = EventGroup::new();
        group.set_metadata(GroupMetaKey::LogFormat, format);
        for line in lines {
            let (buf, events) = group.split_mut();
            let span = buf.alloc(line);
            events.push(crate::model::LogEvent::with_content(keys::DEFAULT_CONTENT, span));
        }
        group
    }

    fn content_of(group: &EventGroup, idx: usize, key: &[u8]) -> Vec<u8> {
        let span = group.events()[idx].get_content(group.buf(), key).unwrap();
        group.buf().get(span).to_vec()
    }

    // ── containerd text ─────────────────────────────────────────

    #[test]
    fn test_containerd_full_line() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(b"1", &[b"2024-01-01T00:00:00Z stdout F world"]);
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"_time_"), b"2024-01-01T00:00:00Z");
        assert_eq!(content_of(&g, 0, b"_source_"), b"stdout");
        assert_eq!(content_of(&g, 0, b"content"), b"world");
        assert!(!g.events()[0].has_content(g.buf(), b"P"));
        assert!(!g.has_metadata(GroupMetaKey::HasPartLog));
    }

    #[test]
    fn test_containerd_partial_line_sets_flags() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(b"1", &[b"2024-01-01T00:00:00Z stdout P hello "]);
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"hello ");
        assert!(g.events()[0].has_content(g.buf(), b"P"));
        assert!(g.has_metadata(GroupMetaKey::HasPartLog));
    }

    #[test]
    fn test_containerd_unknown_tag_is_full_content() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(b"1", &[b"2024-01-01T00:00:00Z stderr hello world"]);
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"hello world");
        assert_eq!(content_of(&g, 0, b"_source_"), b"stderr");
    }

    #[test]
    fn test_containerd_tag_without_separator() {
        // "PP 1" and a trailing bare "P" are content, not tags
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(
            b"1",
            &[b"2024-01-01T00:00:00Z stdout PP 1", b"2024-01-01T00:00:00Z stdout P"],
        );
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"PP 1");
        assert_eq!(content_of(&g, 1, b"content"), b"P");
        assert!(!g.has_metadata(GroupMetaKey::HasPartLog));
    }

    #[test]
    fn test_containerd_bad_stream_dropped_by_default() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(b"1", &[b"2024-01-01T00:00:00Z stdin F x"]);
        p.process(&mut g);
        assert!(g.events().is_empty());
    }

    #[test]
    fn test_containerd_bad_stream_kept_when_configured() {
        let p = parser(serde_json::json!({"KeepingSourceWhenParseFail": true}));
        let mut g = group_with_lines(b"1", &[b"no-spaces-here"]);
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"no-spaces-here");
    }

    #[test]
    fn test_containerd_ignoring_stdout() {
        let p = parser(serde_json::json!({"IgnoringStdout": true}));
        let mut g = group_with_lines(
            b"1",
            &[
                b"2024-01-01T00:00:00Z stdout F dropped",
                b"2024-01-01T00:00:00Z stderr F kept",
            ],
        );
        p.process(&mut g);
        assert_eq!(g.events().len(), 1);
        assert_eq!(content_of(&g, 0, b"content"), b"kept");
    }

    // ── docker json-file ────────────────────────────────────────

    #[test]
    fn test_docker_json_plain() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(
            b"2",
            &[br#"{"log":"Hello, World!","stream":"stdout","time":"2021-12-01T00:00:00.000Z"}"#],
        );
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"Hello, World!");
        assert_eq!(content_of(&g, 0, b"_source_"), b"stdout");
        assert_eq!(content_of(&g, 0, b"_time_"), b"2021-12-01T00:00:00.000Z");
    }

    #[test]
    fn test_docker_json_escapes_and_trailing_newline() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(
            b"2",
            &[br#"{"log":"line1\nline2\n","stream":"stderr","time":"2024-01-01T00:00:00.5Z"}"#],
        );
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"line1\nline2");
        assert_eq!(content_of(&g, 0, b"_source_"), b"stderr");
        assert_eq!(content_of(&g, 0, b"_time_"), b"2024-01-01T00:00:00.5Z");
    }

    #[test]
    fn test_docker_json_unicode_escape() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(
            b"2",
            &[br#"{"log":"caf\u00e9 \u4e2d","stream":"stdout","time":"t"}"#],
        );
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), "café 中".as_bytes());
    }

    #[test]
    fn test_docker_json_key_order_and_whitespace() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(
            b"2",
            &[br#"{ "time" : "t" , "log" : "x" , "stream" : "stdout" }"#],
        );
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"x");
    }

    #[test]
    fn test_docker_json_invalid_shape_dropped() {
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(b"2", &[br#"{"log":"x","level":"info","time":"t"}"#]);
        p.process(&mut g);
        assert!(g.events().is_empty());
    }

    #[test]
    fn test_docker_json_roundtrip_no_escapes() {
        // parse(serialize(e)) == e for events with no escapes
        let log = "plain payload";
        let stream = "stdout";
        let time = "2024-01-01T00:00:00Z";
        let serialized = format!(r#"{{"log":"{log}","stream":"{stream}","time":"{time}"}}"#);
        let p = parser(serde_json::json!({}));
        let mut g = group_with_lines(b"2", &[serialized.as_bytes()]);
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), log.as_bytes());
        assert_eq!(content_of(&g, 0, b"_source_"), stream.as_bytes());
        assert_eq!(content_of(&g, 0, b"_time_"), time.as_bytes());
    }

    #[test]
    fn test_unrelated_format_untouched() {
        let p = parser(serde_json::json!({}));
        let mut g = EventGroup::from_raw(&Bytes::from_static(b"plain file line"));
        p.process(&mut g);
        assert_eq!(content_of(&g, 0, b"content"), b"plain file line");
    }
}
