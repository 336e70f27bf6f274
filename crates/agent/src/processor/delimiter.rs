use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::common::{CommonParserOptions, ParseCounters};
use super::{parse_options, Processor};
use crate::model::{EventGroup, LogEvent, SourceBuffer, StrRef};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::util::AlarmType;

pub const NAME: &str = "parse_delimiter_native";

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    separator: Option<String>,
    quote: Option<String>,
    keys: Vec<String>,
    allowing_shortened_fields: bool,
    allowing_excessive_fields: bool,
    #[serde(flatten)]
    common: CommonParserOptions,
}

/// Splits a line on a (possibly multi-byte) separator with CSV-style
/// quoting: a field wrapped in the quote char may contain separators, and a
/// doubled quote inside it is an escaped quote.
#[derive(Debug, Default)]
pub struct DelimiterParser {
    source_key: String,
    separator: Vec<u8>,
    quote: u8,
    keys: Vec<String>,
    allowing_shortened_fields: bool,
    allowing_excessive_fields: bool,
    common: CommonParserOptions,
    ctx: Option<Arc<PipelineContext>>,
    counters: ParseCounters,
}

/// A split field: its span, and whether doubled quotes need collapsing.
#[derive(Debug, Clone, Copy)]
struct Field {
    start: usize,
    end: usize,
    has_doubled_quote: bool,
}

impl DelimiterParser {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    fn split_fields(&self, bytes: &[u8]) -> Option<Vec<Field>> {
        let sep = &self.separator;
        let q = self.quote;
        let len = bytes.len();
        let mut fields = Vec::new();
        let mut i = 0usize;
        loop {
            if i < len && bytes[i] == q {
                // Quoted field
                let mut j = i + 1;
                let mut has_doubled = false;
                let content_start = i + 1;
                let content_end;
                loop {
                    let rel = bytes[j..].iter().position(|&b| b == q)?;
                    let at = j + rel;
                    if bytes.get(at + 1) == Some(&q) {
                        has_doubled = true;
                        j = at + 2;
                    } else {
                        content_end = at;
                        break;
                    }
                }
                let after = content_end + 1;
                if after == len {
                    fields.push(Field {
                        start: content_start,
                        end: content_end,
                        has_doubled_quote: has_doubled,
                    });
                    break;
                }
                if !bytes[after..].starts_with(sep) {
                    // Garbage between closing quote and separator
                    return None;
                }
                fields.push(Field {
                    start: content_start,
                    end: content_end,
                    has_doubled_quote: has_doubled,
                });
                i = after + sep.len();
                if i == len {
                    fields.push(Field {
                        start: len,
                        end: len,
                        has_doubled_quote: false,
                    });
                    break;
                }
            } else {
                match find_subslice(&bytes[i..], sep) {
                    Some(rel) => {
                        fields.push(Field {
                            start: i,
                            end: i + rel,
                            has_doubled_quote: false,
                        });
                        i += rel + sep.len();
                        if i == len {
                            fields.push(Field {
                                start: len,
                                end: len,
                                has_doubled_quote: false,
                            });
                            break;
                        }
                    }
                    None => {
                        fields.push(Field {
                            start: i,
                            end: len,
                            has_doubled_quote: false,
                        });
                        break;
                    }
                }
            }
        }
        Some(fields)
    }

    fn field_value(&self, buf: &mut SourceBuffer, span: StrRef, field: Field) -> StrRef {
        if !field.has_doubled_quote {
            return span.slice(field.start, field.end);
        }
        let mut unescaped = Vec::with_capacity(field.end - field.start);
        {
            let bytes = &buf.get(span)[field.start..field.end];
            let mut i = 0;
            while i < bytes.len() {
                unescaped.push(bytes[i]);
                if bytes[i] == self.quote && bytes.get(i + 1) == Some(&self.quote) {
                    i += 2;
                } else {
                    i += 1;
                }
            }
        }
        buf.alloc(&unescaped)
    }

    fn fail(&self, buf: &mut SourceBuffer, event: &mut LogEvent, span: StrRef, what: &str) -> bool {
        self.counters.record_error();
        if let Some(ctx) = &self.ctx {
            if ctx.alarm.allow(AlarmType::ParseLogFail) {
                let sample = buf.get(span);
                tracing::warn!(
                    processor = NAME,
                    config = %ctx.config_name,
                    error = what,
                    sample = %String::from_utf8_lossy(&sample[..sample.len().min(1024)]),
                    "failed to split log line"
                );
            }
        }
        let kept = self.common.on_fail(buf, event, self.source_key.as_bytes(), span);
        if !kept {
            self.counters.record_discard();
        }
        kept
    }

    fn process_event(&self, buf: &mut SourceBuffer, event: &mut LogEvent, key_refs: &[StrRef]) -> bool {
        let Some(span) = event.get_content(buf, self.source_key.as_bytes()) else {
            return true;
        };
        self.counters.add_in_bytes(span.len());

        let fields = {
            let bytes = buf.get(span);
            self.split_fields(bytes)
        };
        let Some(fields) = fields else {
            return self.fail(buf, event, span, "unclosed or malformed quote");
        };

        if fields.len() < self.keys.len() && !self.allowing_shortened_fields {
            return self.fail(buf, event, span, "too few fields for the configured keys");
        }
        if fields.len() > self.keys.len() && !self.allowing_excessive_fields {
            return self.fail(buf, event, span, "too many fields for the configured keys");
        }

        let mut source_overwritten = false;
        let mut raw_overwritten = false;
        for (i, field) in fields.iter().enumerate() {
            let value = self.field_value(buf, span, *field);
            let key_ref = if i < self.keys.len() {
                if self.keys[i].as_bytes() == self.source_key.as_bytes() {
                    source_overwritten = true;
                }
                if self.keys[i] == "__raw__" {
                    raw_overwritten = true;
                }
                key_refs[i]
            } else {
                buf.alloc(format!("__column{i}__").as_bytes())
            };
            self.counters.add_out_bytes(key_ref.len() + value.len());
            event.set_content(buf, key_ref, value);
        }
        self.common.on_success(
            buf,
            event,
            self.source_key.as_bytes(),
            span,
            source_overwritten,
            raw_overwritten,
        );
        true
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Processor for DelimiterParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.unwrap_or_else(|| "content".to_string());
        let separator = opts.separator.unwrap_or_else(|| ",".to_string());
        if separator.is_empty() {
            return Err(ConfigError::InvalidParam {
                plugin: NAME,
                param: "Separator",
                reason: "must not be empty".to_string(),
            });
        }
        self.separator = separator.into_bytes();
        let quote = opts.quote.unwrap_or_else(|| "\"".to_string());
        if quote.len() != 1 {
            return Err(ConfigError::InvalidParam {
                plugin: NAME,
                param: "Quote",
                reason: "must be a single character".to_string(),
            });
        }
        self.quote = quote.as_bytes()[0];
        if opts.keys.is_empty() {
            return Err(ConfigError::MissingParam {
                plugin: NAME,
                param: "Keys",
            });
        }
        self.keys = opts.keys;
        self.allowing_shortened_fields = opts.allowing_shortened_fields;
        self.allowing_excessive_fields = opts.allowing_excessive_fields;
        self.common = opts.common;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if group.events().is_empty() {
            return;
        }
        let (buf, events) = group.split_mut();
        let key_refs: Vec<StrRef> = self.keys.iter().map(|k| buf.alloc(k.as_bytes())).collect();
        events.retain_mut(|event| self.process_event(buf, event, &key_refs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::keys;

    fn parser(opts: Value) -> DelimiterParser {
        let mut p = DelimiterParser::default();
        p.init(&opts, Arc::new(PipelineContext::new("test-config"))).unwrap();
        p
    }

    fn group_with(content: &[u8]) -> EventGroup {
        let mut group = EventGroup::new();
        let (buf, events) = group.split_mut();
        let span = buf.alloc(content);
        events.push(LogEvent::with_content(keys::DEFAULT_CONTENT, span));
        group
    }

    fn field(group: &EventGroup, key: &[u8]) -> Option<Vec<u8>> {
        group.events()[0]
            .get_content(group.buf(), key)
            .map(|s| group.buf().get(s).to_vec())
    }

    #[test]
    fn test_simple_split() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a", "b", "c"],
        }));
        let mut g = group_with(b"1,2,3");
        p.process(&mut g);
        assert_eq!(field(&g, b"a").unwrap(), b"1");
        assert_eq!(field(&g, b"b").unwrap(), b"2");
        assert_eq!(field(&g, b"c").unwrap(), b"3");
    }

    #[test]
    fn test_multi_char_separator() {
        let p = parser(serde_json::json!({
            "Separator": "||",
            "Keys": ["a", "b"],
        }));
        let mut g = group_with(b"left||right");
        p.process(&mut g);
        assert_eq!(field(&g, b"a").unwrap(), b"left");
        assert_eq!(field(&g, b"b").unwrap(), b"right");
    }

    #[test]
    fn test_quoted_field_with_separator_inside() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a", "b"],
        }));
        let mut g = group_with(b"\"x,y\",z");
        p.process(&mut g);
        assert_eq!(field(&g, b"a").unwrap(), b"x,y");
        assert_eq!(field(&g, b"b").unwrap(), b"z");
    }

    #[test]
    fn test_doubled_quote_escaping() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a", "b"],
        }));
        let mut g = group_with(b"\"say \"\"hi\"\"\",2");
        p.process(&mut g);
        assert_eq!(field(&g, b"a").unwrap(), b"say \"hi\"");
        assert_eq!(field(&g, b"b").unwrap(), b"2");
    }

    #[test]
    fn test_field_count_mismatch_fails() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a", "b"],
        }));
        let mut g = group_with(b"1,2,3");
        p.process(&mut g);
        assert!(g.events().is_empty());
    }

    #[test]
    fn test_excessive_fields_packed_into_columns() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a"],
            "AllowingExcessiveFields": true,
        }));
        let mut g = group_with(b"1,2,3");
        p.process(&mut g);
        assert_eq!(field(&g, b"a").unwrap(), b"1");
        assert_eq!(field(&g, b"__column1__").unwrap(), b"2");
        assert_eq!(field(&g, b"__column2__").unwrap(), b"3");
    }

    #[test]
    fn test_shortened_fields_allowed() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a", "b", "c"],
            "AllowingShortenedFields": true,
        }));
        let mut g = group_with(b"1,2");
        p.process(&mut g);
        assert_eq!(field(&g, b"a").unwrap(), b"1");
        assert_eq!(field(&g, b"b").unwrap(), b"2");
        assert!(field(&g, b"c").is_none());
    }

    #[test]
    fn test_unclosed_quote_fails() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a"],
            "KeepingSourceWhenParseFail": true,
        }));
        let mut g = group_with(b"\"never closed");
        p.process(&mut g);
        assert_eq!(field(&g, b"__raw_log__").unwrap(), b"\"never closed");
    }

    #[test]
    fn test_trailing_separator_yields_empty_field() {
        let p = parser(serde_json::json!({
            "Separator": ",",
            "Keys": ["a", "b"],
        }));
        let mut g = group_with(b"1,");
        p.process(&mut g);
        assert_eq!(field(&g, b"a").unwrap(), b"1");
        assert_eq!(field(&g, b"b").unwrap(), b"");
    }
}
