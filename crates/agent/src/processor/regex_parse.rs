use std::sync::Arc;

use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::common::{CommonParserOptions, ParseCounters};
use super::{parse_options, Processor};
use crate::model::{EventGroup, LogEvent, SourceBuffer, StrRef};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::util::AlarmType;

pub const NAME: &str = "parse_regex_native";

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    regex: Option<String>,
    keys: Vec<String>,
    #[serde(flatten)]
    common: CommonParserOptions,
}

/// Extracts fields with a single whole-line regex whose N capture groups
/// map onto N configured keys. The degenerate pattern `(.*)` short-circuits
/// to whole-line mode.
#[derive(Debug, Default)]
pub struct RegexParser {
    source_key: String,
    regex: Option<Regex>,
    keys: Vec<String>,
    whole_line: bool,
    common: CommonParserOptions,
    ctx: Option<Arc<PipelineContext>>,
    counters: ParseCounters,
}

impl RegexParser {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    fn process_event(
        &self,
        buf: &mut SourceBuffer,
        event: &mut LogEvent,
        key_refs: &[StrRef],
    ) -> bool {
        let Some(span) = event.get_content(buf, self.source_key.as_bytes()) else {
            return true;
        };
        self.counters.add_in_bytes(span.len());

        if self.whole_line {
            event.set_content(buf, key_refs[0], span);
            self.counters.add_out_bytes(span.len());
            let overwritten = self.keys[0].as_bytes() == self.source_key.as_bytes();
            self.common
                .on_success(buf, event, self.source_key.as_bytes(), span, overwritten, false);
            return true;
        }

        let re = self.regex.as_ref().expect("regex parser initialized");
        let ranges: Option<Vec<Option<(usize, usize)>>> = {
            let content = buf.get(span);
            re.captures(content).map(|caps| {
                (1..=self.keys.len())
                    .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                    .collect()
            })
        };

        let Some(ranges) = ranges else {
            self.counters.record_error();
            if let Some(ctx) = &self.ctx {
                if ctx.alarm.allow(AlarmType::RegexMatchFail) {
                    let sample = buf.get(span);
                    tracing::warn!(
                        processor = NAME,
                        config = %ctx.config_name,
                        sample = %String::from_utf8_lossy(&sample[..sample.len().min(1024)]),
                        "log line does not match the configured regex"
                    );
                }
            }
            let kept = self.common.on_fail(buf, event, self.source_key.as_bytes(), span);
            if !kept {
                self.counters.record_discard();
            }
            return kept;
        };

        let mut source_overwritten = false;
        let mut raw_overwritten = false;
        for (i, range) in ranges.iter().enumerate() {
            let Some((start, end)) = range else { continue };
            let value = span.slice(*start, *end);
            if self.keys[i].as_bytes() == self.source_key.as_bytes() {
                source_overwritten = true;
            }
            if self.keys[i] == "__raw__" {
                raw_overwritten = true;
            }
            self.counters.add_out_bytes(key_refs[i].len() + value.len());
            event.set_content(buf, key_refs[i], value);
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

impl Processor for RegexParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.unwrap_or_else(|| "content".to_string());
        let pattern = opts.regex.ok_or(ConfigError::MissingParam {
            plugin: NAME,
            param: "Regex",
        })?;
        if opts.keys.is_empty() {
            return Err(ConfigError::MissingParam {
                plugin: NAME,
                param: "Keys",
            });
        }
        self.keys = opts.keys;

        if pattern == "(.*)" {
            self.whole_line = true;
        } else {
            let re = Regex::new(&format!("^(?s:{pattern})$"))
                .map_err(|e| ConfigError::bad_regex(NAME, &pattern, e))?;
            let captures = re.captures_len() - 1;
            if captures != self.keys.len() {
                return Err(ConfigError::InvalidParam {
                    plugin: NAME,
                    param: "Keys",
                    reason: format!(
                        "regex has {captures} capture groups but {} keys are configured",
                        self.keys.len()
                    ),
                });
            }
            self.regex = Some(re);
        }
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

    fn parser(opts: Value) -> RegexParser {
        let mut p = RegexParser::default();
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
    fn test_captures_mapped_to_keys() {
        let p = parser(serde_json::json!({
            "Regex": r"(\d+)\s+(\w+)\s+(.*)",
            "Keys": ["code", "level", "message"],
        }));
        let mut g = group_with(b"200 INFO request served");
        p.process(&mut g);
        assert_eq!(field(&g, b"code").unwrap(), b"200");
        assert_eq!(field(&g, b"level").unwrap(), b"INFO");
        assert_eq!(field(&g, b"message").unwrap(), b"request served");
        assert!(field(&g, b"content").is_none());
    }

    #[test]
    fn test_whole_line_mode() {
        let p = parser(serde_json::json!({
            "Regex": "(.*)",
            "Keys": ["message"],
        }));
        let mut g = group_with(b"anything goes");
        p.process(&mut g);
        assert_eq!(field(&g, b"message").unwrap(), b"anything goes");
    }

    #[test]
    fn test_mismatch_discards_by_default() {
        let p = parser(serde_json::json!({
            "Regex": r"(\d+)",
            "Keys": ["code"],
        }));
        let mut g = group_with(b"not a number");
        p.process(&mut g);
        assert!(g.events().is_empty());
    }

    #[test]
    fn test_mismatch_kept_when_configured() {
        let p = parser(serde_json::json!({
            "Regex": r"(\d+)",
            "Keys": ["code"],
            "KeepingSourceWhenParseFail": true,
        }));
        let mut g = group_with(b"not a number");
        p.process(&mut g);
        assert_eq!(field(&g, b"__raw_log__").unwrap(), b"not a number");
    }

    #[test]
    fn test_key_count_mismatch_rejected() {
        let mut p = RegexParser::default();
        let err = p
            .init(
                &serde_json::json!({"Regex": r"(\d+) (\w+)", "Keys": ["only_one"]}),
                Arc::new(PipelineContext::new("c")),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParam { .. }));
    }
}
