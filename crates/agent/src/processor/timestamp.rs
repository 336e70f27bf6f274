use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::common::ParseCounters;
use super::{parse_options, Processor};
use crate::model::{EventGroup, LogEvent, SourceBuffer};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::util::strptime::{parse_timezone_offset, strptime};
use crate::util::AlarmType;

pub const NAME: &str = "parse_timestamp_native";

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    source_format: Option<String>,
    source_timezone: Option<String>,
    source_year: i32,
    keeping_source_when_parse_fail: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            source_key: None,
            source_format: None,
            source_timezone: None,
            source_year: -1,
            keeping_source_when_parse_fail: false,
        }
    }
}

/// Converts a configured source field into the event time using a
/// strptime-style format and a fixed timezone offset. The source field is
/// a time column, so it is never removed.
#[derive(Debug, Default)]
pub struct TimestampParser {
    source_key: String,
    source_format: String,
    tz_offset_secs: i64,
    source_year: Option<i32>,
    keeping_source_when_parse_fail: bool,
    ctx: Option<Arc<PipelineContext>>,
    counters: ParseCounters,
}

/// One-entry cache over the exact consumed time substring.
#[derive(Default)]
struct TimeCache {
    text: Vec<u8>,
    secs: i64,
    nanos: u32,
}

impl TimestampParser {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    fn process_event(
        &self,
        buf: &mut SourceBuffer,
        event: &mut LogEvent,
        cache: &mut TimeCache,
        now: i64,
    ) -> bool {
        let Some(span) = event.get_content(buf, self.source_key.as_bytes()) else {
            return true;
        };
        self.counters.add_in_bytes(span.len());

        let parsed = {
            let bytes = buf.get(span);
            if !cache.text.is_empty() && bytes == &cache.text[..] {
                Some((cache.secs, cache.nanos))
            } else {
                match strptime(bytes, &self.source_format, self.source_year) {
                    Some((t, _)) => {
                        cache.text.clear();
                        cache.text.extend_from_slice(bytes);
                        cache.secs = t.secs;
                        cache.nanos = t.nanos;
                        Some((t.secs, t.nanos))
                    }
                    None => None,
                }
            }
        };

        let Some((secs, nanos)) = parsed else {
            self.counters.record_error();
            if let Some(ctx) = &self.ctx {
                if ctx.alarm.allow(AlarmType::ParseTimeFail) {
                    let sample = buf.get(span);
                    tracing::warn!(
                        processor = NAME,
                        config = %ctx.config_name,
                        format = %self.source_format,
                        sample = %String::from_utf8_lossy(&sample[..sample.len().min(1024)]),
                        "time field does not match the configured format"
                    );
                }
            }
            if !self.keeping_source_when_parse_fail {
                self.counters.record_discard();
                return false;
            }
            return true;
        };

        let epoch = secs - self.tz_offset_secs;
        let discard_interval = self
            .ctx
            .as_ref()
            .map(|c| c.global.discard_old_interval_secs)
            .unwrap_or(0);
        if discard_interval > 0 && now - epoch > discard_interval {
            if let Some(ctx) = &self.ctx {
                if ctx.alarm.allow(AlarmType::OutdatedLog) {
                    tracing::warn!(
                        processor = NAME,
                        config = %ctx.config_name,
                        parsed_time = epoch,
                        "discard history log line"
                    );
                }
            }
            self.counters.record_history_failure();
            self.counters.record_discard();
            return false;
        }

        event.set_timestamp(epoch, nanos);
        true
    }
}

impl Processor for TimestampParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.ok_or(ConfigError::MissingParam {
            plugin: NAME,
            param: "SourceKey",
        })?;
        self.source_format = opts.source_format.ok_or(ConfigError::MissingParam {
            plugin: NAME,
            param: "SourceFormat",
        })?;
        self.tz_offset_secs = match opts.source_timezone.as_deref() {
            None | Some("") => 0,
            Some(spec) => parse_timezone_offset(spec).ok_or_else(|| ConfigError::InvalidParam {
                plugin: NAME,
                param: "SourceTimezone",
                reason: format!("expected GMT+HH:MM or GMT-HH:MM, got {spec:?}"),
            })? as i64,
        };
        self.source_year = (opts.source_year >= 0).then_some(opts.source_year);
        self.keeping_source_when_parse_fail = opts.keeping_source_when_parse_fail;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if group.events().is_empty() {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        let mut cache = TimeCache::default();
        let (buf, events) = group.split_mut();
        events.retain_mut(|event| self.process_event(buf, event, &mut cache, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::keys;

    fn parser(opts: Value) -> TimestampParser {
        let mut p = TimestampParser::default();
        p.init(&opts, Arc::new(PipelineContext::new("test-config"))).unwrap();
        p
    }

    fn group_with_time(time: &[u8]) -> EventGroup {
        let mut group = EventGroup::new();
        let (buf, events) = group.split_mut();
        let time_key = buf.alloc(b"time");
        let time_val = buf.alloc(time);
        let content = buf.alloc(b"payload");
        let mut ev = LogEvent::with_content(keys::DEFAULT_CONTENT, content);
        ev.set_content(buf, time_key, time_val);
        events.push(ev);
        group
    }

    fn run_at(p: &TimestampParser, group: &mut EventGroup, now: i64) -> bool {
        let mut cache = TimeCache::default();
        let (buf, events) = group.split_mut();
        p.process_event(buf, &mut events[0], &mut cache, now)
    }

    #[test]
    fn test_sets_event_time() {
        let p = parser(serde_json::json!({
            "SourceKey": "time",
            "SourceFormat": "%Y-%m-%d %H:%M:%S",
        }));
        let mut g = group_with_time(b"2023-09-04 13:15:04");
        assert!(run_at(&p, &mut g, 1693833304 + 5));
        assert_eq!(g.events()[0].timestamp, 1693833304);
        // source time column is retained
        assert!(g.events()[0].has_content(g.buf(), b"time"));
    }

    #[test]
    fn test_timezone_shift() {
        let p = parser(serde_json::json!({
            "SourceKey": "time",
            "SourceFormat": "%Y-%m-%d %H:%M:%S",
            "SourceTimezone": "GMT+08:00",
        }));
        let mut g = group_with_time(b"2023-09-04 21:15:04");
        assert!(run_at(&p, &mut g, 1693833304 + 5));
        assert_eq!(g.events()[0].timestamp, 1693833304);
    }

    #[test]
    fn test_configured_year() {
        let p = parser(serde_json::json!({
            "SourceKey": "time",
            "SourceFormat": "%m-%d %H:%M:%S",
            "SourceYear": 2023,
        }));
        let mut g = group_with_time(b"09-04 13:15:04");
        assert!(run_at(&p, &mut g, 1693833304 + 5));
        assert_eq!(g.events()[0].timestamp, 1693833304);
    }

    #[test]
    fn test_history_data_discarded() {
        let p = parser(serde_json::json!({
            "SourceKey": "time",
            "SourceFormat": "%Y-%m-%d %H:%M:%S",
        }));
        let mut g = group_with_time(b"2023-09-04 13:15:04");
        // a day later with the default 12h interval
        assert!(!run_at(&p, &mut g, 1693833304 + 86400));
    }

    #[test]
    fn test_parse_failure_policy() {
        let discard = parser(serde_json::json!({
            "SourceKey": "time",
            "SourceFormat": "%Y-%m-%d %H:%M:%S",
        }));
        let mut g = group_with_time(b"not a time");
        assert!(!run_at(&discard, &mut g, 0));

        let keep = parser(serde_json::json!({
            "SourceKey": "time",
            "SourceFormat": "%Y-%m-%d %H:%M:%S",
            "KeepingSourceWhenParseFail": true,
        }));
        let mut g = group_with_time(b"not a time");
        assert!(run_at(&keep, &mut g, 0));
        assert_eq!(g.events()[0].timestamp, 0);
    }

    #[test]
    fn test_missing_params_rejected() {
        let mut p = TimestampParser::default();
        let err = p
            .init(&serde_json::json!({}), Arc::new(PipelineContext::new("c")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingParam { .. }));
    }
}
