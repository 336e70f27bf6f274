use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::common::{CommonParserOptions, ParseCounters};
use super::{parse_options, Processor};
use crate::model::{keys, EventGroup, LogEvent, SourceBuffer, StrRef};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::util::strptime::{parse_timezone_offset, strptime, ParsedTime};
use crate::util::AlarmType;

pub const NAME: &str = "parse_apsara_native";

const MAX_BASE_FIELDS: usize = 10;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    timezone: Option<String>,
    adjusting_micro_timezone: bool,
    #[serde(flatten)]
    common: CommonParserOptions,
}

/// Parses the apsara line layout: a bracketed time prefix, heuristic
/// bracketed base fields (level / thread / file:line), then tab-separated
/// `key:value` tokens. Always writes `microtime`.
#[derive(Debug, Default)]
pub struct ApsaraParser {
    source_key: String,
    tz_offset_secs: i64,
    adjust_micro_timezone: bool,
    common: CommonParserOptions,
    ctx: Option<Arc<PipelineContext>>,
    counters: ParseCounters,
}

/// One-entry cache: consecutive lines usually share the 19-char calendar
/// prefix, so only the fraction is re-parsed.
#[derive(Default)]
struct TimeCache {
    prefix: Vec<u8>,
    secs: i64,
}

impl ApsaraParser {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    /// `[<epoch>]...` or `[YYYY-MM-DD HH:MM:SS.ffffff]...`; returns the
    /// parsed time or None on failure.
    fn parse_time(&self, bytes: &[u8], cache: &mut TimeCache) -> Option<ParsedTime> {
        if bytes.first() != Some(&b'[') {
            return None;
        }
        // Epoch seconds start with '1' for any realistic agent uptime
        if bytes.get(1) == Some(&b'1') {
            let (t, used) = strptime(&bytes[1..], "%s", None)?;
            if bytes.get(1 + used) != Some(&b']') {
                return None;
            }
            return Some(t);
        }

        const PREFIX_LEN: usize = 19; // "2013-09-11 03:11:05"
        if !cache.prefix.is_empty() && bytes.len() > PREFIX_LEN && bytes[1..].starts_with(&cache.prefix) {
            let mut nanos = 0u32;
            let mut end = 1 + PREFIX_LEN;
            if bytes.get(end) == Some(&b'.') {
                let (t, used) = strptime(&bytes[end + 1..], "%f", None)?;
                nanos = t.nanos;
                end += 1 + used;
            }
            if bytes.get(end) != Some(&b']') {
                return None;
            }
            return Some(ParsedTime {
                secs: cache.secs,
                nanos,
            });
        }

        let (t, used) = strptime(&bytes[1..], "%Y-%m-%d %H:%M:%S.%f", None)?;
        if bytes.get(1 + used) != Some(&b']') {
            return None;
        }
        cache.prefix.clear();
        cache.prefix.extend_from_slice(&bytes[1..1 + PREFIX_LEN]);
        cache.secs = t.secs;
        Some(t)
    }

    /// Bracketed fields after the time, stopping at the first tab that is
    /// not followed by `[`. Returns detected fields and the scan position
    /// (the closing bracket of the last base field).
    fn parse_base_fields(&self, bytes: &[u8], out: &mut Vec<(StrRef, StrRef)>, span: StrRef) -> usize {
        let mut begins = [0usize; MAX_BASE_FIELDS];
        let mut ends = [0usize; MAX_BASE_FIELDS];
        let mut count = 0usize;
        let mut i = 0usize;
        while i < bytes.len() && count < MAX_BASE_FIELDS {
            if bytes[i] == b'[' {
                begins[count] = i + 1;
            } else if bytes[i] == b']' {
                let next = bytes.get(i + 1);
                if next.is_none() || next == Some(&b'\t') || next == Some(&b'\n') {
                    ends[count] = i;
                    count += 1;
                }
                if next == Some(&b'\t') && bytes.get(i + 2) != Some(&b'[') {
                    break;
                }
            }
            i += 1;
        }
        if count == 0 {
            return 0;
        }

        let mut found_level = false;
        let mut found_thread = false;
        let mut found_file = false;
        for f in 1..count {
            let (b, e) = (begins[f], ends[f]);
            let token = &bytes[b..e];
            if !found_level && !token.is_empty() && token.iter().all(|c| c.is_ascii_uppercase()) {
                found_level = true;
                out.push((keys::LEVEL, span.slice(b, e)));
            } else if !found_thread && !token.is_empty() && token.iter().all(|c| c.is_ascii_digit()) {
                found_thread = true;
                out.push((keys::THREAD, span.slice(b, e)));
            } else if !found_file && token.iter().any(|c| *c == b'/' || *c == b'.') {
                found_file = true;
                out.push((keys::FILE, span.slice(b, e)));
                if let Some(colon) = token.iter().position(|c| *c == b':') {
                    out.push((keys::LINE, span.slice(b + colon + 1, e)));
                }
            }
            if found_level && found_thread && found_file {
                break;
            }
        }
        ends[count - 1]
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

        let parsed_time = {
            let bytes = buf.get(span);
            self.parse_time(bytes, cache)
        };
        let Some(time) = parsed_time else {
            self.counters.record_error();
            if let Some(ctx) = &self.ctx {
                if ctx.alarm.allow(AlarmType::ParseTimeFail) {
                    let sample = buf.get(span);
                    tracing::warn!(
                        processor = NAME,
                        config = %ctx.config_name,
                        sample = %String::from_utf8_lossy(&sample[..sample.len().min(1024)]),
                        "discard log line with unparseable apsara time"
                    );
                }
            }
            let kept = self.common.on_fail(buf, event, self.source_key.as_bytes(), span);
            if !kept {
                self.counters.record_discard();
            }
            return kept;
        };

        let discard_interval = self
            .ctx
            .as_ref()
            .map(|c| c.global.discard_old_interval_secs)
            .unwrap_or(0);
        if discard_interval > 0 && now - time.secs + self.tz_offset_secs > discard_interval {
            if let Some(ctx) = &self.ctx {
                if ctx.alarm.allow(AlarmType::OutdatedLog) {
                    tracing::warn!(
                        processor = NAME,
                        config = %ctx.config_name,
                        parsed_time = time.secs,
                        "discard history log line"
                    );
                }
            }
            self.counters.record_history_failure();
            self.counters.record_discard();
            return false;
        }

        event.set_timestamp(time.secs, time.nanos);

        let mut fields: Vec<(StrRef, StrRef)> = Vec::new();
        let scan_from = {
            let bytes = buf.get(span);
            self.parse_base_fields(bytes, &mut fields, span)
        };

        // Tab-separated key:value tokens after the base fields
        {
            let bytes = buf.get(span);
            let mut beg = if scan_from == 0 { 0 } else { scan_from + 1 };
            let mut colon: Option<usize> = None;
            let mut i = scan_from;
            while i + 1 <= bytes.len() {
                i += 1;
                let at_end = i == bytes.len();
                if at_end || bytes[i] == b'\t' {
                    if let Some(c) = colon {
                        fields.push((span.slice(beg, c), span.slice(c + 1, i)));
                        colon = None;
                    }
                    beg = i + 1;
                } else if bytes[i] == b':' && colon.is_none() {
                    colon = Some(i);
                }
                if at_end {
                    break;
                }
            }
        }

        let mut source_overwritten = false;
        let mut raw_overwritten = false;
        let source_key = self.source_key.as_bytes();
        for (k, v) in &fields {
            let key_bytes = buf.get(*k);
            if key_bytes == source_key {
                source_overwritten = true;
            }
            if key_bytes == b"__raw__" {
                raw_overwritten = true;
            }
            self.counters.add_out_bytes(k.len() + v.len());
            event.set_content(buf, *k, *v);
        }

        let mut micros = time.micros();
        if self.adjust_micro_timezone {
            micros -= self.tz_offset_secs * 1_000_000;
        }
        let micros_ref = buf.alloc(micros.to_string().as_bytes());
        event.set_content(buf, keys::MICROTIME, micros_ref);

        self.common
            .on_success(buf, event, source_key, span, source_overwritten, raw_overwritten);
        true
    }
}

impl Processor for ApsaraParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.unwrap_or_else(|| "content".to_string());
        self.tz_offset_secs = match opts.timezone.as_deref() {
            None | Some("") => 0,
            Some(spec) => parse_timezone_offset(spec).ok_or_else(|| ConfigError::InvalidParam {
                plugin: NAME,
                param: "Timezone",
                reason: format!("expected GMT+HH:MM or GMT-HH:MM, got {spec:?}"),
            })? as i64,
        };
        self.adjust_micro_timezone = opts.adjusting_micro_timezone;
        self.common = opts.common;
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
