use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::common::{CommonParserOptions, ParseCounters};
use super::{parse_options, Processor};
use crate::model::{EventGroup, LogEvent, SourceBuffer};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::util::AlarmType;

pub const NAME: &str = "parse_json_native";

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    #[serde(flatten)]
    common: CommonParserOptions,
}

/// Flattens one level of a JSON object into event fields. String values are
/// stored unquoted; anything nested is re-serialized as JSON text.
#[derive(Debug, Default)]
pub struct JsonParser {
    source_key: String,
    common: CommonParserOptions,
    ctx: Option<Arc<PipelineContext>>,
    counters: ParseCounters,
}

impl JsonParser {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    fn process_event(&self, buf: &mut SourceBuffer, event: &mut LogEvent) -> bool {
        let Some(span) = event.get_content(buf, self.source_key.as_bytes()) else {
            return true;
        };
        self.counters.add_in_bytes(span.len());

        let parsed: Option<serde_json::Map<String, Value>> = serde_json::from_slice::<Value>(buf.get(span))
            .ok()
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            });

        let Some(object) = parsed else {
            self.counters.record_error();
            if let Some(ctx) = &self.ctx {
                if ctx.alarm.allow(AlarmType::ParseLogFail) {
                    let sample = buf.get(span);
                    tracing::warn!(
                        processor = NAME,
                        config = %ctx.config_name,
                        sample = %String::from_utf8_lossy(&sample[..sample.len().min(1024)]),
                        "log line is not a json object"
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
        for (key, value) in &object {
            if key.as_bytes() == self.source_key.as_bytes() {
                source_overwritten = true;
            }
            if key == "__raw__" {
                raw_overwritten = true;
            }
            let key_ref = buf.alloc(key.as_bytes());
            let value_ref = match value {
                Value::String(s) => buf.alloc(s.as_bytes()),
                other => buf.alloc(other.to_string().as_bytes()),
            };
            self.counters.add_out_bytes(key_ref.len() + value_ref.len());
            event.set_content(buf, key_ref, value_ref);
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

impl Processor for JsonParser {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.unwrap_or_else(|| "content".to_string());
        self.common = opts.common;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if group.events().is_empty() {
            return;
        }
        let (buf, events) = group.split_mut();
        events.retain_mut(|event| self.process_event(buf, event));
    }
}
