use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{parse_options, Processor};
use crate::model::{keys, EventGroup, LogEvent};
use crate::pipeline::{ConfigError, PipelineContext};

pub const NAME: &str = "split_log_string_native";

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    split_char: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            source_key: None,
            split_char: "\n".to_string(),
        }
    }
}

/// First stage of every file pipeline: splits the single raw event of a
/// fresh read into one event per line, zero-copy views into the arena. A
/// trailing separator does not produce an empty last event.
#[derive(Debug)]
pub struct SplitLogString {
    source_key: String,
    split_byte: u8,
}

impl Default for SplitLogString {
    fn default() -> Self {
        Self {
            source_key: "content".to_string(),
            split_byte: b'\n',
        }
    }
}

impl SplitLogString {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }
}

impl Processor for SplitLogString {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, _ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.unwrap_or_else(|| "content".to_string());
        if opts.split_char.len() != 1 {
            return Err(ConfigError::InvalidParam {
                plugin: NAME,
                param: "SplitChar",
                reason: "must be a single byte".to_string(),
            });
        }
        self.split_byte = opts.split_char.as_bytes()[0];
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        let (buf, events) = group.split_mut();
        let src = std::mem::take(events);
        for event in src {
            let Some(span) = event.get_content(buf, self.source_key.as_bytes()) else {
                events.push(event);
                continue;
            };
            let bytes = buf.get(span);
            let len = bytes.len();
            let mut line_start = 0usize;
            let mut lines = Vec::new();
            for i in 0..len {
                if bytes[i] == self.split_byte {
                    lines.push((line_start, i));
                    line_start = i + 1;
                }
            }
            if line_start < len {
                lines.push((line_start, len));
            }
            for (start, end) in lines {
                let mut line_event = LogEvent::with_content(keys::DEFAULT_CONTENT, span.slice(start, end));
                line_event.set_timestamp(event.timestamp, event.timestamp_nanos);
                events.push(line_event);
            }
        }
    }
}
