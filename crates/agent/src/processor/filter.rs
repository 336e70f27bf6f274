use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_options, Processor};
use crate::model::{EventGroup, LogEvent, SourceBuffer};
use crate::pipeline::{ConfigError, PipelineContext};

pub const NAME: &str = "filter_regex_native";

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    include: Option<serde_json::Map<String, Value>>,
    condition_exp: Option<Value>,
    #[serde(rename = "DiscardingNonUTF8")]
    discarding_non_utf8: bool,
}

/// Boolean tree over regex leaves. A leaf on a missing field evaluates to
/// false; `and`/`or` short-circuit.
#[derive(Debug)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Match { key: String, regex: Regex },
}

impl FilterExpr {
    fn eval(&self, buf: &SourceBuffer, event: &LogEvent) -> bool {
        match self {
            FilterExpr::And(l, r) => l.eval(buf, event) && r.eval(buf, event),
            FilterExpr::Or(l, r) => l.eval(buf, event) || r.eval(buf, event),
            FilterExpr::Not(inner) => !inner.eval(buf, event),
            FilterExpr::Match { key, regex } => match event.get_content(buf, key.as_bytes()) {
                Some(span) => regex.is_match(buf.get(span)),
                None => false,
            },
        }
    }

    /// Parse `{"operator": "and"|"or"|"not", "operands": [...]}` internal
    /// nodes and `{"key": ..., "exp": ..., "type": "regex"}` leaves.
    fn parse(value: &Value) -> Result<FilterExpr, ConfigError> {
        let obj = value.as_object().ok_or_else(|| bad_exp("node is not an object"))?;

        if let Some(op) = obj.get("operator").and_then(|v| v.as_str()) {
            let operands = obj
                .get("operands")
                .and_then(|v| v.as_array())
                .ok_or_else(|| bad_exp("operator node has no operands array"))?;
            return match (op.to_ascii_lowercase().as_str(), operands.len()) {
                ("not", 1) => Ok(FilterExpr::Not(Box::new(Self::parse(&operands[0])?))),
                ("and", 2) => Ok(FilterExpr::And(
                    Box::new(Self::parse(&operands[0])?),
                    Box::new(Self::parse(&operands[1])?),
                )),
                ("or", 2) => Ok(FilterExpr::Or(
                    Box::new(Self::parse(&operands[0])?),
                    Box::new(Self::parse(&operands[1])?),
                )),
                (other, n) => Err(bad_exp(&format!(
                    "operator {other:?} with {n} operands is not supported"
                ))),
            };
        }

        let key = obj
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad_exp("leaf node has no key"))?;
        let exp = obj
            .get("exp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad_exp("leaf node has no exp"))?;
        if let Some(leaf_type) = obj.get("type").and_then(|v| v.as_str()) {
            if !leaf_type.eq_ignore_ascii_case("regex") {
                return Err(bad_exp(&format!("leaf type {leaf_type:?} is not supported")));
            }
        }
        let regex = Regex::new(&format!("^(?s:{exp})$"))
            .map_err(|e| ConfigError::bad_regex(NAME, exp, e))?;
        Ok(FilterExpr::Match {
            key: key.to_string(),
            regex,
        })
    }
}

fn bad_exp(reason: &str) -> ConfigError {
    ConfigError::InvalidParam {
        plugin: NAME,
        param: "ConditionExp",
        reason: reason.to_string(),
    }
}

#[derive(Debug)]
enum FilterMode {
    None,
    Include(Vec<(String, Regex)>),
    Expression(FilterExpr),
}

impl Default for FilterMode {
    fn default() -> Self {
        FilterMode::None
    }
}

/// Drops events that do not satisfy the configured condition, then
/// optionally rewrites any non-UTF-8 byte to a space in the survivors.
#[derive(Debug, Default)]
pub struct RegexFilter {
    mode: FilterMode,
    discarding_non_utf8: bool,
    #[allow(dead_code)]
    ctx: Option<Arc<PipelineContext>>,
    discarded_total: AtomicU64,
}

impl RegexFilter {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    fn passes(&self, buf: &SourceBuffer, event: &LogEvent) -> bool {
        if event.is_empty() {
            return false;
        }
        match &self.mode {
            FilterMode::None => true,
            FilterMode::Include(rules) => rules.iter().all(|(key, regex)| {
                match event.get_content(buf, key.as_bytes()) {
                    Some(span) => regex.is_match(buf.get(span)),
                    None => false,
                }
            }),
            FilterMode::Expression(expr) => expr.eval(buf, event),
        }
    }
}

impl Processor for RegexFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.mode = match (opts.include, opts.condition_exp) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidParam {
                    plugin: NAME,
                    param: "Include",
                    reason: "Include and ConditionExp are mutually exclusive".to_string(),
                })
            }
            (Some(include), None) => {
                let mut rules = Vec::with_capacity(include.len());
                for (key, exp) in include {
                    let exp = exp.as_str().ok_or_else(|| ConfigError::InvalidParam {
                        plugin: NAME,
                        param: "Include",
                        reason: format!("expression for key {key:?} is not a string"),
                    })?;
                    let regex = Regex::new(&format!("^(?s:{exp})$"))
                        .map_err(|e| ConfigError::bad_regex(NAME, exp, e))?;
                    rules.push((key, regex));
                }
                FilterMode::Include(rules)
            }
            (None, Some(exp)) => FilterMode::Expression(FilterExpr::parse(&exp)?),
            (None, None) => FilterMode::None,
        };
        self.discarding_non_utf8 = opts.discarding_non_utf8;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if group.events().is_empty() {
            return;
        }
        let (buf, events) = group.split_mut();
        events.retain(|event| {
            let keep = self.passes(buf, event);
            if !keep {
                self.discarded_total.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });
        if self.discarding_non_utf8 {
            for event in events.iter_mut() {
                let entries: Vec<_> = event.contents().to_vec();
                for (k, v) in entries {
                    sanitize_utf8(buf.get_mut(k));
                    sanitize_utf8(buf.get_mut(v));
                }
            }
        }
    }
}

/// Byte walker over the 1-4 byte UTF-8 forms. Every byte of an invalid
/// sequence (bad continuation, overlong, surrogate, out of range) becomes
/// an ASCII space. Idempotent: a sanitized buffer passes through unchanged.
pub fn sanitize_utf8(bytes: &mut [u8]) -> bool {
    let len = bytes.len();
    let mut modified = false;
    let mut i = 0usize;
    while i < len {
        let b = bytes[i];
        if b & 0x80 == 0 {
            i += 1;
        } else if b & 0xe0 == 0xc0 {
            if i + 1 >= len || bytes[i + 1] & 0xc0 != 0x80 {
                bytes[i] = b' ';
                modified = true;
                i += 1;
                continue;
            }
            let unicode = ((b as u32 & 0x1f) << 6) | (bytes[i + 1] as u32 & 0x3f);
            if !(0x80..=0x7ff).contains(&unicode) {
                bytes[i] = b' ';
                modified = true;
                i += 1;
                continue;
            }
            i += 2;
        } else if b & 0xf0 == 0xe0 {
            if i + 2 >= len || bytes[i + 1] & 0xc0 != 0x80 || bytes[i + 2] & 0xc0 != 0x80 {
                bytes[i] = b' ';
                modified = true;
                i += 1;
                continue;
            }
            let unicode = ((b as u32 & 0x0f) << 12)
                | ((bytes[i + 1] as u32 & 0x3f) << 6)
                | (bytes[i + 2] as u32 & 0x3f);
            if !(0x800..=0xffff).contains(&unicode) || (0xd800..=0xdfff).contains(&unicode) {
                bytes[i] = b' ';
                modified = true;
                i += 1;
                continue;
            }
            i += 3;
        } else if b & 0xf8 == 0xf0 {
            if i + 3 >= len
                || bytes[i + 1] & 0xc0 != 0x80
                || bytes[i + 2] & 0xc0 != 0x80
                || bytes[i + 3] & 0xc0 != 0x80
            {
                bytes[i] = b' ';
                modified = true;
                i += 1;
                continue;
            }
            let unicode = ((b as u32 & 0x07) << 18)
                | ((bytes[i + 1] as u32 & 0x3f) << 12)
                | ((bytes[i + 2] as u32 & 0x3f) << 6)
                | (bytes[i + 3] as u32 & 0x3f);
            if !(0x10000..=0x10ffff).contains(&unicode) {
                bytes[i] = b' ';
                modified = true;
                i += 1;
                continue;
            }
            i += 4;
        } else {
            bytes[i] = b' ';
            modified = true;
            i += 1;
        }
    }
    modified
}
