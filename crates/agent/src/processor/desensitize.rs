use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_options, Processor};
use crate::model::{EventGroup, LogEvent, SourceBuffer};
use crate::pipeline::{ConfigError, PipelineContext};

pub const NAME: &str = "desensitize_native";

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    method: Option<String>,
    replacing_string: Option<String>,
    content_pattern_before_replaced_string: Option<String>,
    replaced_content_pattern: Option<String>,
    replacing_all: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Const,
    Md5,
}

impl Default for Method {
    fn default() -> Self {
        Method::Const
    }
}

/// Rewrites sensitive spans of one field. `const` substitutes the
/// configured string (regex backreferences available); `md5` substitutes
/// the hex digest of the matched sensitive content. The rewritten value is
/// written back into the arena.
#[derive(Debug, Default)]
pub struct Desensitizer {
    source_key: String,
    method: Method,
    regex: Option<Regex>,
    /// Expansion template for const mode, `$N`-style.
    template: Vec<u8>,
    /// Whether the compiled regex carries the kept-prefix group 1.
    has_before_group: bool,
    replacing_all: bool,
    #[allow(dead_code)]
    ctx: Option<Arc<PipelineContext>>,
    desensitized_total: AtomicU64,
}

/// Convert `\N` backreferences to the `${N}` expansion syntax and escape
/// literal `$`.
fn convert_backrefs(replacing: &str) -> Vec<u8> {
    let bytes = replacing.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() => {
                out.extend_from_slice(b"${");
                out.push(bytes[i + 1]);
                out.push(b'}');
                i += 2;
            }
            b'\\' if i + 1 < bytes.len() && bytes[i + 1] == b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            b'$' => {
                out.extend_from_slice(b"$$");
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

impl Desensitizer {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    /// Rewrite matches of the rule in `input`. Returns None when nothing
    /// matched.
    fn rewrite(&self, input: &[u8]) -> Option<Vec<u8>> {
        let re = self.regex.as_ref()?;
        let mut out: Vec<u8> = Vec::with_capacity(input.len());
        let mut last = 0usize;
        let mut replaced = false;
        for caps in re.captures_iter(input) {
            let m = caps.get(0).expect("group 0 always present");
            out.extend_from_slice(&input[last..m.start()]);
            match self.method {
                Method::Const => caps.expand(&self.template, &mut out),
                Method::Md5 => {
                    let sensitive_start = if self.has_before_group {
                        let prefix = caps.get(1).map(|g| (g.start(), g.end()));
                        if let Some((s, e)) = prefix {
                            out.extend_from_slice(&input[s..e]);
                            e
                        } else {
                            m.start()
                        }
                    } else {
                        m.start()
                    };
                    let digest = md5::compute(&input[sensitive_start..m.end()]);
                    out.extend_from_slice(format!("{digest:x}").as_bytes());
                }
            }
            last = m.end();
            replaced = true;
            if !self.replacing_all {
                break;
            }
        }
        if !replaced {
            return None;
        }
        out.extend_from_slice(&input[last..]);
        Some(out)
    }

    fn process_event(&self, buf: &mut SourceBuffer, event: &mut LogEvent) {
        let Some(span) = event.get_content(buf, self.source_key.as_bytes()) else {
            return;
        };
        let rewritten = self.rewrite(buf.get(span));
        if let Some(out) = rewritten {
            let new_span = buf.alloc(&out);
            event.set_content_by_key(buf, self.source_key.as_bytes(), new_span);
            self.desensitized_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Processor for Desensitizer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.ok_or(ConfigError::MissingParam {
            plugin: NAME,
            param: "SourceKey",
        })?;
        self.method = match opts.method.as_deref() {
            Some("const") => Method::Const,
            Some("md5") => Method::Md5,
            Some(other) => {
                return Err(ConfigError::InvalidParam {
                    plugin: NAME,
                    param: "Method",
                    reason: format!("expected \"const\" or \"md5\", got {other:?}"),
                })
            }
            None => {
                return Err(ConfigError::MissingParam {
                    plugin: NAME,
                    param: "Method",
                })
            }
        };

        let content = opts
            .replaced_content_pattern
            .ok_or(ConfigError::MissingParam {
                plugin: NAME,
                param: "ReplacedContentPattern",
            })?;
        let before = opts
            .content_pattern_before_replaced_string
            .unwrap_or_default();
        let pattern = if before.is_empty() {
            self.has_before_group = false;
            content
        } else {
            self.has_before_group = true;
            format!("({before}){content}")
        };
        self.regex = Some(
            Regex::new(&pattern).map_err(|e| ConfigError::bad_regex(NAME, &pattern, e))?,
        );

        if self.method == Method::Const {
            let replacing = opts.replacing_string.ok_or(ConfigError::MissingParam {
                plugin: NAME,
                param: "ReplacingString",
            })?;
            let mut template = Vec::new();
            if self.has_before_group {
                template.extend_from_slice(b"${1}");
            }
            template.extend_from_slice(&convert_backrefs(&replacing));
            self.template = template;
        }
        self.replacing_all = opts.replacing_all.unwrap_or(true);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if group.events().is_empty() {
            return;
        }
        let (buf, events) = group.split_mut();
        for event in events.iter_mut() {
            self.process_event(buf, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::keys;

    fn rule(opts: Value) -> Desensitizer {
        let mut p = Desensitizer::default();
        p.init(&opts, Arc::new(PipelineContext::new("test-config"))).unwrap();
        p
    }

    fn group_with_field(key: &[u8], value: &[u8]) -> EventGroup {
        let mut group = EventGroup::new();
        let (buf, events) = group.split_mut();
        let k = buf.alloc(key);
        let v = buf.alloc(value);
        events.push(LogEvent::with_content(k, v));
        group
    }

    fn field(group: &EventGroup, key: &[u8]) -> Vec<u8> {
        let span = group.events()[0].get_content(group.buf(), key).unwrap();
        group.buf().get(span).to_vec()
    }

    #[test]
    fn test_const_with_backreference_replace_all() {
        let p = rule(serde_json::json!({
            "SourceKey": "cast1",
            "Method": "const",
            "ReplacedContentPattern": "(pwd=)[^,]+",
            "ReplacingString": r"\1********",
            "ReplacingAll": true,
        }));
        let mut g = group_with_field(b"cast1", b"pwd=a,pwd=b,df");
        p.process(&mut g);
        assert_eq!(field(&g, b"cast1"), b"pwd=********,pwd=********,df");
    }

    #[test]
    fn test_const_first_match_only() {
        let p = rule(serde_json::json!({
            "SourceKey": "cast1",
            "Method": "const",
            "ReplacedContentPattern": "(pwd=)[^,]+",
            "ReplacingString": r"\1********",
            "ReplacingAll": false,
        }));
        let mut g = group_with_field(b"cast1", b"pwd=a,pwd=b");
        p.process(&mut g);
        assert_eq!(field(&g, b"cast1"), b"pwd=********,pwd=b");
    }

    #[test]
    fn test_before_pattern_keeps_prefix() {
        let p = rule(serde_json::json!({
            "SourceKey": "msg",
            "Method": "const",
            "ContentPatternBeforeReplacedString": "token: ",
            "ReplacedContentPattern": r"\S+",
            "ReplacingString": "<hidden>",
        }));
        let mut g = group_with_field(b"msg", b"token: abc123 rest");
        p.process(&mut g);
        assert_eq!(field(&g, b"msg"), b"token: <hidden> rest");
    }

    #[test]
    fn test_md5_mode() {
        let p = rule(serde_json::json!({
            "SourceKey": "msg",
            "Method": "md5",
            "ContentPatternBeforeReplacedString": "id=",
            "ReplacedContentPattern": r"\d+",
        }));
        let mut g = group_with_field(b"msg", b"id=12345");
        p.process(&mut g);
        let expected = format!("id={:x}", md5::compute(b"12345"));
        assert_eq!(field(&g, b"msg"), expected.as_bytes());
    }

    #[test]
    fn test_no_match_leaves_value() {
        let p = rule(serde_json::json!({
            "SourceKey": "msg",
            "Method": "const",
            "ReplacedContentPattern": "secret",
            "ReplacingString": "*",
        }));
        let mut g = group_with_field(b"msg", b"nothing to hide");
        p.process(&mut g);
        assert_eq!(field(&g, b"msg"), b"nothing to hide");
    }

    #[test]
    fn test_missing_method_rejected() {
        let mut p = Desensitizer::default();
        let err = p
            .init(
                &serde_json::json!({"SourceKey": "k", "ReplacedContentPattern": "x"}),
                Arc::new(PipelineContext::new("c")),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingParam { .. }));
    }
}
