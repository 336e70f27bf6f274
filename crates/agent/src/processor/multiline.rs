use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_options, Processor};
use crate::model::{EventGroup, LogEvent, SourceBuffer, StrRef};
use crate::pipeline::{ConfigError, PipelineContext};
use crate::util::AlarmType;

pub const NAME: &str = "merge_multiline_log_native";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum UnmatchedContentTreatment {
    #[serde(rename = "DISCARD")]
    Discard,
    #[default]
    #[serde(rename = "SINGLE_LINE")]
    SingleLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    Flag,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Unmatch,
    Begin,
    Continue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Options {
    source_key: Option<String>,
    merge_type: Option<String>,
    start_pattern: Option<String>,
    continue_pattern: Option<String>,
    end_pattern: Option<String>,
    unmatched_content_treatment: UnmatchedContentTreatment,
}

/// Joins events that logically form one record.
///
/// Flag mode merges runs marked partial by the container-log parser with
/// the first full event that follows. Regex mode runs the
/// Unmatch/Begin/Continue state machine over start/continue/end anchors.
/// Merging extends the survivor's content view over the trailing fragments
/// via `copy_within`; merged-away events are removed from the group.
#[derive(Debug)]
pub struct MultilineMerger {
    source_key: String,
    mode: MergeMode,
    start: Option<Regex>,
    cont: Option<Regex>,
    end: Option<Regex>,
    unmatched: UnmatchedContentTreatment,
    ctx: Option<Arc<PipelineContext>>,
    merged_events_total: AtomicU64,
    unmatched_discarded_total: AtomicU64,
}

impl Default for MultilineMerger {
    fn default() -> Self {
        Self {
            source_key: "content".to_string(),
            mode: MergeMode::Flag,
            start: None,
            cont: None,
            end: None,
            unmatched: UnmatchedContentTreatment::SingleLine,
            ctx: None,
            merged_events_total: AtomicU64::new(0),
            unmatched_discarded_total: AtomicU64::new(0),
        }
    }
}

/// Compile a full-line anchor the way the merger matches lines: the whole
/// content must match the pattern.
fn compile_anchor(pattern: &Option<String>) -> Result<Option<Regex>, regex::Error> {
    match pattern.as_deref() {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(&format!("^(?s:{p})$")).map(Some),
    }
}

impl MultilineMerger {
    pub fn boxed() -> Box<dyn Processor> {
        Box::new(Self::default())
    }

    fn matches(&self, re: &Option<Regex>, buf: &SourceBuffer, event: &LogEvent) -> bool {
        let Some(re) = re else { return false };
        let content = match event.get_content(buf, self.source_key.as_bytes()) {
            Some(span) => buf.get(span),
            None => return false,
        };
        re.is_match(content)
    }

    /// Merge `run[1..]` into `run[0]`, joining with `\n` when requested.
    /// Fragments always sit at strictly increasing offsets behind the
    /// survivor, so copying left can never overrun a pending fragment.
    fn merge_events(
        &self,
        buf: &mut SourceBuffer,
        events: &mut [LogEvent],
        run: &mut Vec<usize>,
        line_break: bool,
    ) {
        if run.len() <= 1 {
            run.clear();
            return;
        }
        let key = self.source_key.as_bytes();
        let survivor_span = events[run[0]]
            .get_content(buf, key)
            .unwrap_or(StrRef::EMPTY);
        let mut end = survivor_span.end();
        for &idx in &run[1..] {
            if line_break {
                buf.write_byte(end, b'\n');
                end += 1;
            }
            if let Some(frag) = events[idx].get_content(buf, key) {
                buf.copy_within(frag, end);
                end += frag.len();
            }
        }
        let merged = survivor_span.resized(end - survivor_span.offset());
        events[run[0]].set_content_by_key(buf, key, merged);
        self.merged_events_total
            .fetch_add((run.len() - 1) as u64, Ordering::Relaxed);
        run.clear();
    }

    /// Apply the unmatched policy to `events[from..=to]`, emitting into the
    /// compaction cursor. End-only configs defer judgement to group end
    /// (`must_handle`).
    #[allow(clippy::too_many_arguments)]
    fn handle_unmatched(
        &self,
        buf: &SourceBuffer,
        events: &mut [LogEvent],
        from: &mut usize,
        to: usize,
        out_size: &mut usize,
        must_handle: bool,
    ) {
        if !must_handle && self.start.is_none() && self.cont.is_none() && self.end.is_some() {
            return;
        }
        match self.unmatched {
            UnmatchedContentTreatment::Discard => {
                for i in *from..=to {
                    self.unmatched_discarded_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(ctx) = &self.ctx {
                        if ctx.alarm.allow(AlarmType::SplitLogFail) {
                            let sample = events[i]
                                .get_content(buf, self.source_key.as_bytes())
                                .map(|s| buf.get(s))
                                .unwrap_or_default();
                            tracing::warn!(
                                processor = NAME,
                                config = %ctx.config_name,
                                sample = %String::from_utf8_lossy(&sample[..sample.len().min(1024)]),
                                "merging log lines discards unmatched data, check the start anchor"
                            );
                        }
                    }
                }
            }
            UnmatchedContentTreatment::SingleLine => {
                for i in *from..=to {
                    events.swap(*out_size, i);
                    *out_size += 1;
                }
            }
        }
        *from = to + 1;
    }

    fn merge_by_flag(&self, group: &mut EventGroup) {
        let (buf, events) = group.split_mut();
        let src = std::mem::take(events);
        let mut out: Vec<LogEvent> = Vec::with_capacity(src.len());
        let mut run: Vec<LogEvent> = Vec::new();
        let mut partial = false;

        for mut event in src {
            if event.is_empty() {
                continue;
            }
            if partial {
                let is_part = event.has_content(buf, b"P");
                run.push(event);
                if !is_part {
                    out.push(self.merge_run(buf, std::mem::take(&mut run), false));
                    partial = false;
                }
            } else if event.has_content(buf, b"P") {
                event.del_content(buf, b"P");
                run.push(event);
                partial = true;
            } else {
                out.push(event);
            }
        }
        if !run.is_empty() {
            out.push(self.merge_run(buf, run, false));
        }
        *events = out;
    }

    /// Owned-run variant used by flag mode.
    fn merge_run(&self, buf: &mut SourceBuffer, mut run: Vec<LogEvent>, line_break: bool) -> LogEvent {
        if run.len() == 1 {
            return run.pop().expect("run is non-empty");
        }
        let key = self.source_key.as_bytes();
        let survivor_span = run[0].get_content(buf, key).unwrap_or(StrRef::EMPTY);
        let mut end = survivor_span.end();
        for frag_event in &run[1..] {
            if line_break {
                buf.write_byte(end, b'\n');
                end += 1;
            }
            if let Some(frag) = frag_event.get_content(buf, key) {
                buf.copy_within(frag, end);
                end += frag.len();
            }
        }
        let merged = survivor_span.resized(end - survivor_span.offset());
        self.merged_events_total
            .fetch_add((run.len() - 1) as u64, Ordering::Relaxed);
        let mut survivor = run.swap_remove(0);
        survivor.set_content_by_key(buf, key, merged);
        survivor
    }

    fn merge_by_regex(&self, group: &mut EventGroup) {
        let (buf, events) = group.split_mut();
        let len = events.len();
        let mut state = SplitState::Unmatch;
        let mut multi_begin = 0usize;
        let mut out_size = 0usize;
        let mut run: Vec<usize> = Vec::new();

        for cur in 0..len {
            if events[cur].is_empty() {
                continue;
            }
            run.push(cur);
            match state {
                SplitState::Unmatch => {
                    if self.start.is_some() {
                        if self.matches(&self.start, buf, &events[cur]) {
                            state = SplitState::Begin;
                        } else {
                            multi_begin = cur;
                            self.handle_unmatched(buf, events, &mut multi_begin, cur, &mut out_size, false);
                            run.clear();
                        }
                        continue;
                    }
                    if self.matches(&self.cont, buf, &events[cur]) {
                        state = SplitState::Continue;
                        continue;
                    }
                    if self.matches(&self.end, buf, &events[cur]) {
                        self.merge_events(buf, events, &mut run, true);
                        events.swap(out_size, multi_begin);
                        out_size += 1;
                        multi_begin = cur + 1;
                        continue;
                    }
                    if self.cont.is_none() && self.end.is_some() {
                        // End-only: cannot judge a line unmatched until the
                        // group boundary, keep caching.
                        continue;
                    }
                    multi_begin = cur;
                    self.handle_unmatched(buf, events, &mut multi_begin, cur, &mut out_size, false);
                    run.clear();
                }
                SplitState::Begin => {
                    if self.matches(&self.cont, buf, &events[cur]) {
                        state = SplitState::Continue;
                        continue;
                    }
                    if self.end.is_some() {
                        if self.matches(&self.end, buf, &events[cur]) {
                            self.merge_events(buf, events, &mut run, true);
                            events.swap(out_size, multi_begin);
                            out_size += 1;
                            multi_begin = cur + 1;
                            state = SplitState::Unmatch;
                        }
                        // else: start..end may span unmatched lines, keep caching
                    } else if self.start.is_some() {
                        if self.matches(&self.start, buf, &events[cur]) {
                            if multi_begin != cur {
                                run.pop();
                                self.merge_events(buf, events, &mut run, true);
                                run.push(cur);
                                events.swap(out_size, multi_begin);
                                out_size += 1;
                                multi_begin = cur;
                            }
                        } else if self.cont.is_some() {
                            // start+continue: an unmatched line closes the run
                            run.pop();
                            self.merge_events(buf, events, &mut run, true);
                            events.swap(out_size, multi_begin);
                            out_size += 1;
                            multi_begin = cur;
                            self.handle_unmatched(buf, events, &mut multi_begin, cur, &mut out_size, false);
                            run.clear();
                            state = SplitState::Unmatch;
                        }
                        // else: start-only keeps the unmatched line in the run
                    }
                }
                SplitState::Continue => {
                    if self.matches(&self.cont, buf, &events[cur]) {
                        continue;
                    }
                    if self.end.is_some() {
                        if self.matches(&self.end, buf, &events[cur]) {
                            self.merge_events(buf, events, &mut run, true);
                            events.swap(out_size, multi_begin);
                            out_size += 1;
                            multi_begin = cur + 1;
                        } else {
                            self.handle_unmatched(buf, events, &mut multi_begin, cur, &mut out_size, false);
                            run.clear();
                        }
                        state = SplitState::Unmatch;
                    } else if self.start.is_some() {
                        if self.matches(&self.start, buf, &events[cur]) {
                            run.pop();
                            self.merge_events(buf, events, &mut run, true);
                            run.push(cur);
                            events.swap(out_size, multi_begin);
                            out_size += 1;
                            multi_begin = cur;
                            state = SplitState::Begin;
                        } else {
                            run.pop();
                            self.merge_events(buf, events, &mut run, true);
                            events.swap(out_size, multi_begin);
                            out_size += 1;
                            multi_begin = cur;
                            self.handle_unmatched(buf, events, &mut multi_begin, cur, &mut out_size, false);
                            run.clear();
                            state = SplitState::Unmatch;
                        }
                    } else {
                        // continue-only: close the run at the first miss
                        run.pop();
                        self.merge_events(buf, events, &mut run, true);
                        events.swap(out_size, multi_begin);
                        out_size += 1;
                        multi_begin = cur;
                        self.handle_unmatched(buf, events, &mut multi_begin, cur, &mut out_size, false);
                        run.clear();
                        state = SplitState::Unmatch;
                    }
                }
            }
        }

        if multi_begin < len {
            if self.start.is_some() && self.end.is_none() {
                // Unmatched lines were handled on sight, the dangling run is
                // a matched record.
                self.merge_events(buf, events, &mut run, true);
                events.swap(out_size, multi_begin);
                out_size += 1;
            } else {
                self.handle_unmatched(buf, events, &mut multi_begin, len - 1, &mut out_size, true);
                run.clear();
            }
        }
        events.truncate(out_size);
    }
}

impl Processor for MultilineMerger {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, config: &Value, ctx: Arc<PipelineContext>) -> Result<(), ConfigError> {
        let opts: Options = parse_options(NAME, config)?;
        self.source_key = opts.source_key.unwrap_or_else(|| "content".to_string());
        self.unmatched = opts.unmatched_content_treatment;
        match opts.merge_type.as_deref() {
            Some("flag") => self.mode = MergeMode::Flag,
            Some("regex") => {
                self.mode = MergeMode::Regex;
                self.start = compile_anchor(&opts.start_pattern)
                    .map_err(|e| ConfigError::bad_regex(NAME, opts.start_pattern.as_deref().unwrap_or(""), e))?;
                self.cont = compile_anchor(&opts.continue_pattern)
                    .map_err(|e| ConfigError::bad_regex(NAME, opts.continue_pattern.as_deref().unwrap_or(""), e))?;
                self.end = compile_anchor(&opts.end_pattern)
                    .map_err(|e| ConfigError::bad_regex(NAME, opts.end_pattern.as_deref().unwrap_or(""), e))?;
                if self.start.is_none() && self.cont.is_none() && self.end.is_none() {
                    return Err(ConfigError::MissingParam {
                        plugin: NAME,
                        param: "StartPattern/ContinuePattern/EndPattern",
                    });
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidParam {
                    plugin: NAME,
                    param: "MergeType",
                    reason: format!("expected \"flag\" or \"regex\", got {other:?}"),
                })
            }
            None => {
                return Err(ConfigError::MissingParam {
                    plugin: NAME,
                    param: "MergeType",
                })
            }
        }
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        if group.events().is_empty() {
            return;
        }
        match self.mode {
            MergeMode::Flag => self.merge_by_flag(group),
            MergeMode::Regex => self.merge_by_regex(group),
        }
    }
}
