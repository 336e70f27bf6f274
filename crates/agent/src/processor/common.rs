use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

use crate::model::{keys, LogEvent, SourceBuffer, StrRef};

/// Options shared by the field-extracting parsers (apsara, regex, json,
/// delimiter, timestamp).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CommonParserOptions {
    pub keeping_source_when_parse_fail: bool,
    pub keeping_source_when_parse_succeed: bool,
    pub renamed_source_key: Option<String>,
    pub coping_raw_log: bool,
}

impl CommonParserOptions {
    /// Bookkeeping after a successful parse. `source_overwritten` /
    /// `raw_overwritten` mean a derived field already claimed the source /
    /// raw-log key, in which case the original content wins and no extra
    /// copy is made.
    pub fn on_success(
        &self,
        buf: &mut SourceBuffer,
        event: &mut LogEvent,
        source_key: &[u8],
        raw: StrRef,
        source_overwritten: bool,
        raw_overwritten: bool,
    ) {
        if self.coping_raw_log && !raw_overwritten {
            event.set_content(buf, keys::RAW_LOG, raw);
        }
        if source_overwritten {
            return;
        }
        if self.keeping_source_when_parse_succeed {
            if let Some(renamed) = &self.renamed_source_key {
                if renamed.as_bytes() != source_key {
                    let renamed_key = buf.alloc(renamed.as_bytes());
                    event.del_content(buf, source_key);
                    event.set_content(buf, renamed_key, raw);
                }
            }
        } else {
            event.del_content(buf, source_key);
        }
    }

    /// Bookkeeping after a failed parse. Returns whether the event is kept.
    pub fn on_fail(&self, buf: &mut SourceBuffer, event: &mut LogEvent, source_key: &[u8], raw: StrRef) -> bool {
        if !self.keeping_source_when_parse_fail {
            return false;
        }
        event.del_content(buf, source_key);
        event.set_content(buf, keys::UNMATCHED_RAW_LOG, raw);
        if self.coping_raw_log {
            event.set_content(buf, keys::RAW_LOG, raw);
        }
        true
    }
}

/// Per-instance parse counters. Incremented by the owning processor;
/// read by the pipeline's metric dump.
#[derive(Debug, Default)]
pub struct ParseCounters {
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
    pub parse_errors: AtomicU64,
    pub discarded: AtomicU64,
    pub history_failures: AtomicU64,
}

impl ParseCounters {
    #[inline]
    pub fn add_in_bytes(&self, n: usize) {
        self.in_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_out_bytes(&self, n: usize) {
        self.out_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_history_failure(&self) {
        self.history_failures.fetch_add(1, Ordering::Relaxed);
    }
}
