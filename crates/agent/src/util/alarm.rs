use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Alarm categories surfaced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmType {
    ParseLogFail,
    ParseTimeFail,
    SplitLogFail,
    RegexMatchFail,
    OutdatedLog,
    ProcessQueueFull,
    SenderQueueBlocked,
    CheckpointIo,
    PluginLoad,
}

impl AlarmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmType::ParseLogFail => "parse_log_fail",
            AlarmType::ParseTimeFail => "parse_time_fail",
            AlarmType::SplitLogFail => "split_log_fail",
            AlarmType::RegexMatchFail => "regex_match_fail",
            AlarmType::OutdatedLog => "outdated_log",
            AlarmType::ProcessQueueFull => "process_queue_full",
            AlarmType::SenderQueueBlocked => "sender_queue_blocked",
            AlarmType::CheckpointIo => "checkpoint_io",
            AlarmType::PluginLoad => "plugin_load",
        }
    }
}

const ALARM_WINDOW: Duration = Duration::from_secs(30);
const ALARMS_PER_WINDOW: u32 = 10;

/// Rate-limited alarm sink.
///
/// Every alarm is counted; at most [`ALARMS_PER_WINDOW`] per type per
/// window reach the log. Carried inside the pipeline context so alarms are
/// scoped per pipeline instead of living in a global.
#[derive(Debug, Default)]
pub struct AlarmSink {
    total: AtomicU64,
    suppressed: AtomicU64,
    windows: Mutex<HashMap<AlarmType, (Instant, u32)>>,
}

impl AlarmSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, kind: AlarmType, message: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if self.allow(kind) {
            tracing::warn!(alarm = kind.as_str(), "{}", message);
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Check the limiter without emitting; callers that build expensive
    /// messages gate on this first.
    pub fn allow(&self, kind: AlarmType) -> bool {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let entry = windows.entry(kind).or_insert((now, 0));
        if now.duration_since(entry.0) > ALARM_WINDOW {
            *entry = (now, 0);
        }
        if entry.1 < ALARMS_PER_WINDOW {
            entry.1 += 1;
            true
        } else {
            false
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_window() {
        let sink = AlarmSink::new();
        let mut allowed = 0;
        for _ in 0..100 {
            if sink.allow(AlarmType::ParseLogFail) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, ALARMS_PER_WINDOW);
        // Another type has its own allowance
        assert!(sink.allow(AlarmType::OutdatedLog));
    }

    #[test]
    fn test_counts() {
        let sink = AlarmSink::new();
        for _ in 0..15 {
            sink.send(AlarmType::SplitLogFail, "discard");
        }
        assert_eq!(sink.total(), 15);
        assert_eq!(sink.suppressed(), 5);
    }
}
