//! Throttled progress reporting shared by hashing and transfer

use std::time::{Duration, Instant};

/// Minimum spacing between progress reports
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Rate limiter for progress events.
///
/// Emits at most one report per interval, plus the final report. Speed is the
/// byte delta since the previous report over the elapsed wall time.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_report: Instant,
    last_bytes: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        ProgressThrottle {
            interval,
            last_report: Instant::now(),
            last_bytes: 0,
        }
    }

    /// Start counting from bytes that were already done before the first report
    pub fn with_baseline(mut self, bytes: u64) -> Self {
        self.last_bytes = bytes;
        self
    }

    /// Returns the speed in bytes/sec when a report is due.
    pub fn poll(&mut self, processed: u64, finished: bool) -> Option<f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_report);
        if !finished && elapsed < self.interval {
            return None;
        }

        let delta = processed.saturating_sub(self.last_bytes);
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { delta as f64 / secs } else { 0.0 };

        self.last_report = now;
        self.last_bytes = processed;
        Some(speed)
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_INTERVAL)
    }
}

/// Whole percent of `processed` over `total`, floored and capped at 100
pub fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (processed.min(total) as u128 * 100) / total as u128;
    pct as u8
}
