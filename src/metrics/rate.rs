use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::value::{CompositeValue, Value};

/// Reporting intervals every rate is tracked over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetricsInterval {
    Second = 0,
    Minute = 1,
    Hour = 2,
    Day = 3,
}

pub const INTERVAL_COUNT: usize = 4;

impl MetricsInterval {
    pub const ALL: [Self; INTERVAL_COUNT] = [Self::Second, Self::Minute, Self::Hour, Self::Day];

    pub const fn millis(self) -> u64 {
        match self {
            Self::Second => 1_000,
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        }
    }

    /// Suffix used in view field names (`lastRatePerSecond`, ...).
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Second => "Second",
            Self::Minute => "Minute",
            Self::Hour => "Hour",
            Self::Day => "Day",
        }
    }
}

/// Event counts for one reporting interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    /// Start of the current interval, epoch ms, aligned to the creation time.
    pub start_ms: u64,
    /// Events counted in the current, still open interval.
    pub current: u64,
    /// Events counted in the last complete interval.
    pub last: u64,
    /// Largest count seen in any complete interval.
    pub max: u64,
}

impl RateWindow {
    fn new(start_ms: u64) -> Self {
        Self {
            start_ms,
            ..Self::default()
        }
    }

    /// Returns the window as it looks at `now_ms`, closing every interval that
    /// has elapsed since `start_ms`.
    pub fn rolled(self, now_ms: u64, len_ms: u64) -> Self {
        if now_ms < self.start_ms.saturating_add(len_ms) {
            return self;
        }
        let elapsed = now_ms - self.start_ms;
        let closed = elapsed / len_ms;
        // Only the interval right after `current` can carry its count; any
        // further elapsed interval saw no events.
        let last = if closed == 1 { self.current } else { 0 };
        Self {
            start_ms: self.start_ms + closed * len_ms,
            current: 0,
            last,
            max: self.max.max(self.current),
        }
    }
}

/// Serializable state of a [`RateRecorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateState {
    pub total: u64,
    pub created_ms: u64,
    pub windows: [RateWindow; INTERVAL_COUNT],
}

/// Counts events and derives last/max/mean rates per reporting interval.
///
/// Safe for concurrent use; the total is lock-free, the per-interval windows
/// share one short mutex.
pub struct RateRecorder {
    total: AtomicU64,
    created_ms: AtomicU64,
    windows: Mutex<[RateWindow; INTERVAL_COUNT]>,
}

impl RateRecorder {
    pub fn new(now_ms: u64) -> Self {
        Self {
            total: AtomicU64::new(0),
            created_ms: AtomicU64::new(now_ms),
            windows: Mutex::new([RateWindow::new(now_ms); INTERVAL_COUNT]),
        }
    }

    pub fn from_state(state: &RateState) -> Self {
        Self {
            total: AtomicU64::new(state.total),
            created_ms: AtomicU64::new(state.created_ms),
            windows: Mutex::new(state.windows),
        }
    }

    /// Records one event.
    pub fn mark(&self, now_ms: u64) {
        self.mark_n(1, now_ms);
    }

    pub fn mark_n(&self, n: u64, now_ms: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        let mut windows = self.windows.lock();
        for (window, interval) in windows.iter_mut().zip(MetricsInterval::ALL) {
            let mut rolled = window.rolled(now_ms, interval.millis());
            rolled.current += n;
            *window = rolled;
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn last_rate(&self, interval: MetricsInterval, now_ms: u64) -> u64 {
        self.window_at(interval, now_ms).last
    }

    /// Largest count over complete intervals and the open one.
    pub fn max_rate(&self, interval: MetricsInterval, now_ms: u64) -> u64 {
        let window = self.window_at(interval, now_ms);
        window.max.max(window.current)
    }

    /// Average events per interval since creation (or the last reset).
    pub fn mean_rate(&self, interval: MetricsInterval, now_ms: u64) -> f64 {
        let created = self.created_ms.load(Ordering::Relaxed);
        let intervals = (now_ms.saturating_sub(created) / interval.millis()).max(1);
        self.total() as f64 / intervals as f64
    }

    fn window_at(&self, interval: MetricsInterval, now_ms: u64) -> RateWindow {
        let windows = self.windows.lock();
        windows[interval as usize].rolled(now_ms, interval.millis())
    }

    pub fn reset(&self, now_ms: u64) {
        let mut windows = self.windows.lock();
        self.total.store(0, Ordering::Relaxed);
        self.created_ms.store(now_ms, Ordering::Relaxed);
        *windows = [RateWindow::new(now_ms); INTERVAL_COUNT];
    }

    pub fn state(&self) -> RateState {
        let windows = self.windows.lock();
        RateState {
            total: self.total.load(Ordering::Relaxed),
            created_ms: self.created_ms.load(Ordering::Relaxed),
            windows: *windows,
        }
    }

    /// Writes the rate fields into a metric view.
    pub fn write_view(&self, view: &mut CompositeValue, now_ms: u64) {
        view.insert(RATE_TOTAL_FIELD, Value::Int(clamp_i64(self.total())));
        for interval in MetricsInterval::ALL {
            let suffix = interval.suffix();
            view.insert(
                &format!("lastRatePer{suffix}"),
                Value::Int(clamp_i64(self.last_rate(interval, now_ms))),
            );
            view.insert(
                &format!("maxRatePer{suffix}"),
                Value::Int(clamp_i64(self.max_rate(interval, now_ms))),
            );
            view.insert(
                &format!("meanRatePer{suffix}"),
                Value::Float(self.mean_rate(interval, now_ms)),
            );
        }
    }
}

pub const RATE_TOTAL_FIELD: &str = "totalRate";

pub(crate) fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_rolls_into_last() {
        let w = RateWindow {
            start_ms: 0,
            current: 7,
            last: 0,
            max: 3,
        };
        let rolled = w.rolled(1_500, 1_000);
        assert_eq!(rolled.start_ms, 1_000);
        assert_eq!(rolled.current, 0);
        assert_eq!(rolled.last, 7);
        assert_eq!(rolled.max, 7);
    }

    #[test]
    fn test_window_skipped_intervals_are_empty() {
        let w = RateWindow {
            start_ms: 0,
            current: 7,
            last: 2,
            max: 7,
        };
        let rolled = w.rolled(3_200, 1_000);
        assert_eq!(rolled.start_ms, 3_000);
        assert_eq!(rolled.last, 0);
        assert_eq!(rolled.max, 7);
    }

    #[test]
    fn test_recorder_rates() {
        let rec = RateRecorder::new(0);
        rec.mark(100);
        rec.mark(200);
        rec.mark(900);
        rec.mark(1_100);

        assert_eq!(rec.total(), 4);
        assert_eq!(rec.last_rate(MetricsInterval::Second, 1_200), 3);
        assert_eq!(rec.max_rate(MetricsInterval::Second, 1_200), 3);
        assert_eq!(rec.max_rate(MetricsInterval::Minute, 1_200), 4);
        assert_eq!(rec.mean_rate(MetricsInterval::Second, 2_000), 2.0);
    }

    #[test]
    fn test_recorder_reset() {
        let rec = RateRecorder::new(0);
        rec.mark_n(5, 10);
        rec.reset(50);
        assert_eq!(rec.total(), 0);
        assert_eq!(rec.max_rate(MetricsInterval::Second, 60), 0);
        assert_eq!(rec.state().created_ms, 50);
    }

    #[test]
    fn test_state_roundtrip() {
        let rec = RateRecorder::new(0);
        rec.mark_n(3, 400);
        let restored = RateRecorder::from_state(&rec.state());
        assert_eq!(restored.state(), rec.state());
    }
}
