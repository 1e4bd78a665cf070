use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::rate::{clamp_i64, RateRecorder, RateState};
use super::{Metric, MetricKind, MetricSnapshot};
use crate::notification::{InstantValue, Measurement, MeasurementNotification};
use crate::value::{CompositeValue, Value};

const FLAG_UNSET: u8 = 0;
const FLAG_FALSE: u8 = 1;
const FLAG_TRUE: u8 = 2;

/// Snapshot of a [`Flag`] metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub last: Option<bool>,
    pub true_count: u64,
    pub false_count: u64,
    pub rate: RateState,
}

/// `flag`: boolean instants.
pub struct Flag {
    last: AtomicU8,
    true_count: AtomicU64,
    false_count: AtomicU64,
    rate: RateRecorder,
}

impl Flag {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last: AtomicU8::new(FLAG_UNSET),
            true_count: AtomicU64::new(0),
            false_count: AtomicU64::new(0),
            rate: RateRecorder::new(now_ms),
        }
    }

    fn last(&self) -> Option<bool> {
        match self.last.load(Ordering::Relaxed) {
            FLAG_TRUE => Some(true),
            FLAG_FALSE => Some(false),
            _ => None,
        }
    }
}

impl Metric for Flag {
    fn kind(&self) -> MetricKind {
        MetricKind::Flag
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        let Measurement::Instant(InstantValue::Flag(value)) = notification.measurement else {
            return false;
        };
        if value {
            self.last.store(FLAG_TRUE, Ordering::Relaxed);
            self.true_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.last.store(FLAG_FALSE, Ordering::Relaxed);
            self.false_count.fetch_add(1, Ordering::Relaxed);
        }
        self.rate.mark(now_ms);
        true
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let trues = self.true_count.load(Ordering::Relaxed);
        let falses = self.false_count.load(Ordering::Relaxed);
        let total = trues + falses;
        let mut view = CompositeValue::new(MetricKind::Flag.schema());
        if let Some(last) = self.last() {
            view.insert("lastValue", Value::Bool(last));
        }
        view.insert("trueCount", Value::Int(clamp_i64(trues)));
        view.insert("falseCount", Value::Int(clamp_i64(falses)));
        let ratio = if total == 0 {
            0.0
        } else {
            trues as f64 / total as f64
        };
        view.insert("ratio", Value::Float(ratio));
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        self.last.store(FLAG_UNSET, Ordering::Relaxed);
        self.true_count.store(0, Ordering::Relaxed);
        self.false_count.store(0, Ordering::Relaxed);
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot::Flag(FlagSnapshot {
            last: self.last(),
            true_count: self.true_count.load(Ordering::Relaxed),
            false_count: self.false_count.load(Ordering::Relaxed),
            rate: self.rate.state(),
        })
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let MetricSnapshot::Flag(s) = snapshot else {
            return None;
        };
        let last = match s.last {
            Some(true) => FLAG_TRUE,
            Some(false) => FLAG_FALSE,
            None => FLAG_UNSET,
        };
        Some(Self {
            last: AtomicU8::new(last),
            true_count: AtomicU64::new(s.true_count),
            false_count: AtomicU64::new(s.false_count),
            rate: RateRecorder::from_state(&s.rate),
        })
    }
}

/// Snapshot of a [`StringGauge`] metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringGaugeSnapshot {
    pub last: Option<String>,
    pub count: u64,
    pub rate: RateState,
}

/// `stringGauge`: the last text instant.
pub struct StringGauge {
    last: Mutex<Option<String>>,
    count: AtomicU64,
    rate: RateRecorder,
}

impl StringGauge {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last: Mutex::new(None),
            count: AtomicU64::new(0),
            rate: RateRecorder::new(now_ms),
        }
    }
}

impl Metric for StringGauge {
    fn kind(&self) -> MetricKind {
        MetricKind::StringGauge
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        let Measurement::Instant(InstantValue::Text(text)) = &notification.measurement else {
            return false;
        };
        *self.last.lock() = Some(text.clone());
        self.count.fetch_add(1, Ordering::Relaxed);
        self.rate.mark(now_ms);
        true
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(MetricKind::StringGauge.schema());
        if let Some(last) = self.last.lock().clone() {
            view.insert("lastValue", Value::Text(last));
        }
        view.insert(
            "count",
            Value::Int(clamp_i64(self.count.load(Ordering::Relaxed))),
        );
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        *self.last.lock() = None;
        self.count.store(0, Ordering::Relaxed);
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot::StringGauge(StringGaugeSnapshot {
            last: self.last.lock().clone(),
            count: self.count.load(Ordering::Relaxed),
            rate: self.rate.state(),
        })
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let MetricSnapshot::StringGauge(s) = snapshot else {
            return None;
        };
        Some(Self {
            last: Mutex::new(s.last.clone()),
            count: AtomicU64::new(s.count),
            rate: RateRecorder::from_state(&s.rate),
        })
    }
}

/// `rate`: counts every measurement.
pub struct Rate {
    rate: RateRecorder,
}

impl Rate {
    pub fn new(now_ms: u64) -> Self {
        Self {
            rate: RateRecorder::new(now_ms),
        }
    }
}

impl Metric for Rate {
    fn kind(&self) -> MetricKind {
        MetricKind::Rate
    }

    fn update(&self, _notification: &MeasurementNotification, now_ms: u64) -> bool {
        self.rate.mark(now_ms);
        true
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(MetricKind::Rate.schema());
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot::Rate(self.rate.state())
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let MetricSnapshot::Rate(s) = snapshot else {
            return None;
        };
        Some(Self {
            rate: RateRecorder::from_state(s),
        })
    }
}

/// `notificationRate`: counts instant notifications only.
pub struct NotificationRate {
    rate: RateRecorder,
}

impl NotificationRate {
    pub fn new(now_ms: u64) -> Self {
        Self {
            rate: RateRecorder::new(now_ms),
        }
    }
}

impl Metric for NotificationRate {
    fn kind(&self) -> MetricKind {
        MetricKind::NotificationRate
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        if !matches!(notification.measurement, Measurement::Instant(_)) {
            return false;
        }
        self.rate.mark(now_ms);
        true
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(MetricKind::NotificationRate.schema());
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot::NotificationRate(self.rate.state())
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let MetricSnapshot::NotificationRate(s) = snapshot else {
            return None;
        };
        Some(Self {
            rate: RateRecorder::from_state(s),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notification::{SourceIdentity, ValueChange};

    fn instant(value: InstantValue) -> MeasurementNotification {
        MeasurementNotification::new(SourceIdentity::default(), Measurement::Instant(value))
    }

    #[test]
    fn test_flag_counts_and_ratio() {
        let flag = Flag::new(0);
        assert!(flag.update(&instant(InstantValue::Flag(true)), 1));
        assert!(flag.update(&instant(InstantValue::Flag(true)), 2));
        assert!(flag.update(&instant(InstantValue::Flag(false)), 3));
        assert!(!flag.update(&instant(InstantValue::Text("x".to_string())), 4));

        let view = flag.view_at(5);
        assert_eq!(view.get("lastValue"), Some(&Value::Bool(false)));
        assert_eq!(view.get("trueCount"), Some(&Value::Int(2)));
        assert_eq!(view.get("falseCount"), Some(&Value::Int(1)));
        assert_eq!(view.get("ratio"), Some(&Value::Float(2.0 / 3.0)));
    }

    #[test]
    fn test_flag_reset_clears_last() {
        let flag = Flag::new(0);
        flag.update(&instant(InstantValue::Flag(true)), 1);
        flag.reset(2);
        assert_eq!(flag.view_at(3).get("lastValue"), None);
        assert_eq!(flag.view_at(3).get("trueCount"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_string_gauge() {
        let gauge = StringGauge::new(0);
        gauge.update(&instant(InstantValue::Text("starting".to_string())), 1);
        gauge.update(&instant(InstantValue::Text("running".to_string())), 2);
        let view = gauge.view_at(3);
        assert_eq!(view.get("lastValue"), Some(&Value::Text("running".to_string())));
        assert_eq!(view.get("count"), Some(&Value::Int(2)));

        let restored = StringGauge::restore(&gauge.snapshot()).expect("same type");
        assert_eq!(restored.view_at(3), view);
    }

    #[test]
    fn test_rate_counts_everything() {
        let rate = Rate::new(0);
        rate.update(&instant(InstantValue::Flag(true)), 1);
        rate.update(
            &MeasurementNotification::new(
                SourceIdentity::default(),
                Measurement::Stopwatch {
                    duration: Duration::from_millis(1),
                },
            ),
            2,
        );
        assert_eq!(rate.view_at(3).get("totalRate"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_notification_rate_counts_instants_only() {
        let rate = NotificationRate::new(0);
        assert!(rate.update(&instant(InstantValue::Text("up".to_string())), 1));
        assert!(!rate.update(
            &MeasurementNotification::new(
                SourceIdentity::default(),
                Measurement::ValueChanged(ValueChange::Integer(1)),
            ),
            2,
        ));
        assert_eq!(rate.view_at(3).get("totalRate"), Some(&Value::Int(1)));
        assert!(Rate::restore(&rate.snapshot()).is_none());
    }
}
