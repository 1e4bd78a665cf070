use serde::{Deserialize, Serialize};

use super::gauge::{GaugeRecorder, GaugeSnapshot, GaugeState, RangeRecorder, RangedSnapshot};
use super::rate::{MetricsInterval, RateRecorder, RateState};
use super::{Metric, MetricKind, MetricSnapshot};
use crate::error::AttributeError;
use crate::notification::{Measurement, MeasurementNotification};
use crate::value::{CompositeValue, Value};

/// Stopwatch duration in whole milliseconds.
fn duration_ms(measurement: &Measurement) -> Option<i64> {
    match measurement {
        Measurement::Stopwatch { duration } => {
            Some(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        }
        _ => None,
    }
}

/// `timer`: statistics over stopwatch durations (ms).
pub struct Timer {
    gauge: GaugeRecorder<i64>,
    rate: RateRecorder,
}

impl Timer {
    pub fn new(now_ms: u64) -> Self {
        Self {
            gauge: GaugeRecorder::new(),
            rate: RateRecorder::new(now_ms),
        }
    }
}

impl Metric for Timer {
    fn kind(&self) -> MetricKind {
        MetricKind::Timer
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        let Some(ms) = duration_ms(&notification.measurement) else {
            return false;
        };
        self.gauge.record(ms);
        self.rate.mark(now_ms);
        true
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(MetricKind::Timer.schema());
        self.gauge.write_view(&mut view);
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        self.gauge.reset();
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot::Timer(GaugeSnapshot {
            gauge: self.gauge.state(),
            rate: self.rate.state(),
        })
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let MetricSnapshot::Timer(s) = snapshot else {
            return None;
        };
        Some(Self {
            gauge: GaugeRecorder::from_state(&s.gauge),
            rate: RateRecorder::from_state(&s.rate),
        })
    }
}

/// `rangedTimer`: timer plus range fractions over durations (ms).
pub struct RangedTimer {
    gauge: GaugeRecorder<i64>,
    range: RangeRecorder<i64>,
    rate: RateRecorder,
}

impl RangedTimer {
    pub fn new(start_ms: i64, end_ms: i64, now_ms: u64) -> Result<Self, AttributeError> {
        Ok(Self {
            gauge: GaugeRecorder::new(),
            range: RangeRecorder::new(start_ms, end_ms)?,
            rate: RateRecorder::new(now_ms),
        })
    }
}

impl Metric for RangedTimer {
    fn kind(&self) -> MetricKind {
        MetricKind::RangedTimer
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        let Some(ms) = duration_ms(&notification.measurement) else {
            return false;
        };
        self.gauge.record(ms);
        self.range.record(ms);
        self.rate.mark(now_ms);
        true
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(MetricKind::RangedTimer.schema());
        self.gauge.write_view(&mut view);
        self.range.write_view(&mut view);
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        self.gauge.reset();
        self.range.reset();
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot::RangedTimer(RangedSnapshot {
            gauge: self.gauge.state(),
            range: self.range.state(),
            rate: self.rate.state(),
        })
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let MetricSnapshot::RangedTimer(s) = snapshot else {
            return None;
        };
        Some(Self {
            gauge: GaugeRecorder::from_state(&s.gauge),
            range: RangeRecorder::from_state(&s.range),
            rate: RateRecorder::from_state(&s.rate),
        })
    }
}

/// Snapshot of an [`Arrivals`] metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalsSnapshot {
    pub channels: u32,
    pub service: GaugeState<i64>,
    pub rate: RateState,
}

/// `arrivals`: request arrivals with their service times, modelled as an
/// M/M/c queue over `channels` servers.
pub struct Arrivals {
    channels: u32,
    service: GaugeRecorder<i64>,
    rate: RateRecorder,
}

impl Arrivals {
    pub fn new(channels: u32, now_ms: u64) -> Result<Self, AttributeError> {
        if channels == 0 {
            return Err(AttributeError::invalid_parameter(
                crate::descriptor::keys::CHANNELS,
                "channels must be positive",
            ));
        }
        Ok(Self {
            channels,
            service: GaugeRecorder::new(),
            rate: RateRecorder::new(now_ms),
        })
    }

    /// Offered load in Erlangs: arrivals per second times mean service time.
    fn offered_load(&self, now_ms: u64) -> f64 {
        let state = self.service.state();
        if state.count == 0 {
            return 0.0;
        }
        let mean_service_secs = state.sum as f64 / state.count as f64 / 1_000.0;
        self.rate.mean_rate(MetricsInterval::Second, now_ms) * mean_service_secs
    }
}

/// Probability that an arrival has to wait in an M/M/c queue.
pub fn erlang_c(channels: u32, load: f64) -> f64 {
    if load <= 0.0 {
        return 0.0;
    }
    let c = f64::from(channels);
    if load >= c {
        return 1.0;
    }
    // term = load^k / k!, accumulated iteratively.
    let mut term = 1.0;
    let mut sum = 0.0;
    for k in 0..channels {
        sum += term;
        term *= load / f64::from(k + 1);
    }
    let top = term * c / (c - load);
    top / (sum + top)
}

impl Metric for Arrivals {
    fn kind(&self) -> MetricKind {
        MetricKind::Arrivals
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        let Some(ms) = duration_ms(&notification.measurement) else {
            return false;
        };
        self.service.record(ms);
        self.rate.mark(now_ms);
        true
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(MetricKind::Arrivals.schema());
        self.service.write_view(&mut view);
        let load = self.offered_load(now_ms);
        view.insert("channels", Value::Int(i64::from(self.channels)));
        view.insert(
            "utilization",
            Value::Float(load / f64::from(self.channels)),
        );
        view.insert(
            "availability",
            Value::Float(1.0 - erlang_c(self.channels, load)),
        );
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        self.service.reset();
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot::Arrivals(ArrivalsSnapshot {
            channels: self.channels,
            service: self.service.state(),
            rate: self.rate.state(),
        })
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let MetricSnapshot::Arrivals(s) = snapshot else {
            return None;
        };
        Some(Self {
            channels: s.channels.max(1),
            service: GaugeRecorder::from_state(&s.service),
            rate: RateRecorder::from_state(&s.rate),
        })
    }
}
