use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::rate::{clamp_i64, RateRecorder, RateState};
use super::{Metric, MetricKind, MetricSnapshot};
use crate::error::AttributeError;
use crate::notification::{Measurement, MeasurementNotification};
use crate::value::{CompositeValue, Value};

/// Sample type a gauge can record. Values live in `AtomicU64` cells as bits.
pub trait GaugeValue:
    Copy + PartialOrd + Send + Sync + Serialize + DeserializeOwned + std::str::FromStr + 'static
{
    const ZERO: Self;
    const MIN: Self;
    const MAX: Self;

    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
    fn to_f64(self) -> f64;
    fn add(self, other: Self) -> Self;
    fn into_value(self) -> Value;
}

impl GaugeValue for i64 {
    const ZERO: Self = 0;
    const MIN: Self = i64::MIN;
    const MAX: Self = i64::MAX;

    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits as i64
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn add(self, other: Self) -> Self {
        self.saturating_add(other)
    }

    fn into_value(self) -> Value {
        Value::Int(self)
    }
}

impl GaugeValue for f64 {
    const ZERO: Self = 0.0;
    const MIN: Self = f64::NEG_INFINITY;
    const MAX: Self = f64::INFINITY;

    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn add(self, other: Self) -> Self {
        self + other
    }

    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

/// Point-in-time gauge statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaugeState<T> {
    pub last: T,
    pub min: T,
    pub max: T,
    pub sum: T,
    pub count: u64,
}

/// Tracks last/min/max/sum/count of a sample stream.
/// All operations are atomic and safe for concurrent use.
pub struct GaugeRecorder<T: GaugeValue> {
    last: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
    _marker: std::marker::PhantomData<T>,
}

impl<T: GaugeValue> GaugeRecorder<T> {
    /// Creates a recorder with min initialized to MAX and max to MIN.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(T::ZERO.to_bits()),
            min: AtomicU64::new(T::MAX.to_bits()),
            max: AtomicU64::new(T::MIN.to_bits()),
            sum: AtomicU64::new(T::ZERO.to_bits()),
            count: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn from_state(state: &GaugeState<T>) -> Self {
        Self {
            last: AtomicU64::new(state.last.to_bits()),
            min: AtomicU64::new(state.min.to_bits()),
            max: AtomicU64::new(state.max.to_bits()),
            sum: AtomicU64::new(state.sum.to_bits()),
            count: AtomicU64::new(state.count),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn record(&self, value: T) {
        self.last.store(value.to_bits(), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        update_bits::<T>(&self.sum, |old| Some(old.add(value)));
        update_bits::<T>(&self.min, |old| (value < old).then_some(value));
        update_bits::<T>(&self.max, |old| (value > old).then_some(value));
    }

    pub fn reset(&self) {
        self.last.store(T::ZERO.to_bits(), Ordering::Relaxed);
        self.min.store(T::MAX.to_bits(), Ordering::Relaxed);
        self.max.store(T::MIN.to_bits(), Ordering::Relaxed);
        self.sum.store(T::ZERO.to_bits(), Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn state(&self) -> GaugeState<T> {
        GaugeState {
            last: T::from_bits(self.last.load(Ordering::Relaxed)),
            min: T::from_bits(self.min.load(Ordering::Relaxed)),
            max: T::from_bits(self.max.load(Ordering::Relaxed)),
            sum: T::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }

    pub fn write_view(&self, view: &mut CompositeValue) {
        let state = self.state();
        // Handle case where no values were recorded.
        let (min, max) = if state.count == 0 {
            (T::ZERO, T::ZERO)
        } else {
            (state.min, state.max)
        };
        let mean = if state.count == 0 {
            0.0
        } else {
            state.sum.to_f64() / state.count as f64
        };
        view.insert("lastValue", state.last.into_value());
        view.insert("minValue", min.into_value());
        view.insert("maxValue", max.into_value());
        view.insert("meanValue", Value::Float(mean));
        view.insert("count", Value::Int(clamp_i64(state.count)));
    }
}

impl<T: GaugeValue> Default for GaugeRecorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// CAS loop applying `f` until it either declines (`None`) or wins the swap.
fn update_bits<T: GaugeValue>(cell: &AtomicU64, f: impl Fn(T) -> Option<T>) {
    loop {
        let old_bits = cell.load(Ordering::Relaxed);
        let Some(new) = f(T::from_bits(old_bits)) else {
            break;
        };
        if cell
            .compare_exchange_weak(old_bits, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Counts samples below, above and within a closed range.
pub struct RangeRecorder<T: GaugeValue> {
    start: T,
    end: T,
    less: AtomicU64,
    greater: AtomicU64,
    within: AtomicU64,
}

/// Serializable state of a [`RangeRecorder`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeState<T> {
    pub start: T,
    pub end: T,
    pub less: u64,
    pub greater: u64,
    pub within: u64,
}

impl<T: GaugeValue> RangeRecorder<T> {
    pub fn new(start: T, end: T) -> Result<Self, AttributeError> {
        if start > end {
            return Err(AttributeError::invalid_parameter(
                crate::descriptor::keys::RANGE_START,
                "rangeStart must not exceed rangeEnd",
            ));
        }
        Ok(Self {
            start,
            end,
            less: AtomicU64::new(0),
            greater: AtomicU64::new(0),
            within: AtomicU64::new(0),
        })
    }

    pub fn from_state(state: &RangeState<T>) -> Self {
        Self {
            start: state.start,
            end: state.end,
            less: AtomicU64::new(state.less),
            greater: AtomicU64::new(state.greater),
            within: AtomicU64::new(state.within),
        }
    }

    pub fn record(&self, value: T) {
        let cell = if value < self.start {
            &self.less
        } else if value > self.end {
            &self.greater
        } else {
            &self.within
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.less.store(0, Ordering::Relaxed);
        self.greater.store(0, Ordering::Relaxed);
        self.within.store(0, Ordering::Relaxed);
    }

    pub fn state(&self) -> RangeState<T> {
        RangeState {
            start: self.start,
            end: self.end,
            less: self.less.load(Ordering::Relaxed),
            greater: self.greater.load(Ordering::Relaxed),
            within: self.within.load(Ordering::Relaxed),
        }
    }

    pub fn write_view(&self, view: &mut CompositeValue) {
        let state = self.state();
        let total = state.less + state.greater + state.within;
        let fraction = |n: u64| {
            if total == 0 {
                0.0
            } else {
                n as f64 / total as f64
            }
        };
        view.insert("rangeStart", state.start.into_value());
        view.insert("rangeEnd", state.end.into_value());
        view.insert("lessThanRange", Value::Float(fraction(state.less)));
        view.insert("greaterThanRange", Value::Float(fraction(state.greater)));
        view.insert("isInRange", Value::Float(fraction(state.within)));
    }
}

/// Gauge sample type bound to its DSL metric kinds.
pub trait GaugeKind: GaugeValue {
    const GAUGE: MetricKind;
    const RANGED: MetricKind;

    /// Extracts a sample from a `ValueChanged` measurement.
    fn sample(measurement: &Measurement) -> Option<Self>;
    fn wrap(snapshot: GaugeSnapshot<Self>) -> MetricSnapshot;
    fn unwrap(snapshot: &MetricSnapshot) -> Option<&GaugeSnapshot<Self>>;
    fn wrap_ranged(snapshot: RangedSnapshot<Self>) -> MetricSnapshot;
    fn unwrap_ranged(snapshot: &MetricSnapshot) -> Option<&RangedSnapshot<Self>>;
}

impl GaugeKind for i64 {
    const GAUGE: MetricKind = MetricKind::Gauge64;
    const RANGED: MetricKind = MetricKind::RangedGauge64;

    fn sample(measurement: &Measurement) -> Option<Self> {
        match measurement {
            Measurement::ValueChanged(change) => change.to_i64(),
            _ => None,
        }
    }

    fn wrap(snapshot: GaugeSnapshot<Self>) -> MetricSnapshot {
        MetricSnapshot::Gauge64(snapshot)
    }

    fn unwrap(snapshot: &MetricSnapshot) -> Option<&GaugeSnapshot<Self>> {
        match snapshot {
            MetricSnapshot::Gauge64(s) => Some(s),
            _ => None,
        }
    }

    fn wrap_ranged(snapshot: RangedSnapshot<Self>) -> MetricSnapshot {
        MetricSnapshot::RangedGauge64(snapshot)
    }

    fn unwrap_ranged(snapshot: &MetricSnapshot) -> Option<&RangedSnapshot<Self>> {
        match snapshot {
            MetricSnapshot::RangedGauge64(s) => Some(s),
            _ => None,
        }
    }
}

impl GaugeKind for f64 {
    const GAUGE: MetricKind = MetricKind::GaugeFP;
    const RANGED: MetricKind = MetricKind::RangedGaugeFP;

    fn sample(measurement: &Measurement) -> Option<Self> {
        match measurement {
            Measurement::ValueChanged(change) => Some(change.to_f64()),
            _ => None,
        }
    }

    fn wrap(snapshot: GaugeSnapshot<Self>) -> MetricSnapshot {
        MetricSnapshot::GaugeFP(snapshot)
    }

    fn unwrap(snapshot: &MetricSnapshot) -> Option<&GaugeSnapshot<Self>> {
        match snapshot {
            MetricSnapshot::GaugeFP(s) => Some(s),
            _ => None,
        }
    }

    fn wrap_ranged(snapshot: RangedSnapshot<Self>) -> MetricSnapshot {
        MetricSnapshot::RangedGaugeFP(snapshot)
    }

    fn unwrap_ranged(snapshot: &MetricSnapshot) -> Option<&RangedSnapshot<Self>> {
        match snapshot {
            MetricSnapshot::RangedGaugeFP(s) => Some(s),
            _ => None,
        }
    }
}

/// Snapshot of a gauge-shaped metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeSnapshot<T> {
    pub gauge: GaugeState<T>,
    pub rate: RateState,
}

/// Snapshot of a ranged gauge-shaped metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangedSnapshot<T> {
    pub gauge: GaugeState<T>,
    pub range: RangeState<T>,
    pub rate: RateState,
}

/// `gauge64` / `gaugeFP`.
pub struct Gauge<T: GaugeKind> {
    gauge: GaugeRecorder<T>,
    rate: RateRecorder,
}

impl<T: GaugeKind> Gauge<T> {
    pub fn new(now_ms: u64) -> Self {
        Self {
            gauge: GaugeRecorder::new(),
            rate: RateRecorder::new(now_ms),
        }
    }

    /// Records a sample directly.
    pub fn record(&self, value: T, now_ms: u64) {
        self.gauge.record(value);
        self.rate.mark(now_ms);
    }
}

impl<T: GaugeKind> Metric for Gauge<T> {
    fn kind(&self) -> MetricKind {
        T::GAUGE
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        match T::sample(&notification.measurement) {
            Some(value) => {
                self.record(value, now_ms);
                true
            }
            None => false,
        }
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(T::GAUGE.schema());
        self.gauge.write_view(&mut view);
        self.rate.write_view(&mut view, now_ms);
        view
    }

    fn reset(&self, now_ms: u64) {
        self.gauge.reset();
        self.rate.reset(now_ms);
    }

    fn snapshot(&self) -> MetricSnapshot {
        T::wrap(GaugeSnapshot {
            gauge: self.gauge.state(),
            rate: self.rate.state(),
        })
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let s = T::unwrap(snapshot)?;
        Some(Self {
            gauge: GaugeRecorder::from_state(&s.gauge),
            rate: RateRecorder::from_state(&s.rate),
        })
    }
}

/// `rangedGauge64` / `rangedGaugeFP`.
pub struct RangedGauge<T: GaugeKind> {
    gauge: GaugeRecorder<T>,
    range: RangeRecorder<T>,
    rate: RateRecorder,
}

impl<T: GaugeKind> RangedGauge<T> {
    pub fn new(start: T, end: T, now_ms: u64) -> Result<Self, AttributeError> {
        Ok(Self {
            gauge: GaugeRecorder::new(),
            range: RangeRecorder::new(start, end)?,
            rate: RateRecorder::new(now_ms),
        })
    }
}

impl<T: GaugeKind> Metric for RangedGauge<T> {
    fn kind(&self) -> MetricKind {
        T::RANGED
    }

    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool {
        match T::sample(&notification.measurement) {
            Some(value) => {
                self.gauge.record(value);
                self.range.record(value);
                self.rate.mark(now_ms);
                true
            }
            None => false,
        }
    }

    fn view_at(&self, now_ms: u64) -> CompositeValue {
        let mut view = CompositeValue::new(T::RANGED.schema());
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
        T::wrap_ranged(RangedSnapshot {
            gauge: self.gauge.state(),
            range: self.range.state(),
            rate: self.rate.state(),
        })
    }

    fn restore(snapshot: &MetricSnapshot) -> Option<Self> {
        let s = T::unwrap_ranged(snapshot)?;
        Some(Self {
            gauge: GaugeRecorder::from_state(&s.gauge),
            range: RangeRecorder::from_state(&s.range),
            rate: RateRecorder::from_state(&s.rate),
        })
    }
}
