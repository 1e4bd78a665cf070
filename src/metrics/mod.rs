//! Thread-safe metric recorders fed by measurement notifications.
//!
//! Every recorder mutates only its own atomics (or a short internal mutex)
//! through `&self`, so many notifications can be applied concurrently while
//! the owning holder keeps its metric reference under a shared lock.

pub mod gauge;
pub mod instant;
pub mod rate;
pub mod timer;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::AttributeError;
use crate::notification::MeasurementNotification;
use crate::value::{CompositeSchema, CompositeValue, ValueKind};

pub use self::gauge::{Gauge, GaugeSnapshot, RangedGauge, RangedSnapshot};
pub use self::instant::{Flag, FlagSnapshot, NotificationRate, Rate, StringGauge, StringGaugeSnapshot};
pub use self::rate::{MetricsInterval, RateRecorder, RateState};
pub use self::timer::{Arrivals, ArrivalsSnapshot, RangedTimer, Timer};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Metric types addressable from the attribute DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetricKind {
    Gauge64 = 0,
    GaugeFP = 1,
    Timer = 2,
    Rate = 3,
    Flag = 4,
    StringGauge = 5,
    RangedGauge64 = 6,
    RangedGaugeFP = 7,
    RangedTimer = 8,
    Arrivals = 9,
    NotificationRate = 10,
}

pub const METRIC_KIND_COUNT: usize = 11;

impl MetricKind {
    pub const ALL: [Self; METRIC_KIND_COUNT] = [
        Self::Gauge64,
        Self::GaugeFP,
        Self::Timer,
        Self::Rate,
        Self::Flag,
        Self::StringGauge,
        Self::RangedGauge64,
        Self::RangedGaugeFP,
        Self::RangedTimer,
        Self::Arrivals,
        Self::NotificationRate,
    ];

    /// DSL name of the metric type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gauge64 => "gauge64",
            Self::GaugeFP => "gaugeFP",
            Self::Timer => "timer",
            Self::Rate => "rate",
            Self::Flag => "flag",
            Self::StringGauge => "stringGauge",
            Self::RangedGauge64 => "rangedGauge64",
            Self::RangedGaugeFP => "rangedGaugeFP",
            Self::RangedTimer => "rangedTimer",
            Self::Arrivals => "arrivals",
            Self::NotificationRate => "notificationRate",
        }
    }

    /// Schema of the composite view this metric type produces.
    pub fn schema(self) -> Arc<CompositeSchema> {
        static SCHEMAS: OnceLock<Vec<Arc<CompositeSchema>>> = OnceLock::new();
        let schemas =
            SCHEMAS.get_or_init(|| Self::ALL.iter().map(|k| Arc::new(k.build_schema())).collect());
        Arc::clone(&schemas[self as usize])
    }

    /// True if `field` is a valid extractor for this metric type.
    pub fn has_field(self, field: &str) -> bool {
        self.schema().get(field).is_some()
    }

    fn build_schema(self) -> CompositeSchema {
        let schema = CompositeSchema::new(self.as_str());
        let schema = match self {
            Self::Gauge64 => gauge_fields(schema, ValueKind::Int),
            Self::GaugeFP => gauge_fields(schema, ValueKind::Float),
            Self::Timer => gauge_fields(schema, ValueKind::Int),
            Self::Rate | Self::NotificationRate => schema,
            Self::Flag => schema
                .field("lastValue", ValueKind::Bool)
                .field("trueCount", ValueKind::Int)
                .field("falseCount", ValueKind::Int)
                .field("ratio", ValueKind::Float),
            Self::StringGauge => schema
                .field("lastValue", ValueKind::Text)
                .field("count", ValueKind::Int),
            Self::RangedGauge64 => range_fields(gauge_fields(schema, ValueKind::Int), ValueKind::Int),
            Self::RangedGaugeFP => {
                range_fields(gauge_fields(schema, ValueKind::Float), ValueKind::Float)
            }
            Self::RangedTimer => range_fields(gauge_fields(schema, ValueKind::Int), ValueKind::Int),
            Self::Arrivals => gauge_fields(schema, ValueKind::Int)
                .field("channels", ValueKind::Int)
                .field("utilization", ValueKind::Float)
                .field("availability", ValueKind::Float),
        };
        rate_fields(schema)
    }
}

fn gauge_fields(schema: CompositeSchema, kind: ValueKind) -> CompositeSchema {
    schema
        .field("lastValue", kind)
        .field("minValue", kind)
        .field("maxValue", kind)
        .field("meanValue", ValueKind::Float)
        .field("count", ValueKind::Int)
}

fn range_fields(schema: CompositeSchema, kind: ValueKind) -> CompositeSchema {
    schema
        .field("rangeStart", kind)
        .field("rangeEnd", kind)
        .field("lessThanRange", ValueKind::Float)
        .field("greaterThanRange", ValueKind::Float)
        .field("isInRange", ValueKind::Float)
}

fn rate_fields(mut schema: CompositeSchema) -> CompositeSchema {
    schema = schema.field(rate::RATE_TOTAL_FIELD, ValueKind::Int);
    for interval in MetricsInterval::ALL {
        let suffix = interval.suffix();
        schema = schema
            .field(format!("lastRatePer{suffix}"), ValueKind::Int)
            .field(format!("maxRatePer{suffix}"), ValueKind::Int)
            .field(format!("meanRatePer{suffix}"), ValueKind::Float);
    }
    schema
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| AttributeError::UnrecognizedAttributeType(s.to_string()))
    }
}

/// Immutable copy of a metric's state, exchanged between cluster nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MetricSnapshot {
    Gauge64(GaugeSnapshot<i64>),
    GaugeFP(GaugeSnapshot<f64>),
    Timer(GaugeSnapshot<i64>),
    Rate(RateState),
    Flag(FlagSnapshot),
    StringGauge(StringGaugeSnapshot),
    RangedGauge64(RangedSnapshot<i64>),
    RangedGaugeFP(RangedSnapshot<f64>),
    RangedTimer(RangedSnapshot<i64>),
    Arrivals(ArrivalsSnapshot),
    NotificationRate(RateState),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge64(_) => MetricKind::Gauge64,
            Self::GaugeFP(_) => MetricKind::GaugeFP,
            Self::Timer(_) => MetricKind::Timer,
            Self::Rate(_) => MetricKind::Rate,
            Self::Flag(_) => MetricKind::Flag,
            Self::StringGauge(_) => MetricKind::StringGauge,
            Self::RangedGauge64(_) => MetricKind::RangedGauge64,
            Self::RangedGaugeFP(_) => MetricKind::RangedGaugeFP,
            Self::RangedTimer(_) => MetricKind::RangedTimer,
            Self::Arrivals(_) => MetricKind::Arrivals,
            Self::NotificationRate(_) => MetricKind::NotificationRate,
        }
    }
}

/// A mutable accumulator owned by exactly one metric holder.
pub trait Metric: Send + Sync + Sized + 'static {
    fn kind(&self) -> MetricKind;

    /// Applies the notification if its measurement is one this metric
    /// understands. Returns whether it was applied.
    fn update(&self, notification: &MeasurementNotification, now_ms: u64) -> bool;

    /// Derived composite view at `now_ms`.
    fn view_at(&self, now_ms: u64) -> CompositeValue;

    fn reset(&self, now_ms: u64);

    fn snapshot(&self) -> MetricSnapshot;

    /// Rebuilds a metric from a snapshot of the same type.
    fn restore(snapshot: &MetricSnapshot) -> Option<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>(), Ok(kind));
        }
        assert_eq!(
            "bogus".parse::<MetricKind>(),
            Err(AttributeError::UnrecognizedAttributeType("bogus".to_string()))
        );
    }

    #[test]
    fn test_schema_fields() {
        assert!(MetricKind::Gauge64.has_field("lastValue"));
        assert!(MetricKind::Gauge64.has_field("meanRatePerHour"));
        assert!(!MetricKind::Gauge64.has_field("isInRange"));
        assert!(MetricKind::RangedTimer.has_field("isInRange"));
        assert!(MetricKind::Arrivals.has_field("availability"));
        assert!(MetricKind::Rate.has_field("totalRate"));
        assert!(!MetricKind::Rate.has_field("lastValue"));
        assert_eq!(
            MetricKind::GaugeFP.schema().get("minValue").map(|f| f.kind),
            Some(ValueKind::Float)
        );
    }

    #[test]
    fn test_snapshot_tag_matches_dsl_name() {
        let snap = MetricSnapshot::Rate(RateRecorder::new(0).state());
        let json = serde_json::to_value(&snap).expect("serializable");
        assert_eq!(json["type"], "rate");
        let back: MetricSnapshot = serde_json::from_value(json).expect("deserializable");
        assert_eq!(back.kind(), MetricKind::Rate);
    }
}
