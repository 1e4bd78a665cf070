//! Measurement notifications and the path that carries them from a raw
//! transport message to attributes and listeners.

pub mod dispatcher;
pub mod listener;
pub mod parse;
pub mod stats;

use std::fmt;
use std::time::Duration;

use crate::value::{Decimal, Number, Value};

/// Identity of the component that produced a measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SourceIdentity {
    pub component_name: String,
    pub component_instance: String,
}

impl SourceIdentity {
    pub fn new(component_name: impl Into<String>, component_instance: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            component_instance: component_instance.into(),
        }
    }
}

/// Payload of a `ValueChanged` measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueChange {
    Integer(i64),
    FloatingPoint(f64),
    Numeric(Decimal),
}

impl ValueChange {
    pub fn to_f64(&self) -> f64 {
        match self {
            Self::Integer(v) => *v as f64,
            Self::FloatingPoint(v) => *v,
            Self::Numeric(d) => d.to_f64(),
        }
    }

    /// Integral form, if the change carries one.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::FloatingPoint(_) => None,
            Self::Numeric(d) => Number::Decimal(*d).to_i64(),
        }
    }
}

/// Payload of an `Instant` measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum InstantValue {
    Flag(bool),
    Text(String),
}

/// One observed sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    ValueChanged(ValueChange),
    Stopwatch { duration: Duration },
    Instant(InstantValue),
}

impl Measurement {
    pub fn kind(&self) -> MeasurementKind {
        match self {
            Self::ValueChanged(_) => MeasurementKind::ValueChanged,
            Self::Stopwatch { .. } => MeasurementKind::Stopwatch,
            Self::Instant(InstantValue::Flag(_)) => MeasurementKind::Flag,
            Self::Instant(InstantValue::Text(_)) => MeasurementKind::Text,
        }
    }

    /// Maps an attribute value onto the measurement that best describes it.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Bool(v) => Self::Instant(InstantValue::Flag(*v)),
            Value::Int(v) => Self::ValueChanged(ValueChange::Integer(*v)),
            Value::BigInt(v) => match i64::try_from(*v) {
                Ok(v) => Self::ValueChanged(ValueChange::Integer(v)),
                Err(_) => Self::ValueChanged(ValueChange::Numeric(Decimal::new(*v, 0))),
            },
            Value::Float(v) => Self::ValueChanged(ValueChange::FloatingPoint(*v)),
            Value::Decimal(d) => Self::ValueChanged(ValueChange::Numeric(*d)),
            Value::Text(_) | Value::Composite(_) => {
                Self::Instant(InstantValue::Text(value.to_string()))
            }
        }
    }
}

/// Discriminant of a [`Measurement`], used for per-kind counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MeasurementKind {
    ValueChanged = 0,
    Stopwatch = 1,
    Flag = 2,
    Text = 3,
}

/// Maximum MeasurementKind value, used for array sizing.
pub const MAX_MEASUREMENT_KIND: usize = 3;

impl MeasurementKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValueChanged => "value_changed",
            Self::Stopwatch => "stopwatch",
            Self::Flag => "flag",
            Self::Text => "text",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ValueChanged),
            1 => Some(Self::Stopwatch),
            2 => Some(Self::Flag),
            3 => Some(Self::Text),
            _ => None,
        }
    }

    pub const fn all() -> [Self; MAX_MEASUREMENT_KIND + 1] {
        [Self::ValueChanged, Self::Stopwatch, Self::Flag, Self::Text]
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed measurement event, stamped with a cluster-wide sequence number
/// once it has been accepted by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementNotification {
    pub source: SourceIdentity,
    pub sequence: u64,
    /// Epoch milliseconds at which the sample was observed.
    pub timestamp_ms: u64,
    pub message: String,
    pub measurement: Measurement,
}

impl MeasurementNotification {
    /// Builds an unstamped notification.
    pub fn new(source: SourceIdentity, measurement: Measurement) -> Self {
        Self {
            source,
            sequence: 0,
            timestamp_ms: crate::metrics::now_millis(),
            message: String::new(),
            measurement,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn kind(&self) -> MeasurementKind {
        self.measurement.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in MeasurementKind::all() {
            assert_eq!(MeasurementKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(MeasurementKind::from_u8(4), None);
    }

    #[test]
    fn test_measurement_from_value() {
        assert_eq!(
            Measurement::from_value(&Value::Int(3)),
            Measurement::ValueChanged(ValueChange::Integer(3))
        );
        assert_eq!(
            Measurement::from_value(&Value::Bool(false)),
            Measurement::Instant(InstantValue::Flag(false))
        );
        assert_eq!(
            Measurement::from_value(&Value::Text("up".to_string())),
            Measurement::Instant(InstantValue::Text("up".to_string()))
        );
    }

    #[test]
    fn test_value_change_integral_numeric() {
        assert_eq!(ValueChange::Numeric(Decimal::new(1200, 2)).to_i64(), Some(12));
        assert_eq!(ValueChange::Numeric(Decimal::new(1201, 2)).to_i64(), None);
        assert_eq!(ValueChange::FloatingPoint(1.0).to_i64(), None);
    }
}
