//! Pure computations over foreign attribute values.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::AttributeError;
use crate::value::{Decimal, Number, Value, ValueKind};

/// Relational operator of the `comparer` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Comparison {
    pub const ALL: [Self; 6] = [
        Self::Equal,
        Self::NotEqual,
        Self::GreaterThan,
        Self::GreaterThanOrEqual,
        Self::LessThan,
        Self::LessThanOrEqual,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
        }
    }

    /// Unordered operands (NaN) only satisfy `!=`.
    pub fn compare(self, left: Number, right: Number) -> bool {
        let Some(ord) = left.partial_cmp(&right) else {
            return self == Self::NotEqual;
        };
        match self {
            Self::Equal => ord.is_eq(),
            Self::NotEqual => ord.is_ne(),
            Self::GreaterThan => ord.is_gt(),
            Self::GreaterThanOrEqual => ord.is_ge(),
            Self::LessThan => ord.is_lt(),
            Self::LessThanOrEqual => ord.is_le(),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Comparison {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" | "==" => Ok(Self::Equal),
            "!=" | "<>" => Ok(Self::NotEqual),
            ">" => Ok(Self::GreaterThan),
            ">=" => Ok(Self::GreaterThanOrEqual),
            "<" => Ok(Self::LessThan),
            "<=" => Ok(Self::LessThanOrEqual),
            other => Err(AttributeError::InvalidValue(format!(
                "unknown comparison operator {other:?}"
            ))),
        }
    }
}

/// Decimal places kept by the binary percent before scaling to 100.
pub const PERCENT_SCALE: u32 = 5;

/// `100 * first / second`, with the quotient rounded toward positive
/// infinity at [`PERCENT_SCALE`] places before the conversion to f64.
///
/// Operands outside the exact decimal range are divided in f64 with the same
/// rounding.
pub fn binary_percent(first: Number, second: Number) -> Result<f64, AttributeError> {
    let exact = match (first.to_decimal(), second.to_decimal()) {
        (Some(a), Some(b)) if b.mantissa() == 0 => {
            return Err(AttributeError::InvalidValue(format!(
                "cannot divide {a} by zero"
            )));
        }
        (Some(a), Some(b)) => a
            .div_ceil(b, PERCENT_SCALE)
            .and_then(|q| q.checked_mul(Decimal::new(100, 0)))
            .map(Decimal::to_f64),
        _ => None,
    };
    match exact {
        Some(percent) => Ok(percent),
        None => float_percent(first.to_f64(), second.to_f64()),
    }
}

fn float_percent(first: f64, second: f64) -> Result<f64, AttributeError> {
    let places = 10f64.powi(PERCENT_SCALE as i32);
    let percent = (first / second * places).ceil() / places * 100.0;
    if percent.is_finite() {
        Ok(percent)
    } else {
        Err(AttributeError::InvalidValue(format!(
            "cannot divide {first} by {second}"
        )))
    }
}

/// Computation over one foreign attribute value.
///
/// Enum dispatch keeps the per-read call static.
#[derive(Debug)]
pub enum UnaryStrategy {
    /// Regex test against the stringified value.
    Matcher(Regex),
    /// Comparison against a constant operand.
    Comparison { comparison: Comparison, operand: Number },
    /// `value / operand * 100`.
    Percent { operand: Number },
    /// Field of a composite value at a dotted path.
    Decompose { path: Vec<String>, kind: ValueKind },
    /// Best-effort string form.
    Stringify,
}

impl UnaryStrategy {
    pub fn compute(&self, value: &Value) -> Result<Value, AttributeError> {
        match self {
            Self::Matcher(pattern) => Ok(Value::Bool(pattern.is_match(&value.to_string()))),
            Self::Comparison {
                comparison,
                operand,
            } => Ok(Value::Bool(comparison.compare(value.to_number()?, *operand))),
            Self::Percent { operand } => {
                let divisor = operand.to_f64();
                if divisor == 0.0 {
                    return Err(AttributeError::InvalidValue(
                        "percent of a zero operand".to_string(),
                    ));
                }
                Ok(Value::Float(value.to_f64()? / divisor * 100.0))
            }
            Self::Decompose { path, .. } => {
                let Value::Composite(composite) = value else {
                    return Err(AttributeError::InvalidValue(format!(
                        "{} value cannot be decomposed",
                        value.kind().as_str()
                    )));
                };
                composite.get_path(path).cloned().ok_or_else(|| {
                    AttributeError::InvalidValue(format!("no field at {}", path.join(".")))
                })
            }
            Self::Stringify => Ok(Value::Text(value.to_string())),
        }
    }

    /// Kind of the values `compute` produces.
    pub fn result_kind(&self) -> ValueKind {
        match self {
            Self::Matcher(_) | Self::Comparison { .. } => ValueKind::Bool,
            Self::Percent { .. } => ValueKind::Float,
            Self::Decompose { kind, .. } => *kind,
            Self::Stringify => ValueKind::Text,
        }
    }
}

/// Computation over two foreign attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryStrategy {
    Comparison(Comparison),
    Percent,
}

impl BinaryStrategy {
    pub fn compute(&self, first: &Value, second: &Value) -> Result<Value, AttributeError> {
        let (first, second) = (first.to_number()?, second.to_number()?);
        match self {
            Self::Comparison(comparison) => Ok(Value::Bool(comparison.compare(first, second))),
            Self::Percent => binary_percent(first, second).map(Value::Float),
        }
    }

    pub fn result_kind(&self) -> ValueKind {
        match self {
            Self::Comparison(_) => ValueKind::Bool,
            Self::Percent => ValueKind::Float,
        }
    }
}
