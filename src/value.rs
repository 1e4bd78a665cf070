//! Value model shared by foreign sources, strategies and metric views.
//!
//! Composite values carry an explicit [`CompositeSchema`] built when the
//! attribute is constructed; nothing is discovered by reflection later.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::error::AttributeError;

/// Declared semantic type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueKind {
    Bool,
    Int,
    BigInt,
    Float,
    Decimal,
    Text,
    Composite,
}

impl ValueKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::BigInt => "bigInt",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Composite => "composite",
        }
    }

    /// Every kind except `Composite` is a scalar.
    pub const fn is_scalar(self) -> bool {
        !matches!(self, Self::Composite)
    }
}

/// Exact decimal number: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

/// Largest power of ten representable in an i128.
const MAX_POW10: u32 = 38;

fn pow10(exp: u32) -> Option<i128> {
    if exp > MAX_POW10 {
        return None;
    }
    10i128.checked_pow(exp)
}

fn pow10_u128(exp: u64) -> Option<u128> {
    10u128.checked_pow(u32::try_from(exp).ok()?)
}

impl Decimal {
    pub const fn new(mantissa: i128, scale: u32) -> Self {
        Self { mantissa, scale }
    }

    pub const fn mantissa(self) -> i128 {
        self.mantissa
    }

    pub const fn scale(self) -> u32 {
        self.scale
    }

    /// Exact decimal expansion of the shortest round-trip form of `v`.
    ///
    /// `None` for non-finite values and for magnitudes whose digits do not
    /// fit an i128 mantissa (above roughly 1.7e38).
    pub fn from_f64(v: f64) -> Option<Self> {
        if !v.is_finite() {
            return None;
        }
        format!("{v}").parse().ok()
    }

    /// Correctly rounded conversion to the nearest f64.
    pub fn to_f64(self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    /// Divides and rounds toward positive infinity at `scale` decimal places.
    ///
    /// Digits are produced by long division, so intermediates stay below the
    /// divisor's magnitude. `None` for a zero divisor or a quotient that does
    /// not fit an i128.
    pub fn div_ceil(self, divisor: Self, scale: u32) -> Option<Self> {
        if divisor.mantissa == 0 {
            return None;
        }
        let negative = (self.mantissa < 0) != (divisor.mantissa < 0);
        let num = self.mantissa.unsigned_abs();
        let den = divisor.mantissa.unsigned_abs();

        // self / divisor * 10^scale == num * 10^shift / den
        let shift = i64::from(divisor.scale) + i64::from(scale) - i64::from(self.scale);
        let (mut quotient, mut remainder) = if shift >= 0 {
            (num / den, num % den)
        } else {
            match pow10_u128(shift.unsigned_abs()).and_then(|f| den.checked_mul(f)) {
                Some(scaled) => (num / scaled, num % scaled),
                // The divisor exceeds any i128 dividend.
                None => (0, num),
            }
        };

        let mut digits = u64::try_from(shift).unwrap_or(0);
        while digits > 0 && remainder != 0 {
            let widened = remainder.checked_mul(10)?;
            quotient = quotient.checked_mul(10)?.checked_add(widened / den)?;
            remainder = widened % den;
            digits -= 1;
        }
        if digits > 0 && quotient != 0 {
            quotient = quotient.checked_mul(pow10_u128(digits)?)?;
        }

        let quotient = i128::try_from(quotient).ok()?;
        let ceiled = if negative {
            -quotient
        } else if remainder != 0 {
            quotient.checked_add(1)?
        } else {
            quotient
        };
        Some(Self::new(ceiled, scale))
    }

    pub fn checked_mul(self, other: Self) -> Option<Self> {
        Some(Self::new(
            self.mantissa.checked_mul(other.mantissa)?,
            self.scale.checked_add(other.scale)?,
        ))
    }

    fn rescale(self, scale: u32) -> Option<i128> {
        if scale < self.scale {
            return None;
        }
        self.mantissa.checked_mul(pow10(scale - self.scale)?)
    }

    fn exact_cmp(self, other: Self) -> Option<Ordering> {
        let scale = self.scale.max(other.scale);
        Some(self.rescale(scale)?.cmp(&other.rescale(scale)?))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let sign = if self.mantissa < 0 { "-" } else { "" };
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int}.{frac}")
        } else {
            write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
        }
    }
}

impl FromStr for Decimal {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let nan = || AttributeError::NotANumber(s.to_string());
        let trimmed = s.trim();
        let (body, exponent) = match trimmed.find(['e', 'E']) {
            Some(idx) => {
                let exp: i64 = trimmed[idx + 1..].parse().map_err(|_| nan())?;
                (&trimmed[..idx], exp)
            }
            None => (trimmed, 0),
        };
        let (negative, body) = match body.as_bytes().first() {
            Some(b'-') => (true, &body[1..]),
            Some(b'+') => (false, &body[1..]),
            _ => (false, body),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(nan());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(nan());
        }

        let mut mantissa: i128 = 0;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(b - b'0')))
                .ok_or_else(nan)?;
        }
        if negative {
            mantissa = -mantissa;
        }

        let scale = frac_part.len() as i64 - exponent;
        if scale >= 0 {
            let scale = u32::try_from(scale).map_err(|_| nan())?;
            Ok(Self::new(mantissa, scale))
        } else {
            let shift = u32::try_from(-scale).map_err(|_| nan())?;
            let factor = pow10(shift).ok_or_else(nan)?;
            Ok(Self::new(mantissa.checked_mul(factor).ok_or_else(nan)?, 0))
        }
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Result of numeric coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i128),
    Float(f64),
    Decimal(Decimal),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Integer(v) => v as f64,
            Self::Float(v) => v,
            Self::Decimal(d) => d.to_f64(),
        }
    }

    /// Exact decimal form, if one exists.
    pub fn to_decimal(self) -> Option<Decimal> {
        match self {
            Self::Integer(v) => Some(Decimal::new(v, 0)),
            Self::Float(v) => Decimal::from_f64(v),
            Self::Decimal(d) => Some(d),
        }
    }

    /// Integral value if the number has no fractional part and fits in an i64.
    pub fn to_i64(self) -> Option<i64> {
        match self {
            Self::Integer(v) => i64::try_from(v).ok(),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => {
                if v >= i64::MIN as f64 && v <= i64::MAX as f64 {
                    Some(v as i64)
                } else {
                    None
                }
            }
            Self::Float(_) => None,
            Self::Decimal(d) => {
                let divisor = pow10(d.scale())?;
                if d.mantissa() % divisor == 0 {
                    i64::try_from(d.mantissa() / divisor).ok()
                } else {
                    None
                }
            }
        }
    }

    fn is_exact(self) -> bool {
        !matches!(self, Self::Float(_))
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.is_exact() && other.is_exact() {
            if let (Some(a), Some(b)) = (self.to_decimal(), other.to_decimal()) {
                if let Some(ord) = a.exact_cmp(b) {
                    return Some(ord);
                }
            }
        }
        self.to_f64().partial_cmp(&other.to_f64())
    }
}

impl FromStr for Number {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(v) = trimmed.parse::<i128>() {
            return Ok(Self::Integer(v));
        }
        trimmed.parse::<Decimal>().map(Self::Decimal)
    }
}

/// Field of a composite schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaField {
    pub name: String,
    pub kind: ValueKind,
    /// Nested schema for composite fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Arc<CompositeSchema>>,
}

/// Declared layout of a composite value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeSchema {
    pub type_name: String,
    pub fields: Vec<SchemaField>,
}

impl CompositeSchema {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style scalar field.
    pub fn field(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            kind,
            schema: None,
        });
        self
    }

    /// Builder-style composite field.
    pub fn nested(mut self, name: impl Into<String>, schema: Arc<CompositeSchema>) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            kind: ValueKind::Composite,
            schema: Some(schema),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Resolves a dotted path to the declared field at its end.
    pub fn resolve_path(&self, path: &[String]) -> Option<&SchemaField> {
        let (first, rest) = path.split_first()?;
        let field = self.get(first)?;
        if rest.is_empty() {
            return Some(field);
        }
        field.schema.as_deref()?.resolve_path(rest)
    }
}

/// A composite value with its schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeValue {
    #[serde(rename = "type", serialize_with = "serialize_type_name")]
    schema: Arc<CompositeSchema>,
    items: BTreeMap<String, Value>,
}

fn serialize_type_name<S: Serializer>(
    schema: &Arc<CompositeSchema>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&schema.type_name)
}

impl CompositeValue {
    pub fn new(schema: Arc<CompositeSchema>) -> Self {
        Self {
            schema,
            items: BTreeMap::new(),
        }
    }

    /// Builder-style item insert. Fields outside the schema are ignored.
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        if self.schema.get(name).is_some() {
            self.items.insert(name.to_string(), value);
        }
    }

    pub fn schema(&self) -> &Arc<CompositeSchema> {
        &self.schema
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.items.get(name)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Walks a dotted path through nested composites.
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let value = self.get(first)?;
        if rest.is_empty() {
            return Some(value);
        }
        match value {
            Value::Composite(inner) => inner.get_path(rest),
            _ => None,
        }
    }
}

/// An attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    BigInt(#[serde(serialize_with = "serialize_display")] i128),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Composite(CompositeValue),
}

fn serialize_display<S: Serializer, T: fmt::Display>(v: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(v)
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::BigInt(_) => ValueKind::BigInt,
            Self::Float(_) => ValueKind::Float,
            Self::Decimal(_) => ValueKind::Decimal,
            Self::Text(_) => ValueKind::Text,
            Self::Composite(_) => ValueKind::Composite,
        }
    }

    /// Coerces the value to a number.
    ///
    /// Booleans map to 0/1 and strings must hold a decimal literal; anything
    /// else fails with `NotANumber`.
    pub fn to_number(&self) -> Result<Number, AttributeError> {
        match self {
            Self::Bool(v) => Ok(Number::Integer(i128::from(*v))),
            Self::Int(v) => Ok(Number::Integer(i128::from(*v))),
            Self::BigInt(v) => Ok(Number::Integer(*v)),
            Self::Float(v) => Ok(Number::Float(*v)),
            Self::Decimal(d) => Ok(Number::Decimal(*d)),
            Self::Text(s) => s.parse(),
            Self::Composite(_) => Err(AttributeError::NotANumber(self.to_string())),
        }
    }

    pub fn to_f64(&self) -> Result<f64, AttributeError> {
        self.to_number().map(Number::to_f64)
    }

    /// Builds the most precise value for a coerced number.
    pub fn from_number(n: Number) -> Self {
        match n {
            Number::Integer(v) => i64::try_from(v).map_or(Self::BigInt(v), Self::Int),
            Number::Float(v) => Self::Float(v),
            Number::Decimal(d) => Self::Decimal(d),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(s) => f.write_str(s),
            Self::Composite(c) => {
                write!(f, "{}{{", c.schema.type_name)?;
                for (i, (k, v)) in c.items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Describes one attribute exposed by a resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeMetadata {
    pub name: String,
    pub kind: ValueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Arc<CompositeSchema>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl AttributeMetadata {
    pub fn scalar(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            schema: None,
            description: String::new(),
        }
    }

    pub fn composite(name: impl Into<String>, schema: Arc<CompositeSchema>) -> Self {
        Self {
            name: name.into(),
            kind: ValueKind::Composite,
            schema: Some(schema),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}
