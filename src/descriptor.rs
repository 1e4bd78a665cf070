//! Configuration resolver for string-keyed parameter maps.
//!
//! Every computed attribute, event and resource is configured through a
//! [`Descriptor`]. Strategies pull their typed inputs out of it eagerly at
//! construction time so a missing key is a permanent construction failure
//! instead of a runtime surprise.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AttributeError;

/// Well-known parameter names.
pub mod keys {
    pub const NAME: &str = "name";
    pub const SOURCE: &str = "source";
    pub const FOREIGN_ATTRIBUTE: &str = "foreignAttribute";
    pub const FIRST_FOREIGN_ATTRIBUTE: &str = "firstForeignAttribute";
    pub const SECOND_FOREIGN_ATTRIBUTE: &str = "secondForeignAttribute";
    pub const COMPARER: &str = "comparer";
    pub const VALUE: &str = "value";
    pub const TIME_INTERVAL: &str = "timeInterval";
    pub const FIELD_PATH: &str = "fieldPath";
    pub const CHANNELS: &str = "channels";
    pub const FILTER: &str = "filter";
    pub const RANGE_START: &str = "rangeStart";
    pub const RANGE_END: &str = "rangeEnd";
    pub const COMPONENT_NAME: &str = "componentName";
    pub const COMPONENT_INSTANCE: &str = "componentInstance";
    pub const SYNCHRONIZATION_PERIOD: &str = "synchronizationPeriod";
    pub const NOTIFICATION_FREQUENCY: &str = "notificationFrequency";
    pub const READ_TIMEOUT: &str = "readTimeout";
    pub const PARSER_LANGUAGE: &str = "parserLanguage";
    pub const PARSER_SCRIPT: &str = "parserScript";
    pub const WORKERS: &str = "workers";
    pub const LISTENER_INVOCATION: &str = "listenerInvocation";
}

/// A string-keyed parameter map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Descriptor {
    params: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the raw value or fails with `MissingConfigurationParameter`.
    pub fn get(&self, key: &str) -> Result<&str, AttributeError> {
        self.params
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| AttributeError::MissingConfigurationParameter(key.to_string()))
    }

    /// Returns the raw value or `default`. Never fails.
    pub fn get_or_default<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.params.get(key).map(String::as_str).unwrap_or(default)
    }

    /// Parses a required parameter.
    pub fn parse<T>(&self, key: &str) -> Result<T, AttributeError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.get(key)?;
        raw.trim()
            .parse()
            .map_err(|e: T::Err| AttributeError::invalid_parameter(key, e.to_string()))
    }

    /// Parses an optional parameter, falling back to `default` when absent.
    /// A present but malformed value is still an error.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, AttributeError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        if self.contains(key) {
            self.parse(key)
        } else {
            Ok(default)
        }
    }

    /// Reads a required millisecond parameter as a [`Duration`].
    pub fn millis(&self, key: &str) -> Result<Duration, AttributeError> {
        self.parse::<u64>(key).map(Duration::from_millis)
    }

    /// Reads an optional millisecond parameter as a [`Duration`].
    pub fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, AttributeError> {
        if self.contains(key) {
            self.millis(key)
        } else {
            Ok(default)
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Descriptor
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            params: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// YAML scalar accepted as a parameter value.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl<'de> Deserialize<'de> for Descriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(k, v)| (k, v.to_string())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_parameter() {
        let d = Descriptor::new().with(keys::SOURCE, "jvm");
        assert_eq!(d.get(keys::SOURCE), Ok("jvm"));
        assert_eq!(
            d.get(keys::VALUE),
            Err(AttributeError::MissingConfigurationParameter(
                "value".to_string()
            ))
        );
    }

    #[test]
    fn test_get_or_default_never_fails() {
        let d = Descriptor::new();
        assert_eq!(d.get_or_default(keys::PARSER_LANGUAGE, "json"), "json");
    }

    #[test]
    fn test_parse_invalid_value() {
        let d = Descriptor::new().with(keys::TIME_INTERVAL, "soon");
        let err = d.parse::<u64>(keys::TIME_INTERVAL).unwrap_err();
        assert!(matches!(
            err,
            AttributeError::InvalidConfigurationParameter { ref name, .. } if name == "timeInterval"
        ));
    }

    #[test]
    fn test_millis_or_default() {
        let d = Descriptor::new().with(keys::SYNCHRONIZATION_PERIOD, "250");
        assert_eq!(
            d.millis_or(keys::SYNCHRONIZATION_PERIOD, Duration::from_secs(5)),
            Ok(Duration::from_millis(250))
        );
        assert_eq!(
            d.millis_or(keys::NOTIFICATION_FREQUENCY, Duration::from_secs(5)),
            Ok(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_deserialize_yaml_scalars() {
        let d: Descriptor =
            serde_yaml::from_str("source: jvm\nvalue: 42\nenabled: true\nratio: 0.5\n")
                .expect("valid yaml");
        assert_eq!(d.get("value"), Ok("42"));
        assert_eq!(d.get("enabled"), Ok("true"));
        assert_eq!(d.get("ratio"), Ok("0.5"));
        assert_eq!(d.len(), 4);
    }
}
