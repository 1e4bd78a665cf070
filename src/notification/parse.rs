//! Parsers turning raw transport bodies into measurements.
//!
//! A parser only decodes the body. Header fallbacks, component filtering
//! and sequence stamping happen in the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use super::{InstantValue, Measurement, ValueChange};
use crate::value::Decimal;

/// Errors that can occur while parsing a transport message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed payload {payload:?}: {reason}")]
    Malformed { payload: String, reason: String },

    #[error("unknown measurement kind: {0}")]
    UnknownKind(String),

    #[error("empty payload")]
    EmptyPayload,

    #[error("invalid parser script: {0}")]
    InvalidScript(String),
}

impl ParseError {
    fn malformed(body: &[u8], reason: impl Into<String>) -> Self {
        Self::Malformed {
            payload: preview(body),
            reason: reason.into(),
        }
    }
}

/// Payload prefix kept in error messages.
const PREVIEW_LEN: usize = 128;

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}

/// A decoded message before identity resolution and stamping.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub component_name: Option<String>,
    pub component_instance: Option<String>,
    pub message: Option<String>,
    pub timestamp_ms: Option<u64>,
    pub measurement: Measurement,
}

impl ParsedMessage {
    pub fn new(measurement: Measurement) -> Self {
        Self {
            component_name: None,
            component_instance: None,
            message: None,
            timestamp_ms: None,
            measurement,
        }
    }
}

/// Decodes raw message bodies.
pub trait NotificationParser: Send + Sync {
    fn language(&self) -> &'static str;

    /// `Ok(None)` marks a message that is deliberately ignored.
    fn parse(&self, body: &[u8]) -> Result<Option<ParsedMessage>, ParseError>;
}

/// Measurement kind tags shared by every parser.
mod kind {
    pub const VALUE_CHANGED: &str = "valueChanged";
    pub const STOPWATCH: &str = "stopwatch";
    pub const FLAG: &str = "flag";
    pub const TEXT: &str = "text";
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// JSON body tagged by `kind`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonMessage {
    kind: String,
    integer: Option<i64>,
    floating_point: Option<f64>,
    numeric: Option<serde_json::Value>,
    duration_ms: Option<u64>,
    value: Option<serde_json::Value>,
    component_name: Option<String>,
    component_instance: Option<String>,
    message: Option<String>,
    timestamp: Option<u64>,
}

/// Parser for `parserLanguage: json`.
#[derive(Debug, Default)]
pub struct JsonParser;

impl JsonParser {
    fn measurement(body: &[u8], msg: &JsonMessage) -> Result<Measurement, ParseError> {
        match msg.kind.as_str() {
            kind::VALUE_CHANGED => {
                if let Some(v) = msg.integer {
                    Ok(Measurement::ValueChanged(ValueChange::Integer(v)))
                } else if let Some(v) = msg.floating_point {
                    Ok(Measurement::ValueChanged(ValueChange::FloatingPoint(v)))
                } else if let Some(v) = &msg.numeric {
                    let text = match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Number(n) => n.to_string(),
                        other => {
                            return Err(ParseError::malformed(
                                body,
                                format!("numeric must be a number or string, got {other}"),
                            ))
                        }
                    };
                    let decimal: Decimal = text
                        .parse()
                        .map_err(|e| ParseError::malformed(body, format!("numeric: {e}")))?;
                    Ok(Measurement::ValueChanged(ValueChange::Numeric(decimal)))
                } else {
                    Err(ParseError::malformed(
                        body,
                        "valueChanged needs integer, floatingPoint or numeric",
                    ))
                }
            }
            kind::STOPWATCH => {
                let ms = msg
                    .duration_ms
                    .ok_or_else(|| ParseError::malformed(body, "stopwatch needs durationMs"))?;
                Ok(Measurement::Stopwatch {
                    duration: Duration::from_millis(ms),
                })
            }
            kind::FLAG => match &msg.value {
                Some(serde_json::Value::Bool(v)) => {
                    Ok(Measurement::Instant(InstantValue::Flag(*v)))
                }
                _ => Err(ParseError::malformed(body, "flag needs a boolean value")),
            },
            kind::TEXT => match &msg.value {
                Some(serde_json::Value::String(s)) => {
                    Ok(Measurement::Instant(InstantValue::Text(s.clone())))
                }
                Some(v) if !v.is_null() => Ok(Measurement::Instant(InstantValue::Text(v.to_string()))),
                _ => Err(ParseError::malformed(body, "text needs a value")),
            },
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

impl NotificationParser for JsonParser {
    fn language(&self) -> &'static str {
        "json"
    }

    fn parse(&self, body: &[u8]) -> Result<Option<ParsedMessage>, ParseError> {
        if is_blank(body) {
            return Err(ParseError::EmptyPayload);
        }
        let raw: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ParseError::malformed(body, e.to_string()))?;
        if raw.is_null() {
            return Ok(None);
        }
        let msg: JsonMessage =
            serde_json::from_value(raw).map_err(|e| ParseError::malformed(body, e.to_string()))?;

        let measurement = Self::measurement(body, &msg)?;
        Ok(Some(ParsedMessage {
            component_name: msg.component_name,
            component_instance: msg.component_instance,
            message: msg.message,
            timestamp_ms: msg.timestamp,
            measurement,
        }))
    }
}

/// Parser for `parserLanguage: regex`.
///
/// The script must define the named groups `kind` and `value`; `component`,
/// `instance` and `message` are optional.
#[derive(Debug)]
pub struct RegexParser {
    pattern: Regex,
}

impl RegexParser {
    pub fn new(script: &str) -> Result<Self, ParseError> {
        let pattern = Regex::new(script).map_err(|e| ParseError::InvalidScript(e.to_string()))?;
        let names: Vec<&str> = pattern.capture_names().flatten().collect();
        for required in ["kind", "value"] {
            if !names.contains(&required) {
                return Err(ParseError::InvalidScript(format!(
                    "missing named group {required:?}"
                )));
            }
        }
        Ok(Self { pattern })
    }

    fn measurement(body: &[u8], kind: &str, value: &str) -> Result<Measurement, ParseError> {
        let value = value.trim();
        match kind {
            kind::VALUE_CHANGED => {
                if let Ok(v) = value.parse::<i64>() {
                    return Ok(Measurement::ValueChanged(ValueChange::Integer(v)));
                }
                let decimal: Decimal = value
                    .parse()
                    .map_err(|e| ParseError::malformed(body, format!("value: {e}")))?;
                Ok(Measurement::ValueChanged(ValueChange::Numeric(decimal)))
            }
            kind::STOPWATCH => {
                let ms: u64 = value
                    .parse()
                    .map_err(|e| ParseError::malformed(body, format!("duration: {e}")))?;
                Ok(Measurement::Stopwatch {
                    duration: Duration::from_millis(ms),
                })
            }
            kind::FLAG => {
                let flag: bool = value
                    .parse()
                    .map_err(|e| ParseError::malformed(body, format!("flag: {e}")))?;
                Ok(Measurement::Instant(InstantValue::Flag(flag)))
            }
            kind::TEXT => Ok(Measurement::Instant(InstantValue::Text(value.to_string()))),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

impl NotificationParser for RegexParser {
    fn language(&self) -> &'static str {
        "regex"
    }

    fn parse(&self, body: &[u8]) -> Result<Option<ParsedMessage>, ParseError> {
        if is_blank(body) {
            return Err(ParseError::EmptyPayload);
        }
        let text = std::str::from_utf8(body)
            .map_err(|e| ParseError::malformed(body, e.to_string()))?;
        let caps = self
            .pattern
            .captures(text)
            .ok_or_else(|| ParseError::malformed(body, "does not match parser script"))?;
        let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());

        let kind = group("kind").unwrap_or_default();
        let value = group("value").unwrap_or_default();
        let measurement = Self::measurement(body, &kind, &value)?;
        Ok(Some(ParsedMessage {
            component_name: group("component"),
            component_instance: group("instance"),
            message: group("message"),
            timestamp_ms: None,
            measurement,
        }))
    }
}

/// Selects the parser for a `parserLanguage` / `parserScript` pair.
pub fn parser_for(
    language: &str,
    script: Option<&str>,
) -> Result<Arc<dyn NotificationParser>, ParseError> {
    match language {
        "json" => Ok(Arc::new(JsonParser)),
        "regex" => {
            let script = script.ok_or_else(|| {
                ParseError::InvalidScript("regex parser needs parserScript".to_string())
            })?;
            Ok(Arc::new(RegexParser::new(script)?))
        }
        other => Err(ParseError::InvalidScript(format!(
            "unsupported parser language {other:?}"
        ))),
    }
}
