use thiserror::Error;

/// Errors raised while constructing or evaluating a computed attribute.
///
/// Construction-time variants keep one attribute from becoming live; runtime
/// variants fail a single read or update and never reach sibling attributes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttributeError {
    #[error("missing configuration parameter: {0}")]
    MissingConfigurationParameter(String),

    #[error("invalid configuration parameter {name}: {reason}")]
    InvalidConfigurationParameter { name: String, reason: String },

    #[error("unrecognized attribute type: {0}")]
    UnrecognizedAttributeType(String),

    #[error("extractor {field} is not valid for {metric_type}")]
    UnrecognizedExtractor { metric_type: String, field: String },

    #[error("not a number: {0}")]
    NotANumber(String),

    #[error("foreign attribute unavailable: {0}")]
    ForeignAttributeUnavailable(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("attribute {0} is closed")]
    Closed(String),

    #[error("attribute not found: {0}")]
    AttributeNotFound(String),
}

impl AttributeError {
    /// True for failures that can only happen while an attribute is built.
    pub fn is_construction_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingConfigurationParameter(_)
                | Self::InvalidConfigurationParameter { .. }
                | Self::UnrecognizedAttributeType(_)
                | Self::UnrecognizedExtractor { .. }
        )
    }

    pub(crate) fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfigurationParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors reported by the cluster collaborators (counter, snapshot store).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("cluster counter unavailable: {0}")]
    CounterUnavailable(String),

    #[error("snapshot exchange failed for {key}: {reason}")]
    ExchangeFailed { key: String, reason: String },
}
