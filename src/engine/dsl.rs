//! Attribute-type declarations of message-driven resources.
//!
//! ```text
//! attribute-decl := metric-type
//!                 | "get" extractor "of" metric-type source-attribute-name
//! ```

use crate::error::AttributeError;
use crate::metrics::MetricKind;

/// Parsed attribute-type declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeDeclaration {
    /// A metric holder of the given type.
    Metric(MetricKind),
    /// A read-only projection of one field of another holder's view.
    Extraction {
        extractor: String,
        metric_kind: MetricKind,
        source: String,
    },
}

impl AttributeDeclaration {
    pub fn parse(input: &str) -> Result<Self, AttributeError> {
        let tokens: Vec<&str> = input.split_whitespace().collect();
        match tokens.as_slice() {
            [metric_type] => metric_type.parse().map(Self::Metric),
            ["get", extractor, "of", metric_type, source] => {
                let metric_kind: MetricKind = metric_type.parse()?;
                if !metric_kind.has_field(extractor) {
                    return Err(AttributeError::UnrecognizedExtractor {
                        metric_type: metric_kind.as_str().to_string(),
                        field: (*extractor).to_string(),
                    });
                }
                Ok(Self::Extraction {
                    extractor: (*extractor).to_string(),
                    metric_kind,
                    source: (*source).to_string(),
                })
            }
            _ => Err(AttributeError::UnrecognizedAttributeType(input.trim().to_string())),
        }
    }
}
