use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

use crate::attribute::{Attribute, AttributeRegistry};
use crate::descriptor::Descriptor;
use crate::error::AttributeError;
use crate::metrics::{now_millis, MetricKind};
use crate::value::{AttributeMetadata, Value, ValueKind};

/// The metric holder an extraction currently reads from.
struct BoundSource {
    attribute: Arc<dyn Attribute>,
}

/// Read-only projection of one view field of another metric holder.
///
/// The source holder is looked up by name on first read, since attributes
/// connect in no particular order, and re-resolved if it is closed or
/// replaced.
pub struct ExtractionAttribute {
    name: String,
    descriptor: Descriptor,
    extractor: String,
    metric_kind: MetricKind,
    source: String,
    registry: Weak<AttributeRegistry>,
    bound: ArcSwapOption<BoundSource>,
}

impl ExtractionAttribute {
    pub fn new(
        name: &str,
        descriptor: &Descriptor,
        extractor: String,
        metric_kind: MetricKind,
        source: String,
        registry: Weak<AttributeRegistry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.clone(),
            extractor,
            metric_kind,
            source,
            registry,
            bound: ArcSwapOption::empty(),
        }
    }

    fn resolve(&self) -> Result<Arc<BoundSource>, AttributeError> {
        if let Some(bound) = self.bound.load_full() {
            let live = bound
                .attribute
                .as_metric()
                .is_some_and(|m| !m.is_closed());
            if live {
                return Ok(bound);
            }
        }

        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| AttributeError::Closed(self.name.clone()))?;
        let attribute = registry
            .get(&self.source)
            .ok_or_else(|| AttributeError::AttributeNotFound(self.source.clone()))?;
        let kind = attribute.as_metric().map(|m| m.metric_kind());
        if kind != Some(self.metric_kind) {
            return Err(AttributeError::InvalidValue(format!(
                "{} is not a {} metric",
                self.source, self.metric_kind
            )));
        }

        let bound = Arc::new(BoundSource { attribute });
        self.bound.store(Some(Arc::clone(&bound)));
        Ok(bound)
    }
}

#[async_trait]
impl Attribute for ExtractionAttribute {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn metadata(&self) -> AttributeMetadata {
        let kind = self
            .metric_kind
            .schema()
            .get(&self.extractor)
            .map_or(ValueKind::Text, |f| f.kind);
        AttributeMetadata::scalar(&self.name, kind)
            .with_description(format!("{} of {}", self.extractor, self.source))
    }

    async fn get_value(&self) -> Result<Value, AttributeError> {
        let bound = self.resolve()?;
        let view = bound
            .attribute
            .as_metric()
            .and_then(|m| m.view_at(now_millis()))
            .ok_or_else(|| AttributeError::Closed(self.source.clone()))?;
        view.get(&self.extractor).cloned().ok_or_else(|| {
            AttributeError::InvalidValue(format!("{} has no {} yet", self.source, self.extractor))
        })
    }

    fn close(&self) {
        self.bound.store(None);
    }
}
