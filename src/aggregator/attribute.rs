use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use super::composer::Composer;
use super::strategy::{BinaryStrategy, Comparison, UnaryStrategy};
use super::window::{WindowedAccumulator, WindowedKind};
use crate::attribute::{declared_type, Attribute, AttributeFactory};
use crate::descriptor::{keys, Descriptor};
use crate::error::AttributeError;
use crate::source::{ForeignAttributeSource, SourceDirectory};
use crate::value::{AttributeMetadata, Number, Value, ValueKind};

/// Aggregation types, keyed by the names used in attribute descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationType {
    Matcher,
    ComparisonWith,
    PercentFrom,
    Decomposer,
    Stringifier,
    Comparison,
    Percent,
    Composer,
    Counter,
    Average,
    Peak,
}

impl AggregationType {
    pub const ALL: [Self; 11] = [
        Self::Matcher,
        Self::ComparisonWith,
        Self::PercentFrom,
        Self::Decomposer,
        Self::Stringifier,
        Self::Comparison,
        Self::Percent,
        Self::Composer,
        Self::Counter,
        Self::Average,
        Self::Peak,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Matcher => "matcher",
            Self::ComparisonWith => "comparisonWith",
            Self::PercentFrom => "percentFrom",
            Self::Decomposer => "decomposer",
            Self::Stringifier => "stringifier",
            Self::Comparison => "comparison",
            Self::Percent => "percent",
            Self::Composer => "composer",
            Self::Counter => "counter",
            Self::Average => "average",
            Self::Peak => "peak",
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AttributeError::UnrecognizedAttributeType(s.to_string()))
    }
}

/// What an aggregate attribute computes on each read.
enum Computation {
    Unary {
        attribute: String,
        strategy: UnaryStrategy,
    },
    Binary {
        first: String,
        second: String,
        strategy: BinaryStrategy,
    },
    Composite(Composer),
    Windowed {
        attribute: String,
        accumulator: WindowedAccumulator,
    },
}

impl Computation {
    /// Validates the descriptor and builds the computation for `aggregation`.
    fn build(
        aggregation: AggregationType,
        descriptor: &Descriptor,
        source: &dyn ForeignAttributeSource,
    ) -> Result<Self, AttributeError> {
        let unary = |strategy| -> Result<Self, AttributeError> {
            Ok(Self::Unary {
                attribute: descriptor.get(keys::FOREIGN_ATTRIBUTE)?.to_string(),
                strategy,
            })
        };
        let binary = |strategy| -> Result<Self, AttributeError> {
            Ok(Self::Binary {
                first: descriptor.get(keys::FIRST_FOREIGN_ATTRIBUTE)?.to_string(),
                second: descriptor.get(keys::SECOND_FOREIGN_ATTRIBUTE)?.to_string(),
                strategy,
            })
        };
        let windowed = |kind| -> Result<Self, AttributeError> {
            Ok(Self::Windowed {
                attribute: descriptor.get(keys::FOREIGN_ATTRIBUTE)?.to_string(),
                accumulator: WindowedAccumulator::new(kind, descriptor.millis(keys::TIME_INTERVAL)?),
            })
        };

        match aggregation {
            AggregationType::Matcher => {
                let pattern = Regex::new(descriptor.get(keys::VALUE)?)
                    .map_err(|e| AttributeError::invalid_parameter(keys::VALUE, e.to_string()))?;
                unary(UnaryStrategy::Matcher(pattern))
            }
            AggregationType::ComparisonWith => {
                let comparison: Comparison = descriptor.parse(keys::COMPARER)?;
                let operand: Number = descriptor.parse(keys::VALUE)?;
                unary(UnaryStrategy::Comparison {
                    comparison,
                    operand,
                })
            }
            AggregationType::PercentFrom => {
                let operand: Number = descriptor.parse(keys::VALUE)?;
                unary(UnaryStrategy::Percent { operand })
            }
            AggregationType::Decomposer => {
                let attribute = descriptor.get(keys::FOREIGN_ATTRIBUTE)?;
                let path: Vec<String> = descriptor
                    .get(keys::FIELD_PATH)?
                    .split('.')
                    .map(str::to_string)
                    .collect();
                let kind = decomposed_kind(source, attribute, &path)?;
                unary(UnaryStrategy::Decompose { path, kind })
            }
            AggregationType::Stringifier => unary(UnaryStrategy::Stringify),
            AggregationType::Comparison => {
                binary(BinaryStrategy::Comparison(descriptor.parse(keys::COMPARER)?))
            }
            AggregationType::Percent => binary(BinaryStrategy::Percent),
            AggregationType::Composer => Ok(Self::Composite(Composer::new(source))),
            AggregationType::Counter => windowed(WindowedKind::Counter),
            AggregationType::Average => windowed(WindowedKind::Average),
            AggregationType::Peak => windowed(WindowedKind::Peak),
        }
    }

    fn metadata(&self, name: &str) -> AttributeMetadata {
        match self {
            Self::Unary { strategy, .. } => AttributeMetadata::scalar(name, strategy.result_kind()),
            Self::Binary { strategy, .. } => AttributeMetadata::scalar(name, strategy.result_kind()),
            Self::Composite(composer) => AttributeMetadata::composite(name, Arc::clone(composer.schema())),
            Self::Windowed { .. } => AttributeMetadata::scalar(name, ValueKind::Float),
        }
    }
}

/// Declared kind of the field at `path` inside a composite foreign attribute.
fn decomposed_kind(
    source: &dyn ForeignAttributeSource,
    attribute: &str,
    path: &[String],
) -> Result<ValueKind, AttributeError> {
    let metadata = source
        .attribute_metadata()
        .into_iter()
        .find(|m| m.name == attribute)
        .ok_or_else(|| crate::source::unavailable(source.name(), attribute))?;
    metadata
        .schema
        .as_deref()
        .and_then(|schema| schema.resolve_path(path))
        .map(|field| field.kind)
        .ok_or_else(|| {
            AttributeError::invalid_parameter(
                keys::FIELD_PATH,
                format!("{} has no field {}", attribute, path.join(".")),
            )
        })
}

tokio::task_local! {
    /// Aggregate attributes being computed on the current task, as
    /// `resource/attribute`.
    static COMPUTING: RefCell<Vec<String>>;
}

/// Unmarks an attribute once its computation finishes or is dropped.
struct ComputingGuard<'a>(&'a str);

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        // Outside a scope there is nothing to unmark.
        let _ = COMPUTING.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|p| p == self.0) {
                active.remove(pos);
            }
        });
    }
}

/// Attribute derived from the attributes of another resource.
pub struct AggregateAttribute {
    name: String,
    path: String,
    descriptor: Descriptor,
    aggregation: AggregationType,
    source: Arc<dyn ForeignAttributeSource>,
    computation: Computation,
    metadata: AttributeMetadata,
    read_timeout: Duration,
    closed: AtomicBool,
}

impl AggregateAttribute {
    pub fn new(
        resource: &str,
        name: &str,
        descriptor: &Descriptor,
        aggregation: AggregationType,
        directory: &SourceDirectory,
        read_timeout: Duration,
    ) -> Result<Self, AttributeError> {
        let source_name = descriptor.get(keys::SOURCE)?;
        // Parameters are checked before the source is resolved so a bad
        // descriptor reports the missing key, not an unavailable source.
        Self::check_parameters(aggregation, descriptor)?;
        let path = format!("{resource}/{name}");
        let reads_itself = source_name == resource
            && [
                keys::FOREIGN_ATTRIBUTE,
                keys::FIRST_FOREIGN_ATTRIBUTE,
                keys::SECOND_FOREIGN_ATTRIBUTE,
            ]
            .iter()
            .any(|key| descriptor.get(key).is_ok_and(|v| v == name));
        if reads_itself {
            return Err(AttributeError::invalid_parameter(
                keys::SOURCE,
                format!("{path} reads itself"),
            ));
        }
        let source = directory.resolve(source_name)?;
        let computation = Computation::build(aggregation, descriptor, source.as_ref())?;
        let metadata = computation
            .metadata(name)
            .with_description(format!("{aggregation} over {source_name}"));

        Ok(Self {
            name: name.to_string(),
            path,
            descriptor: descriptor.clone(),
            aggregation,
            source,
            computation,
            metadata,
            read_timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn check_parameters(
        aggregation: AggregationType,
        descriptor: &Descriptor,
    ) -> Result<(), AttributeError> {
        let required: &[&str] = match aggregation {
            AggregationType::Matcher | AggregationType::PercentFrom => {
                &[keys::FOREIGN_ATTRIBUTE, keys::VALUE]
            }
            AggregationType::ComparisonWith => &[keys::FOREIGN_ATTRIBUTE, keys::COMPARER, keys::VALUE],
            AggregationType::Decomposer => &[keys::FOREIGN_ATTRIBUTE, keys::FIELD_PATH],
            AggregationType::Stringifier => &[keys::FOREIGN_ATTRIBUTE],
            AggregationType::Comparison => &[
                keys::FIRST_FOREIGN_ATTRIBUTE,
                keys::SECOND_FOREIGN_ATTRIBUTE,
                keys::COMPARER,
            ],
            AggregationType::Percent => {
                &[keys::FIRST_FOREIGN_ATTRIBUTE, keys::SECOND_FOREIGN_ATTRIBUTE]
            }
            AggregationType::Composer => &[],
            AggregationType::Counter | AggregationType::Average | AggregationType::Peak => {
                &[keys::FOREIGN_ATTRIBUTE, keys::TIME_INTERVAL]
            }
        };
        for key in required {
            descriptor.get(key)?;
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        what: &str,
        read: impl Future<Output = Result<T, AttributeError>>,
    ) -> Result<T, AttributeError> {
        tokio::time::timeout(self.read_timeout, read)
            .await
            .map_err(|_| {
                AttributeError::ForeignAttributeUnavailable(format!(
                    "{}/{} timed out after {:?}",
                    self.source.name(),
                    what,
                    self.read_timeout
                ))
            })?
    }

    async fn read(&self, attribute: &str) -> Result<Value, AttributeError> {
        self.bounded(attribute, self.source.get_attribute(attribute))
            .await
    }

    async fn compute(&self) -> Result<Value, AttributeError> {
        match &self.computation {
            Computation::Unary {
                attribute,
                strategy,
            } => strategy.compute(&self.read(attribute).await?),
            Computation::Binary {
                first,
                second,
                strategy,
            } => {
                let first = self.read(first).await?;
                let second = self.read(second).await?;
                strategy.compute(&first, &second)
            }
            Computation::Composite(composer) => {
                let values = self
                    .bounded("*", self.source.get_attributes(composer.attributes()))
                    .await?;
                composer.assemble(values).map(Value::Composite)
            }
            Computation::Windowed {
                attribute,
                accumulator,
            } => {
                let sample = self.read(attribute).await?.to_f64()?;
                Ok(Value::Float(accumulator.update(sample)))
            }
        }
    }
}

#[async_trait]
impl Attribute for AggregateAttribute {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn metadata(&self) -> AttributeMetadata {
        self.metadata.clone()
    }

    async fn get_value(&self) -> Result<Value, AttributeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AttributeError::Closed(self.name.clone()));
        }
        // Reads through other resources stay on this task, so a cycle shows
        // up as a path that is already computing.
        let result = match COMPUTING.try_with(|active| active.borrow().contains(&self.path)) {
            Ok(true) => Err(AttributeError::ForeignAttributeUnavailable(format!(
                "{} is part of a reference cycle",
                self.path
            ))),
            Ok(false) => {
                COMPUTING.with(|active| active.borrow_mut().push(self.path.clone()));
                let _guard = ComputingGuard(&self.path);
                self.compute().await
            }
            Err(_) => {
                COMPUTING
                    .scope(RefCell::new(vec![self.path.clone()]), self.compute())
                    .await
            }
        };
        if let Err(e) = &result {
            warn!(
                attribute = %self.name,
                aggregation = %self.aggregation,
                source = %self.source.name(),
                error = %e,
                "aggregate read failed",
            );
        }
        result
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Builds aggregate attributes against the sources in a directory.
pub struct AggregatorFactory {
    resource: String,
    directory: Arc<SourceDirectory>,
    read_timeout: Duration,
}

impl AggregatorFactory {
    pub fn new(resource: &str, directory: Arc<SourceDirectory>, read_timeout: Duration) -> Self {
        Self {
            resource: resource.to_string(),
            directory,
            read_timeout,
        }
    }
}

#[async_trait]
impl AttributeFactory for AggregatorFactory {
    async fn create(
        &self,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<Arc<dyn Attribute>, AttributeError> {
        let aggregation: AggregationType = declared_type(name, descriptor).parse()?;
        Ok(Arc::new(AggregateAttribute::new(
            &self.resource,
            name,
            descriptor,
            aggregation,
            &self.directory,
            self.read_timeout,
        )?))
    }
}
