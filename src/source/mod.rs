//! Foreign attribute sources: resources whose attributes an aggregator
//! reads by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::AttributeError;
use crate::value::{AttributeMetadata, CompositeSchema, CompositeValue, Value};

/// Named resource exposing readable (and possibly writable) attributes.
#[async_trait]
pub trait ForeignAttributeSource: Send + Sync {
    fn name(&self) -> &str;

    async fn get_attribute(&self, attribute: &str) -> Result<Value, AttributeError>;

    /// Reads several attributes in one call.
    async fn get_attributes(&self, attributes: &[String]) -> Result<Vec<Value>, AttributeError> {
        let mut values = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            values.push(self.get_attribute(attribute).await?);
        }
        Ok(values)
    }

    async fn set_attribute(&self, attribute: &str, value: Value) -> Result<(), AttributeError>;

    fn attribute_metadata(&self) -> Vec<AttributeMetadata>;
}

/// Error for an attribute the source does not expose.
pub fn unavailable(source: &str, attribute: &str) -> AttributeError {
    AttributeError::ForeignAttributeUnavailable(format!("{source}/{attribute}"))
}

/// Sources by resource name.
#[derive(Default)]
pub struct SourceDirectory {
    sources: DashMap<String, Arc<dyn ForeignAttributeSource>>,
}

impl SourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source under its own name, replacing any previous one.
    pub fn register(&self, source: Arc<dyn ForeignAttributeSource>) {
        let name = source.name().to_string();
        if self.sources.insert(name.clone(), source).is_some() {
            debug!(source = %name, "replaced foreign attribute source");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.sources.remove(name).is_some()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ForeignAttributeSource>, AttributeError> {
        self.sources
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| AttributeError::ForeignAttributeUnavailable(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// In-memory source holding fixed values, configured from YAML.
pub struct StaticSource {
    name: String,
    values: RwLock<BTreeMap<String, Value>>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with(self, attribute: impl Into<String>, value: Value) -> Self {
        self.values.write().insert(attribute.into(), value);
        self
    }

    /// Builds a source from YAML values. Mappings become composites whose
    /// schema is named after the attribute.
    pub fn from_yaml(
        name: impl Into<String>,
        values: &BTreeMap<String, serde_yaml::Value>,
    ) -> Result<Self, AttributeError> {
        let source = Self::new(name);
        for (attribute, raw) in values {
            let value = yaml_to_value(attribute, raw)?;
            source.values.write().insert(attribute.clone(), value);
        }
        Ok(source)
    }
}

fn yaml_to_value(name: &str, raw: &serde_yaml::Value) -> Result<Value, AttributeError> {
    use serde_yaml::Value as Yaml;

    match raw {
        Yaml::Bool(v) => Ok(Value::Bool(*v)),
        Yaml::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(Value::Int(v))
            } else if let Some(v) = n.as_u64() {
                Ok(Value::BigInt(i128::from(v)))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Yaml::String(s) => Ok(Value::Text(s.clone())),
        Yaml::Mapping(map) => {
            let mut items = Vec::with_capacity(map.len());
            for (key, value) in map {
                let key = key.as_str().ok_or_else(|| {
                    AttributeError::InvalidValue(format!("{name}: composite keys must be strings"))
                })?;
                items.push((key.to_string(), yaml_to_value(key, value)?));
            }
            let schema = items.iter().fold(CompositeSchema::new(name), |schema, (key, value)| {
                match value {
                    Value::Composite(inner) => schema.nested(key, Arc::clone(inner.schema())),
                    other => schema.field(key, other.kind()),
                }
            });
            let composite = items
                .into_iter()
                .fold(CompositeValue::new(Arc::new(schema)), |c, (key, value)| {
                    c.with(&key, value)
                });
            Ok(Value::Composite(composite))
        }
        Yaml::Null | Yaml::Sequence(_) | Yaml::Tagged(_) => Err(AttributeError::InvalidValue(
            format!("{name}: only scalars and mappings are supported"),
        )),
    }
}

fn metadata_for(name: &str, value: &Value) -> AttributeMetadata {
    match value {
        Value::Composite(c) => AttributeMetadata::composite(name, Arc::clone(c.schema())),
        other => AttributeMetadata::scalar(name, other.kind()),
    }
}

#[async_trait]
impl ForeignAttributeSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_attribute(&self, attribute: &str) -> Result<Value, AttributeError> {
        self.values
            .read()
            .get(attribute)
            .cloned()
            .ok_or_else(|| unavailable(&self.name, attribute))
    }

    async fn set_attribute(&self, attribute: &str, value: Value) -> Result<(), AttributeError> {
        self.values.write().insert(attribute.to_string(), value);
        Ok(())
    }

    fn attribute_metadata(&self) -> Vec<AttributeMetadata> {
        self.values
            .read()
            .iter()
            .map(|(name, value)| metadata_for(name, value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;

    fn yaml(text: &str) -> BTreeMap<String, serde_yaml::Value> {
        serde_yaml::from_str(text).expect("valid yaml")
    }

    #[tokio::test]
    async fn test_static_source_from_yaml() {
        let source = StaticSource::from_yaml(
            "jvm",
            &yaml(
                r#"
heapUsed: 512
loadAverage: 0.75
healthy: true
version: "17.0.2"
memory:
  used: 100
  pools:
    eden: 40
"#,
            ),
        )
        .expect("valid source");

        assert_eq!(source.get_attribute("heapUsed").await, Ok(Value::Int(512)));
        assert_eq!(source.get_attribute("loadAverage").await, Ok(Value::Float(0.75)));
        assert_eq!(source.get_attribute("healthy").await, Ok(Value::Bool(true)));

        let Ok(Value::Composite(memory)) = source.get_attribute("memory").await else {
            panic!("composite expected");
        };
        let path = vec!["pools".to_string(), "eden".to_string()];
        assert_eq!(memory.get_path(&path), Some(&Value::Int(40)));
        assert_eq!(
            memory.schema().resolve_path(&path).map(|f| f.kind),
            Some(ValueKind::Int)
        );
    }

    #[tokio::test]
    async fn test_unknown_attribute_is_unavailable() {
        let source = StaticSource::new("jvm");
        assert_eq!(
            source.get_attribute("missing").await,
            Err(AttributeError::ForeignAttributeUnavailable(
                "jvm/missing".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_batch_read_and_set() {
        let source = StaticSource::new("s").with("a", Value::Int(1));
        source.set_attribute("b", Value::Int(2)).await.expect("set");
        let values = source
            .get_attributes(&["a".to_string(), "b".to_string()])
            .await
            .expect("batch read");
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
        assert!(source.get_attributes(&["zzz".to_string()]).await.is_err());
    }

    #[test]
    fn test_metadata_describes_values() {
        let source = StaticSource::new("s")
            .with("n", Value::Int(1))
            .with("t", Value::Text("x".to_string()));
        let metadata = source.attribute_metadata();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[0].kind, ValueKind::Int);
        assert_eq!(metadata[1].kind, ValueKind::Text);
    }

    #[test]
    fn test_sequences_are_rejected() {
        assert!(StaticSource::from_yaml("s", &yaml("list: [1, 2]")).is_err());
    }

    #[test]
    fn test_directory_resolve() {
        let directory = SourceDirectory::new();
        directory.register(Arc::new(StaticSource::new("jvm")));
        assert!(directory.resolve("jvm").is_ok());
        assert_eq!(
            directory.resolve("db").err(),
            Some(AttributeError::ForeignAttributeUnavailable("db".to_string()))
        );
        assert_eq!(directory.names(), vec!["jvm".to_string()]);
        assert!(directory.unregister("jvm"));
    }
}
