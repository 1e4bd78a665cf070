use std::sync::Arc;

use crate::error::AttributeError;
use crate::source::ForeignAttributeSource;
use crate::value::{CompositeSchema, CompositeValue, Value};

/// Assembles every scalar attribute of a source into one composite.
///
/// The field set is taken from the source's metadata once, at
/// construction; attributes the source adds later are not picked up.
pub struct Composer {
    attributes: Vec<String>,
    schema: Arc<CompositeSchema>,
}

impl Composer {
    pub fn new(source: &dyn ForeignAttributeSource) -> Self {
        let scalars: Vec<_> = source
            .attribute_metadata()
            .into_iter()
            .filter(|m| m.kind.is_scalar())
            .collect();
        let schema = scalars
            .iter()
            .fold(CompositeSchema::new(source.name()), |schema, m| {
                schema.field(&m.name, m.kind)
            });
        Self {
            attributes: scalars.into_iter().map(|m| m.name).collect(),
            schema: Arc::new(schema),
        }
    }

    pub fn schema(&self) -> &Arc<CompositeSchema> {
        &self.schema
    }

    /// Attributes read by [`Composer::assemble`].
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Builds the composite from values read in `attributes()` order.
    pub fn assemble(&self, values: Vec<Value>) -> Result<CompositeValue, AttributeError> {
        if values.len() != self.attributes.len() {
            return Err(AttributeError::InvalidValue(format!(
                "expected {} values, got {}",
                self.attributes.len(),
                values.len()
            )));
        }
        Ok(self
            .attributes
            .iter()
            .zip(values)
            .fold(CompositeValue::new(Arc::clone(&self.schema)), |c, (name, value)| {
                c.with(name, value)
            }))
    }
}
