//! The two resource kinds behind one handle, as served by the agent and
//! exposed to aggregators as foreign attribute sources.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorResource;
use crate::attribute::{Attribute, AttributeRegistry};
use crate::descriptor::Descriptor;
use crate::engine::{MessageDrivenResource, SyncStats};
use crate::error::AttributeError;
use crate::notification::dispatcher::Headers;
use crate::notification::listener::{ListenerId, NotificationListener};
use crate::notification::stats::NotificationStats;
use crate::source::ForeignAttributeSource;
use crate::value::{AttributeMetadata, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Aggregator,
    MessageDriven,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aggregator => "aggregator",
            Self::MessageDriven => "message_driven",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aggregator" => Ok(Self::Aggregator),
            "message_driven" => Ok(Self::MessageDriven),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}

/// Shared handle to a running resource.
#[derive(Clone)]
pub enum Resource {
    Aggregator(Arc<AggregatorResource>),
    MessageDriven(Arc<MessageDrivenResource>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Aggregator(_) => ResourceKind::Aggregator,
            Self::MessageDriven(_) => ResourceKind::MessageDriven,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Aggregator(r) => r.name(),
            Self::MessageDriven(r) => r.name(),
        }
    }

    pub fn registry(&self) -> &Arc<AttributeRegistry> {
        match self {
            Self::Aggregator(r) => r.registry(),
            Self::MessageDriven(r) => r.registry(),
        }
    }

    pub fn notification_stats(&self) -> &Arc<NotificationStats> {
        match self {
            Self::Aggregator(r) => r.dispatcher().stats(),
            Self::MessageDriven(r) => r.dispatcher().stats(),
        }
    }

    /// Only message-driven resources synchronize with the cluster.
    pub fn sync_stats(&self) -> Option<&Arc<SyncStats>> {
        match self {
            Self::Aggregator(_) => None,
            Self::MessageDriven(r) => Some(r.synchronizer().stats()),
        }
    }

    /// Aggregator notifications emitted since the last call.
    pub fn take_emitted(&self) -> u64 {
        match self {
            Self::Aggregator(r) => r.sender().take_emitted(),
            Self::MessageDriven(_) => 0,
        }
    }

    pub async fn connect(
        &self,
        id: &str,
        descriptor: &Descriptor,
    ) -> Result<Arc<dyn Attribute>, AttributeError> {
        match self {
            Self::Aggregator(r) => r.connect(id, descriptor).await,
            Self::MessageDriven(r) => r.connect(id, descriptor).await,
        }
    }

    pub fn disconnect(&self, id: &str) -> bool {
        self.registry().disconnect(id)
    }

    pub fn retain_only(&self, ids: &[String]) -> Vec<String> {
        self.registry().retain_only(ids)
    }

    /// Measurement transport entry point. `None` when the resource does
    /// not take transport messages.
    pub async fn handle(&self, headers: &Headers, body: &[u8]) -> Option<bool> {
        match self {
            Self::Aggregator(_) => None,
            Self::MessageDriven(r) => Some(r.handle(headers, body).await),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn NotificationListener>) -> ListenerId {
        match self {
            Self::Aggregator(r) => r.add_listener(listener),
            Self::MessageDriven(r) => r.add_listener(listener),
        }
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match self {
            Self::Aggregator(r) => r.remove_listener(id),
            Self::MessageDriven(r) => r.remove_listener(id),
        }
    }

    pub async fn get_value(&self, id: &str) -> Result<Value, AttributeError> {
        self.registry().get_value(id).await
    }

    pub fn metadata(&self) -> Vec<AttributeMetadata> {
        self.registry().metadata()
    }

    pub fn reset_metric(&self, id: &str) -> bool {
        self.registry().reset_metric(id)
    }

    pub fn reset_all_metrics(&self) -> usize {
        self.registry().reset_all_metrics()
    }

    pub fn start(&self) {
        match self {
            Self::Aggregator(r) => r.start(),
            Self::MessageDriven(r) => r.start(),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Aggregator(r) => r.close().await,
            Self::MessageDriven(r) => r.close().await,
        }
    }
}

/// Resources are readable by aggregators on the same node. Attributes are
/// computed, so writes are refused.
#[async_trait]
impl ForeignAttributeSource for Resource {
    fn name(&self) -> &str {
        Resource::name(self)
    }

    async fn get_attribute(&self, attribute: &str) -> Result<Value, AttributeError> {
        match self.get_value(attribute).await {
            Err(AttributeError::AttributeNotFound(_)) => {
                Err(crate::source::unavailable(self.name(), attribute))
            }
            other => other,
        }
    }

    async fn set_attribute(&self, attribute: &str, _value: Value) -> Result<(), AttributeError> {
        Err(AttributeError::InvalidValue(format!(
            "{}/{attribute} is read-only",
            self.name()
        )))
    }

    fn attribute_metadata(&self) -> Vec<AttributeMetadata> {
        self.metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterContext;
    use crate::descriptor::keys;
    use crate::source::SourceDirectory;

    fn message_driven() -> Resource {
        let resource =
            MessageDrivenResource::new("orders", &Descriptor::new(), &ClusterContext::local(true))
                .expect("resource");
        Resource::MessageDriven(Arc::new(resource))
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [ResourceKind::Aggregator, ResourceKind::MessageDriven] {
            assert_eq!(kind.as_str().parse::<ResourceKind>(), Ok(kind));
        }
        assert!("mbean".parse::<ResourceKind>().is_err());
    }

    #[tokio::test]
    async fn test_resource_as_foreign_source() {
        let resource = message_driven();
        resource
            .connect("latency", &Descriptor::new().with(keys::NAME, "timer"))
            .await
            .expect("connect");

        let names: Vec<String> = resource
            .attribute_metadata()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["latency".to_string()]);
        assert!(matches!(
            resource.get_attribute("latency").await,
            Ok(Value::Composite(_))
        ));
        assert_eq!(
            resource.get_attribute("missing").await,
            Err(AttributeError::ForeignAttributeUnavailable(
                "orders/missing".to_string()
            ))
        );
        assert!(resource.set_attribute("latency", Value::Int(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_aggregator_reads_message_driven_resource() {
        let cluster = ClusterContext::local(true);
        let orders = message_driven();
        orders
            .connect("hits", &Descriptor::new().with(keys::NAME, "gauge64"))
            .await
            .expect("connect");
        let directory = Arc::new(SourceDirectory::new());
        directory.register(Arc::new(orders.clone()));

        let aggregator = Resource::Aggregator(Arc::new(
            AggregatorResource::new("agg", &Descriptor::new(), Arc::clone(&directory), &cluster)
                .expect("aggregator"),
        ));
        let descriptor = Descriptor::new()
            .with(keys::NAME, "decomposer")
            .with(keys::SOURCE, "orders")
            .with(keys::FOREIGN_ATTRIBUTE, "hits")
            .with(keys::FIELD_PATH, "count");
        aggregator.connect("hitCount", &descriptor).await.expect("connect");

        let body = br#"{"kind":"valueChanged","integer":7}"#;
        assert_eq!(orders.handle(&Headers::new(), body).await, Some(true));
        assert_eq!(aggregator.handle(&Headers::new(), body).await, None);
        assert_eq!(aggregator.get_value("hitCount").await, Ok(Value::Int(1)));
        assert!(!aggregator.reset_metric("hitCount"));

        aggregator.close().await;
        orders.close().await;
        directory.unregister("orders");
    }
}
