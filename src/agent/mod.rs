use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatorResource;
use crate::cluster::ClusterContext;
use crate::config::{Config, ResourceConfig};
use crate::engine::MessageDrivenResource;
use crate::export::api::{ApiServer, ApiState};
use crate::export::health::HealthMetrics;
use crate::resource::{Resource, ResourceKind};
use crate::source::{SourceDirectory, StaticSource};

/// Agent orchestrates all components: foreign sources, resources, their
/// timers, the health server and the API server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    directory: Arc<SourceDirectory>,
    cluster: ClusterContext,
    resources: Vec<Resource>,
    api: Option<ApiServer>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics and the
    /// in-process cluster collaborators.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let cluster = ClusterContext::local(cfg.active_node);

        Ok(Self {
            cfg,
            health,
            directory: Arc::new(SourceDirectory::new()),
            cluster,
            resources: Vec::new(),
            api: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name() == name)
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so health checks respond.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Static foreign sources.
        for (name, values) in &self.cfg.sources {
            let source = StaticSource::from_yaml(name, values)
                .with_context(|| format!("building source {name}"))?;
            self.directory.register(Arc::new(source));
            info!(source = %name, attributes = values.len(), "foreign source registered");
        }

        // 2. Resources. Every resource is registered as a foreign source
        //    before any attribute connects, so declaration order does not
        //    matter.
        for resource_cfg in &self.cfg.resources {
            let resource = self.build_resource(resource_cfg)?;
            self.directory.register(Arc::new(resource.clone()));
            self.resources.push(resource);
        }

        // 3. Attributes and events. Failures keep one attribute from going
        //    live and are never fatal.
        for (resource_cfg, resource) in self.cfg.resources.iter().zip(&self.resources) {
            self.connect_attributes(resource_cfg, resource).await;
            self.health
                .attributes_connected
                .with_label_values(&[resource.name()])
                .set(resource.registry().len() as f64);
        }

        // 4. Timers.
        for resource in &self.resources {
            resource.start();
        }

        // 5. API server.
        let api = ApiServer::new(
            &self.cfg.api.addr,
            Arc::new(ApiState::new(self.resources.iter().cloned())),
        );
        api.start().await.context("starting api server")?;
        self.api = Some(api);

        self.spawn_stats_reporter();

        info!(
            node = %self.cfg.node_id,
            active = self.cfg.active_node,
            resources = self.resources.len(),
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal background tasks to stop.
        self.cancel.cancel();

        // Stop taking transport messages before resources close.
        if let Some(api) = &self.api {
            if let Err(e) = api.stop().await {
                error!(error = %e, "error stopping api server");
            }
        }

        for resource in &self.resources {
            resource.close().await;
            // Resources hold the directory; unregistering breaks the cycle.
            self.directory.unregister(resource.name());
            info!(resource = %resource.name(), "resource closed");
        }

        self.health.stop().await?;

        Ok(())
    }

    fn build_resource(&self, cfg: &ResourceConfig) -> Result<Resource> {
        let resource = match cfg.kind {
            ResourceKind::Aggregator => {
                Resource::Aggregator(Arc::new(
                    AggregatorResource::new(
                        &cfg.name,
                        &cfg.parameters,
                        Arc::clone(&self.directory),
                        &self.cluster,
                    )
                    .with_context(|| format!("creating aggregator {}", cfg.name))?,
                ))
            }
            ResourceKind::MessageDriven => Resource::MessageDriven(Arc::new(
                MessageDrivenResource::new(&cfg.name, &cfg.parameters, &self.cluster)
                    .with_context(|| format!("creating message-driven resource {}", cfg.name))?,
            )),
        };
        info!(resource = %cfg.name, kind = %cfg.kind, "resource created");
        Ok(resource)
    }

    async fn connect_attributes(&self, cfg: &ResourceConfig, resource: &Resource) {
        let failures = self
            .health
            .attribute_connect_failures
            .with_label_values(&[resource.name()]);

        for (id, descriptor) in &cfg.attributes {
            // Construction failures are logged by the registry.
            if resource.connect(id, descriptor).await.is_err() {
                failures.inc();
            }
        }

        if let Resource::Aggregator(aggregator) = resource {
            for (id, descriptor) in &cfg.events {
                if aggregator.enable_event(id, descriptor).is_err() {
                    failures.inc();
                }
            }
        }
    }

    /// Spawn background statistics reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let resources = self.resources.clone();
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        for resource in &resources {
                            report_resource(&health, resource);
                        }
                    }
                }
            }
        });
    }
}

/// Drains one resource's statistics into the health metrics.
fn report_resource(health: &HealthMetrics, resource: &Resource) {
    let name = resource.name();

    let stats = resource.notification_stats().snapshot();
    health.record_notifications(name, &stats);

    if let Some(sync) = resource.sync_stats() {
        let sync = sync.snapshot();
        health.record_sync(name, &sync);
        if sync.failures > 0 {
            warn!(resource = %name, failures = sync.failures, "snapshot exchanges failed");
        }
    }

    let emitted = resource.take_emitted();
    health
        .aggregator_notifications_emitted
        .with_label_values(&[name])
        .inc_by(emitted as f64);
    health
        .attributes_connected
        .with_label_values(&[name])
        .set(resource.registry().len() as f64);

    if stats.received > 0 || stats.delivered_total() > 0 {
        info!(
            resource = %name,
            received = stats.received,
            dropped = stats.dropped,
            delivered = stats.delivered_total(),
            "notification stats",
        );
    }
    for (kind, count) in &stats.delivered {
        debug!(resource = %name, kind = %kind, count, "  by kind");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::descriptor::{keys, Descriptor};
    use crate::value::Value;

    fn config() -> Config {
        let mut jvm = BTreeMap::new();
        jvm.insert("threads".to_string(), serde_yaml::from_str("42").expect("yaml"));
        let mut sources = BTreeMap::new();
        sources.insert("jvm".to_string(), jvm);

        let mut summary_attributes = BTreeMap::new();
        summary_attributes.insert(
            "busy".to_string(),
            Descriptor::new()
                .with(keys::NAME, "comparisonWith")
                .with(keys::SOURCE, "jvm")
                .with(keys::FOREIGN_ATTRIBUTE, "threads")
                .with(keys::COMPARER, ">")
                .with(keys::VALUE, "10"),
        );
        summary_attributes.insert(
            "hits".to_string(),
            Descriptor::new()
                .with(keys::NAME, "stringifier")
                .with(keys::SOURCE, "orders")
                .with(keys::FOREIGN_ATTRIBUTE, "count"),
        );
        summary_attributes.insert(
            "broken".to_string(),
            Descriptor::new()
                .with(keys::NAME, "comparisonWith")
                .with(keys::SOURCE, "jvm"),
        );

        let mut orders_attributes = BTreeMap::new();
        orders_attributes.insert(
            "count".to_string(),
            Descriptor::new().with(keys::NAME, "gauge64"),
        );

        let mut cfg = Config {
            sources,
            resources: vec![
                // Declared before the resource it reads from.
                ResourceConfig {
                    name: "summary".to_string(),
                    kind: ResourceKind::Aggregator,
                    parameters: Descriptor::new(),
                    attributes: summary_attributes,
                    events: BTreeMap::new(),
                },
                ResourceConfig {
                    name: "orders".to_string(),
                    kind: ResourceKind::MessageDriven,
                    parameters: Descriptor::new(),
                    attributes: orders_attributes,
                    events: BTreeMap::new(),
                },
            ],
            ..Default::default()
        };
        cfg.health.addr = "127.0.0.1:0".to_string();
        cfg.api.addr = "127.0.0.1:0".to_string();
        cfg
    }

    #[tokio::test]
    async fn test_agent_start_and_stop() {
        let mut agent = Agent::new(config()).expect("agent");
        agent.start().await.expect("start");

        let summary = agent.resource("summary").expect("summary").clone();
        assert_eq!(summary.get_value("busy").await, Ok(Value::Bool(true)));
        assert!(summary.registry().contains("hits"));
        assert!(!summary.registry().contains("broken"));

        let text = agent.health().render().expect("render");
        assert!(text.contains(
            "mgmt_aggregator_attribute_connect_failures_total{resource=\"summary\"} 1"
        ));
        assert!(text.contains("mgmt_aggregator_attributes_connected{resource=\"summary\"} 2"));

        agent.stop().await.expect("stop");
        assert!(summary.registry().is_closed());
    }

    #[tokio::test]
    async fn test_report_resource_drains_stats() {
        let mut agent = Agent::new(config()).expect("agent");
        agent.start().await.expect("start");

        let orders = agent.resource("orders").expect("orders").clone();
        let body = br#"{"kind":"valueChanged","integer":3}"#;
        assert_eq!(
            orders
                .handle(&crate::notification::dispatcher::Headers::new(), body)
                .await,
            Some(true)
        );

        report_resource(agent.health(), &orders);
        let text = agent.health().render().expect("render");
        assert!(text.contains("mgmt_aggregator_notifications_received_total{resource=\"orders\"} 1"));
        assert_eq!(orders.notification_stats().snapshot().received, 0);

        agent.stop().await.expect("stop");
    }
}
