//! Message-driven metric engine: metric-holder attributes fed by a stream
//! of measurement notifications, with cluster-wide snapshot exchange.

pub mod dsl;
pub mod extraction;
pub mod holder;
pub mod sync;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::dsl::AttributeDeclaration;
pub use self::extraction::ExtractionAttribute;
pub use self::holder::{MetricAccess, MetricHolder};
pub use self::sync::{DistributedSynchronizer, SyncReport, SyncStats, SyncStatsSnapshot};

use crate::attribute::pool::{WorkerPool, DEFAULT_WORKERS};
use crate::attribute::{declared_type, Attribute, AttributeFactory, AttributeRegistry};
use crate::cluster::ClusterContext;
use crate::descriptor::{keys, Descriptor};
use crate::error::AttributeError;
use crate::metrics::{self, now_millis, Metric, MetricKind};
use crate::notification::dispatcher::{Headers, NotificationDispatcher};
use crate::notification::listener::{
    ListenerId, ListenerInvocation, ListenerRegistry, NotificationListener,
};
use crate::notification::parse::parser_for;
use crate::notification::SourceIdentity;
use crate::value::{AttributeMetadata, Value};

/// Default period of the snapshot exchange.
pub const DEFAULT_SYNCHRONIZATION_PERIOD: Duration = Duration::from_millis(5_000);

/// Builds metric holders and extractions from DSL declarations.
pub struct MetricFactory {
    registry: Weak<AttributeRegistry>,
}

impl MetricFactory {
    /// `registry` is the registry this factory builds for; extractions
    /// resolve their source holder through it.
    pub fn new(registry: Weak<AttributeRegistry>) -> Self {
        Self { registry }
    }

    fn holder<M: Metric>(
        name: &str,
        descriptor: &Descriptor,
        metric: M,
    ) -> Result<Arc<dyn Attribute>, AttributeError> {
        Ok(Arc::new(MetricHolder::new(name, descriptor, metric)?))
    }

    fn metric_holder(
        name: &str,
        descriptor: &Descriptor,
        kind: MetricKind,
    ) -> Result<Arc<dyn Attribute>, AttributeError> {
        let now = now_millis();
        match kind {
            MetricKind::Gauge64 => Self::holder(name, descriptor, metrics::Gauge::<i64>::new(now)),
            MetricKind::GaugeFP => Self::holder(name, descriptor, metrics::Gauge::<f64>::new(now)),
            MetricKind::Timer => Self::holder(name, descriptor, metrics::Timer::new(now)),
            MetricKind::Rate => Self::holder(name, descriptor, metrics::Rate::new(now)),
            MetricKind::Flag => Self::holder(name, descriptor, metrics::Flag::new(now)),
            MetricKind::StringGauge => {
                Self::holder(name, descriptor, metrics::StringGauge::new(now))
            }
            MetricKind::RangedGauge64 => {
                let metric = metrics::RangedGauge::<i64>::new(
                    descriptor.parse(keys::RANGE_START)?,
                    descriptor.parse(keys::RANGE_END)?,
                    now,
                )?;
                Self::holder(name, descriptor, metric)
            }
            MetricKind::RangedGaugeFP => {
                let metric = metrics::RangedGauge::<f64>::new(
                    descriptor.parse(keys::RANGE_START)?,
                    descriptor.parse(keys::RANGE_END)?,
                    now,
                )?;
                Self::holder(name, descriptor, metric)
            }
            MetricKind::RangedTimer => {
                let metric = metrics::RangedTimer::new(
                    descriptor.parse(keys::RANGE_START)?,
                    descriptor.parse(keys::RANGE_END)?,
                    now,
                )?;
                Self::holder(name, descriptor, metric)
            }
            MetricKind::Arrivals => {
                let metric = metrics::Arrivals::new(descriptor.parse_or(keys::CHANNELS, 1)?, now)?;
                Self::holder(name, descriptor, metric)
            }
            MetricKind::NotificationRate => {
                Self::holder(name, descriptor, metrics::NotificationRate::new(now))
            }
        }
    }
}

#[async_trait]
impl AttributeFactory for MetricFactory {
    async fn create(
        &self,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<Arc<dyn Attribute>, AttributeError> {
        match AttributeDeclaration::parse(declared_type(name, descriptor))? {
            AttributeDeclaration::Metric(kind) => Self::metric_holder(name, descriptor, kind),
            AttributeDeclaration::Extraction {
                extractor,
                metric_kind,
                source,
            } => Ok(Arc::new(ExtractionAttribute::new(
                name,
                descriptor,
                extractor,
                metric_kind,
                source,
                Weak::clone(&self.registry),
            ))),
        }
    }
}

/// Typed parameters of a message-driven resource.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDrivenConfig {
    /// Component the resource accepts measurements from.
    pub component: SourceIdentity,
    pub synchronization_period: Duration,
    pub parser_language: String,
    pub parser_script: Option<String>,
    pub workers: usize,
    pub listener_invocation: ListenerInvocation,
}

impl MessageDrivenConfig {
    pub fn from_descriptor(resource: &str, params: &Descriptor) -> Result<Self, AttributeError> {
        let synchronization_period =
            params.millis_or(keys::SYNCHRONIZATION_PERIOD, DEFAULT_SYNCHRONIZATION_PERIOD)?;
        if synchronization_period.is_zero() {
            return Err(AttributeError::invalid_parameter(
                keys::SYNCHRONIZATION_PERIOD,
                "must be positive",
            ));
        }

        Ok(Self {
            component: SourceIdentity::new(
                params.get_or_default(keys::COMPONENT_NAME, resource),
                params.get_or_default(keys::COMPONENT_INSTANCE, ""),
            ),
            synchronization_period,
            parser_language: params.get_or_default(keys::PARSER_LANGUAGE, "json").to_string(),
            parser_script: params.get(keys::PARSER_SCRIPT).ok().map(str::to_string),
            workers: params.parse_or(keys::WORKERS, DEFAULT_WORKERS)?,
            listener_invocation: params
                .parse_or(keys::LISTENER_INVOCATION, ListenerInvocation::default())?,
        })
    }
}

/// A resource whose attributes are metrics computed from measurement
/// notifications delivered by a transport.
pub struct MessageDrivenResource {
    name: String,
    config: MessageDrivenConfig,
    registry: Arc<AttributeRegistry>,
    dispatcher: NotificationDispatcher,
    synchronizer: Arc<DistributedSynchronizer>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageDrivenResource {
    pub fn new(
        name: &str,
        params: &Descriptor,
        cluster: &ClusterContext,
    ) -> Result<Self, AttributeError> {
        let config = MessageDrivenConfig::from_descriptor(name, params)?;
        let parser = parser_for(&config.parser_language, config.parser_script.as_deref())
            .map_err(|e| AttributeError::invalid_parameter(keys::PARSER_SCRIPT, e.to_string()))?;

        let pool = Arc::new(WorkerPool::new(config.workers));
        let registry = Arc::new_cyclic(|weak| {
            AttributeRegistry::new(
                name,
                Arc::new(MetricFactory::new(Weak::clone(weak))),
                Arc::clone(&pool),
            )
        });
        let listeners = Arc::new(ListenerRegistry::new(config.listener_invocation, pool));
        let dispatcher = NotificationDispatcher::new(
            config.component.clone(),
            parser,
            Arc::clone(&cluster.counter),
            Arc::clone(&registry),
            Arc::clone(&listeners),
        );
        listeners.add_listener(Arc::clone(dispatcher.stats()) as Arc<dyn NotificationListener>);

        let synchronizer = Arc::new(DistributedSynchronizer::new(
            Arc::clone(&registry),
            Arc::clone(&cluster.store),
            config.synchronization_period,
        ));

        Ok(Self {
            name: name.to_string(),
            config,
            registry,
            dispatcher,
            synchronizer,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MessageDrivenConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AttributeRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn synchronizer(&self) -> &Arc<DistributedSynchronizer> {
        &self.synchronizer
    }

    pub async fn connect(
        &self,
        id: &str,
        descriptor: &Descriptor,
    ) -> Result<Arc<dyn Attribute>, AttributeError> {
        self.registry.connect(id, descriptor).await
    }

    pub fn disconnect(&self, id: &str) -> bool {
        self.registry.disconnect(id)
    }

    pub fn retain_only<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.retain_only(ids)
    }

    /// Measurement transport entry point.
    pub async fn handle(&self, headers: &Headers, body: &[u8]) -> bool {
        self.dispatcher.handle(headers, body).await
    }

    pub fn add_listener(&self, listener: Arc<dyn NotificationListener>) -> ListenerId {
        self.dispatcher.listeners().add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.listeners().remove_listener(id)
    }

    pub async fn get_value(&self, id: &str) -> Result<Value, AttributeError> {
        self.registry.get_value(id).await
    }

    pub fn metadata(&self) -> Vec<AttributeMetadata> {
        self.registry.metadata()
    }

    pub fn reset_metric(&self, id: &str) -> bool {
        self.registry.reset_metric(id)
    }

    pub fn reset_all_metrics(&self) -> usize {
        self.registry.reset_all_metrics()
    }

    /// Starts the periodic snapshot exchange.
    pub fn start(&self) {
        let handle = Arc::clone(&self.synchronizer).spawn(self.cancel.clone());
        self.tasks.lock().push(handle);
        info!(
            resource = %self.name,
            period = ?self.config.synchronization_period,
            "synchronizer started",
        );
    }

    /// Stops the synchronizer, drains in-flight fan-out and closes every
    /// attribute.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(
                    resource = %self.name,
                    error = %e,
                    "synchronizer task ended abnormally",
                );
            }
        }
        self.registry.close().await;
    }
}
