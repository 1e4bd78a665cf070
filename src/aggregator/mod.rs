//! Aggregator: attributes derived from the attributes of other resources,
//! plus periodic events publishing foreign values as notifications.

pub mod attribute;
pub mod composer;
pub mod sender;
pub mod strategy;
pub mod window;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::attribute::{AggregateAttribute, AggregationType, AggregatorFactory};
pub use self::sender::{PeriodicSender, QueryEvent, PERIODIC_ATTRIBUTE_QUERY};

use crate::attribute::pool::{WorkerPool, DEFAULT_WORKERS};
use crate::attribute::{Attribute, AttributeRegistry};
use crate::cluster::ClusterContext;
use crate::descriptor::{keys, Descriptor};
use crate::error::AttributeError;
use crate::notification::dispatcher::NotificationDispatcher;
use crate::notification::listener::{
    ListenerId, ListenerInvocation, ListenerRegistry, NotificationListener,
};
use crate::notification::parse::JsonParser;
use crate::notification::SourceIdentity;
use crate::source::SourceDirectory;
use crate::value::{AttributeMetadata, Value};

pub const DEFAULT_NOTIFICATION_FREQUENCY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Typed parameters of an aggregator resource.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub notification_frequency: Duration,
    pub read_timeout: Duration,
    pub workers: usize,
    pub listener_invocation: ListenerInvocation,
}

impl AggregatorConfig {
    pub fn from_descriptor(params: &Descriptor) -> Result<Self, AttributeError> {
        let notification_frequency =
            params.millis_or(keys::NOTIFICATION_FREQUENCY, DEFAULT_NOTIFICATION_FREQUENCY)?;
        if notification_frequency.is_zero() {
            return Err(AttributeError::invalid_parameter(
                keys::NOTIFICATION_FREQUENCY,
                "must be positive",
            ));
        }
        Ok(Self {
            notification_frequency,
            read_timeout: params.millis_or(keys::READ_TIMEOUT, DEFAULT_READ_TIMEOUT)?,
            workers: params.parse_or(keys::WORKERS, DEFAULT_WORKERS)?,
            listener_invocation: params
                .parse_or(keys::LISTENER_INVOCATION, ListenerInvocation::default())?,
        })
    }
}

/// A resource whose attributes are computed from foreign attributes.
pub struct AggregatorResource {
    name: String,
    config: AggregatorConfig,
    directory: Arc<SourceDirectory>,
    registry: Arc<AttributeRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    sender: Arc<PeriodicSender>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AggregatorResource {
    pub fn new(
        name: &str,
        params: &Descriptor,
        directory: Arc<SourceDirectory>,
        cluster: &ClusterContext,
    ) -> Result<Self, AttributeError> {
        let config = AggregatorConfig::from_descriptor(params)?;
        let pool = Arc::new(WorkerPool::new(config.workers));
        let registry = Arc::new(AttributeRegistry::new(
            name,
            Arc::new(AggregatorFactory::new(
                name,
                Arc::clone(&directory),
                config.read_timeout,
            )),
            Arc::clone(&pool),
        ));
        let listeners = Arc::new(ListenerRegistry::new(config.listener_invocation, pool));
        // Aggregators only emit through `deliver`; the parser serves the
        // shared dispatcher contract.
        let dispatcher = Arc::new(NotificationDispatcher::new(
            SourceIdentity::new(name, ""),
            Arc::new(JsonParser),
            Arc::clone(&cluster.counter),
            Arc::clone(&registry),
            Arc::clone(&listeners),
        ));
        listeners.add_listener(Arc::clone(dispatcher.stats()) as Arc<dyn NotificationListener>);

        let sender = Arc::new(PeriodicSender::new(
            name,
            Arc::clone(&dispatcher),
            Arc::clone(&cluster.leadership),
            config.notification_frequency,
            config.read_timeout,
        ));

        Ok(Self {
            name: name.to_string(),
            config,
            directory,
            registry,
            dispatcher,
            sender,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AttributeRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn sender(&self) -> &Arc<PeriodicSender> {
        &self.sender
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

    /// Registers a periodic event. Failures are logged and leave the event
    /// set unchanged.
    pub fn enable_event(&self, id: &str, descriptor: &Descriptor) -> Result<(), AttributeError> {
        match QueryEvent::new(id, descriptor, &self.directory) {
            Ok(event) => {
                self.sender.add_event(event);
                info!(resource = %self.name, event = %id, "event enabled");
                Ok(())
            }
            Err(e) => {
                warn!(resource = %self.name, event = %id, error = %e, "event construction failed");
                Err(e)
            }
        }
    }

    pub fn disable_event(&self, id: &str) -> bool {
        self.sender.remove_event(id)
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

    /// Starts the periodic sender.
    pub fn start(&self) {
        let handle = Arc::clone(&self.sender).spawn(self.cancel.clone());
        self.tasks.lock().push(handle);
        info!(
            resource = %self.name,
            frequency = ?self.config.notification_frequency,
            "periodic sender started",
        );
    }

    /// Stops the sender, drains in-flight fan-out and closes every attribute.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(
                    resource = %self.name,
                    error = %e,
                    "periodic sender task ended abnormally",
                );
            }
        }
        self.registry.close().await;
    }
}
