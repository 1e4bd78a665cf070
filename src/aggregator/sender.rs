use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attribute::declared_type;
use crate::cluster::LeadershipOracle;
use crate::descriptor::{keys, Descriptor};
use crate::error::AttributeError;
use crate::notification::dispatcher::NotificationDispatcher;
use crate::notification::{Measurement, MeasurementNotification, SourceIdentity};
use crate::source::{ForeignAttributeSource, SourceDirectory};

/// Event type that periodically publishes a foreign attribute's value.
pub const PERIODIC_ATTRIBUTE_QUERY: &str = "periodicAttributeQuery";

/// One configured periodic query.
pub struct QueryEvent {
    id: String,
    source: Arc<dyn ForeignAttributeSource>,
    attribute: String,
}

impl QueryEvent {
    pub fn new(
        id: &str,
        descriptor: &Descriptor,
        directory: &SourceDirectory,
    ) -> Result<Self, AttributeError> {
        let kind = declared_type(id, descriptor);
        if kind != PERIODIC_ATTRIBUTE_QUERY {
            return Err(AttributeError::UnrecognizedAttributeType(kind.to_string()));
        }
        let source_name = descriptor.get(keys::SOURCE)?;
        let attribute = descriptor.get(keys::FOREIGN_ATTRIBUTE)?.to_string();
        Ok(Self {
            id: id.to_string(),
            source: directory.resolve(source_name)?,
            attribute,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Emits the values of an aggregator's periodic queries through its
/// dispatcher, on the active node only.
pub struct PeriodicSender {
    resource: String,
    events: RwLock<BTreeMap<String, Arc<QueryEvent>>>,
    dispatcher: Arc<NotificationDispatcher>,
    leadership: Arc<dyn LeadershipOracle>,
    frequency: Duration,
    read_timeout: Duration,
    emitted: AtomicU64,
}

impl PeriodicSender {
    pub fn new(
        resource: &str,
        dispatcher: Arc<NotificationDispatcher>,
        leadership: Arc<dyn LeadershipOracle>,
        frequency: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            events: RwLock::new(BTreeMap::new()),
            dispatcher,
            leadership,
            frequency,
            read_timeout,
            emitted: AtomicU64::new(0),
        }
    }

    pub fn add_event(&self, event: QueryEvent) {
        self.events
            .write()
            .insert(event.id.clone(), Arc::new(event));
    }

    pub fn remove_event(&self, id: &str) -> bool {
        self.events.write().remove(id).is_some()
    }

    /// Drops every event whose id is not in `ids`. Returns the removed ids.
    pub fn retain_events(&self, ids: &[String]) -> Vec<String> {
        let mut events = self.events.write();
        let removed: Vec<String> = events
            .keys()
            .filter(|id| !ids.contains(id))
            .cloned()
            .collect();
        for id in &removed {
            events.remove(id);
        }
        removed
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.events.read().keys().cloned().collect()
    }

    /// Notifications emitted since the last call.
    pub fn take_emitted(&self) -> u64 {
        self.emitted.swap(0, Ordering::Relaxed)
    }

    /// Reads every event's attribute and delivers one notification each.
    /// Returns how many were delivered.
    pub async fn emit_once(&self) -> usize {
        if !self.leadership.is_active_node() {
            debug!(resource = %self.resource, "inactive node, periodic emission suspended");
            return 0;
        }

        let events: Vec<Arc<QueryEvent>> = self.events.read().values().cloned().collect();
        let mut delivered = 0;
        for event in events {
            let read = tokio::time::timeout(
                self.read_timeout,
                event.source.get_attribute(&event.attribute),
            )
            .await;
            let value = match read {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => {
                    warn!(resource = %self.resource, event = %event.id, error = %e, "periodic query failed");
                    continue;
                }
                Err(_) => {
                    warn!(resource = %self.resource, event = %event.id, "periodic query timed out");
                    continue;
                }
            };

            let notification = MeasurementNotification::new(
                SourceIdentity::new(&self.resource, &event.id),
                Measurement::from_value(&value),
            )
            .with_message(format!("{}/{}", event.source.name(), event.attribute));
            if self.dispatcher.deliver(notification).await.is_some() {
                delivered += 1;
            }
        }

        self.emitted.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.frequency;
            let mut ticker = tokio::time::interval_at(start, self.frequency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        self.emit_once().await;
                    }
                }
            }
        })
    }
}
