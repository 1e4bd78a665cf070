//! Computed attributes and the per-resource registry that owns them.

pub mod pool;

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use self::pool::WorkerPool;
use crate::descriptor::{keys, Descriptor};
use crate::engine::MetricAccess;
use crate::error::AttributeError;
use crate::notification::MeasurementNotification;
use crate::value::{AttributeMetadata, Value};

/// A named, independently-lifecycled computed value.
#[async_trait]
pub trait Attribute: Send + Sync {
    fn name(&self) -> &str;

    fn descriptor(&self) -> &Descriptor;

    fn metadata(&self) -> AttributeMetadata;

    async fn get_value(&self) -> Result<Value, AttributeError>;

    /// Applies a notification. Returns whether the attribute used it.
    fn accept(&self, _notification: &MeasurementNotification) -> Result<bool, AttributeError> {
        Ok(false)
    }

    /// Snapshot/reset access for attributes backed by a metric.
    fn as_metric(&self) -> Option<&dyn MetricAccess> {
        None
    }

    fn close(&self);
}

/// Builds attributes from their descriptors.
#[async_trait]
pub trait AttributeFactory: Send + Sync {
    async fn create(
        &self,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<Arc<dyn Attribute>, AttributeError>;
}

/// Declared type of an attribute: the descriptor's `name`, or the id itself.
pub fn declared_type<'a>(id: &'a str, descriptor: &'a Descriptor) -> &'a str {
    descriptor.get_or_default(keys::NAME, id)
}

/// Outcome of one notification fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Attributes that applied the notification.
    pub applied: usize,
    /// Attributes that ignored it.
    pub ignored: usize,
    /// Attributes whose `accept` failed or panicked.
    pub failed: usize,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.applied + self.ignored + self.failed
    }
}

/// Keyed collection of computed attributes for one resource.
pub struct AttributeRegistry {
    resource: String,
    attributes: DashMap<String, Arc<dyn Attribute>>,
    factory: Arc<dyn AttributeFactory>,
    pool: Arc<WorkerPool>,
    closed: AtomicBool,
}

impl AttributeRegistry {
    pub fn new(
        resource: impl Into<String>,
        factory: Arc<dyn AttributeFactory>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            resource: resource.into(),
            attributes: DashMap::new(),
            factory,
            pool,
            closed: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Builds and registers an attribute.
    ///
    /// On failure the registry is left as it was for `id`. A successful
    /// connect over an existing id replaces and closes the old attribute.
    pub async fn connect(
        &self,
        id: &str,
        descriptor: &Descriptor,
    ) -> Result<Arc<dyn Attribute>, AttributeError> {
        if self.is_closed() {
            return Err(AttributeError::Closed(self.resource.clone()));
        }

        let attribute = match self.factory.create(id, descriptor).await {
            Ok(attribute) => attribute,
            Err(e) => {
                warn!(
                    resource = %self.resource,
                    attribute = %id,
                    error = %e,
                    "attribute construction failed",
                );
                return Err(e);
            }
        };

        if let Some(previous) = self
            .attributes
            .insert(id.to_string(), Arc::clone(&attribute))
        {
            previous.close();
            debug!(resource = %self.resource, attribute = %id, "replaced attribute");
        } else {
            info!(
                resource = %self.resource,
                attribute = %id,
                kind = declared_type(id, descriptor),
                "attribute connected",
            );
        }

        Ok(attribute)
    }

    /// Removes and closes one attribute. Returns false if it was absent.
    pub fn disconnect(&self, id: &str) -> bool {
        match self.attributes.remove(id) {
            Some((_, attribute)) => {
                attribute.close();
                info!(resource = %self.resource, attribute = %id, "attribute disconnected");
                true
            }
            None => false,
        }
    }

    /// Removes and closes every attribute whose id is not in `ids`.
    /// Returns the removed ids, sorted.
    pub fn retain_only<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keep: HashSet<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        let mut removed: Vec<String> = self
            .attributes
            .iter()
            .filter(|e| !keep.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        removed.retain(|id| self.disconnect(id));
        removed.sort();
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Attribute>> {
        self.attributes.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.attributes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Registered ids, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attributes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Registered attributes, sorted by id.
    pub fn attributes(&self) -> Vec<Arc<dyn Attribute>> {
        let mut attributes: Vec<Arc<dyn Attribute>> = self
            .attributes
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        attributes.sort_by(|a, b| a.name().cmp(b.name()));
        attributes
    }

    pub fn metadata(&self) -> Vec<AttributeMetadata> {
        self.attributes().iter().map(|a| a.metadata()).collect()
    }

    pub async fn get_value(&self, id: &str) -> Result<Value, AttributeError> {
        let attribute = self
            .get(id)
            .ok_or_else(|| AttributeError::AttributeNotFound(id.to_string()))?;
        attribute.get_value().await
    }

    /// Fans a notification out to every attribute on the worker pool.
    ///
    /// A failing or panicking `accept` is logged and counted; the other
    /// attributes still receive the notification.
    pub async fn dispatch(&self, notification: Arc<MeasurementNotification>) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.is_closed() {
            return report;
        }

        let mut tasks = JoinSet::new();
        for attribute in self.attributes() {
            let Ok(permit) = self.pool.acquire().await else {
                debug!(resource = %self.resource, "worker pool shut down during dispatch");
                break;
            };
            let notification = Arc::clone(&notification);
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = catch_unwind(AssertUnwindSafe(|| attribute.accept(&notification)));
                (attribute, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(true)))) => report.applied += 1,
                Ok((_, Ok(Ok(false)))) => report.ignored += 1,
                Ok((attribute, Ok(Err(e)))) => {
                    warn!(
                        resource = %self.resource,
                        attribute = %attribute.name(),
                        error = %e,
                        "attribute failed to accept notification",
                    );
                    report.failed += 1;
                }
                Ok((attribute, Err(_))) => {
                    error!(
                        resource = %self.resource,
                        attribute = %attribute.name(),
                        "attribute panicked while accepting notification",
                    );
                    report.failed += 1;
                }
                Err(e) => {
                    error!(resource = %self.resource, error = %e, "fan-out task failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Resets one metric holder. False if absent or not metric-backed.
    pub fn reset_metric(&self, id: &str) -> bool {
        self.get(id)
            .is_some_and(|attribute| attribute.as_metric().is_some_and(|m| m.reset()))
    }

    /// Resets every metric holder. Returns how many were reset.
    pub fn reset_all_metrics(&self) -> usize {
        self.attributes()
            .iter()
            .filter(|attribute| attribute.as_metric().is_some_and(|m| m.reset()))
            .count()
    }

    /// Drains in-flight fan-out, shuts the pool down and closes every
    /// attribute. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.pool.shutdown().await;

        let ids: Vec<String> = self.attributes.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for id in ids {
            if let Some((_, attribute)) = self.attributes.remove(&id) {
                attribute.close();
                closed += 1;
            }
        }

        info!(resource = %self.resource, attributes = closed, "attribute registry closed");
    }
}
