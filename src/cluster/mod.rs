//! Cluster collaborators: sequence counter, snapshot store and leadership.
//!
//! The engine only talks to these traits. The in-process implementations
//! below serve single-node deployments and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::metrics::MetricSnapshot;

/// Snapshot of one metric holder, as exchanged through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Epoch ms of the last update applied to the metric.
    pub last_update_ms: u64,
    pub metric: MetricSnapshot,
}

/// Cluster-wide monotonic counter.
#[async_trait]
pub trait DistributedCounter: Send + Sync {
    /// Returns a value strictly greater than every value returned before.
    async fn next_value(&self) -> Result<u64, ClusterError>;
}

/// Cluster-wide key-value store that merges snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Offers the local snapshot and returns the authoritative merged one.
    async fn exchange(&self, key: &str, local: Snapshot) -> Result<Snapshot, ClusterError>;
}

/// Reports whether this node currently emits periodic notifications.
pub trait LeadershipOracle: Send + Sync {
    fn is_active_node(&self) -> bool;
}

/// Collaborators shared by every resource on a node.
#[derive(Clone)]
pub struct ClusterContext {
    pub counter: Arc<dyn DistributedCounter>,
    pub store: Arc<dyn SnapshotStore>,
    pub leadership: Arc<dyn LeadershipOracle>,
}

impl ClusterContext {
    /// Single-node context backed by the in-process implementations.
    pub fn local(active: bool) -> Self {
        Self {
            counter: Arc::new(LocalCounter::new()),
            store: Arc::new(InMemorySnapshotStore::new()),
            leadership: Arc::new(StaticLeadership::new(active)),
        }
    }
}

/// Atomic counter for a single node.
#[derive(Debug, Default)]
pub struct LocalCounter {
    next: AtomicU64,
}

impl LocalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter that continues after `last`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            next: AtomicU64::new(last),
        }
    }
}

#[async_trait]
impl DistributedCounter for LocalCounter {
    async fn next_value(&self) -> Result<u64, ClusterError> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .map(|previous| previous + 1)
            .map_err(|_| ClusterError::CounterUnavailable("counter exhausted".to_string()))
    }
}

/// Snapshot store that keeps the freshest snapshot per key.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    entries: DashMap<String, Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Snapshot> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn exchange(&self, key: &str, local: Snapshot) -> Result<Snapshot, ClusterError> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| local.clone());
        if local.last_update_ms > entry.last_update_ms {
            *entry = local;
        }
        Ok(entry.value().clone())
    }
}

/// Leadership fixed at startup, switchable for tests and manual failover.
#[derive(Debug)]
pub struct StaticLeadership {
    active: AtomicBool,
}

impl StaticLeadership {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

impl LeadershipOracle for StaticLeadership {
    fn is_active_node(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}
