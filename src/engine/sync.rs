use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attribute::AttributeRegistry;
use crate::cluster::SnapshotStore;

/// Lock-free synchronization counters.
///
/// `snapshot()` atomically reads and resets all counters.
#[derive(Debug, Default)]
pub struct SyncStats {
    exchanges: AtomicU64,
    loads: AtomicU64,
    failures: AtomicU64,
}

/// Counter values drained by [`SyncStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub exchanges: u64,
    pub loads: u64,
    pub failures: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, report: &SyncReport) {
        self.exchanges
            .fetch_add(report.exchanged as u64, Ordering::Relaxed);
        self.loads.fetch_add(report.loaded as u64, Ordering::Relaxed);
        self.failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            exchanges: self.exchanges.swap(0, Ordering::Relaxed),
            loads: self.loads.swap(0, Ordering::Relaxed),
            failures: self.failures.swap(0, Ordering::Relaxed),
        }
    }
}

/// Outcome of one synchronization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Snapshots exchanged with the store.
    pub exchanged: usize,
    /// Holders whose metric was replaced by the merged snapshot.
    pub loaded: usize,
    /// Exchanges that failed; retried on the next tick.
    pub failed: usize,
}

/// Store key of one attribute's snapshot.
pub fn snapshot_key(resource: &str, attribute: &str) -> String {
    format!("{resource}/{attribute}")
}

/// Periodically exchanges every metric holder's snapshot with the cluster
/// store and loads back whatever the store reports as authoritative.
pub struct DistributedSynchronizer {
    registry: Arc<AttributeRegistry>,
    store: Arc<dyn SnapshotStore>,
    period: Duration,
    stats: Arc<SyncStats>,
}

impl DistributedSynchronizer {
    pub fn new(
        registry: Arc<AttributeRegistry>,
        store: Arc<dyn SnapshotStore>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            period,
            stats: Arc::new(SyncStats::new()),
        }
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    /// Runs one exchange over every open metric holder.
    pub async fn synchronize_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let resource = self.registry.resource();

        for attribute in self.registry.attributes() {
            let Some(metric) = attribute.as_metric() else {
                continue;
            };
            let Some(local) = metric.take_snapshot() else {
                continue;
            };

            let key = snapshot_key(resource, attribute.name());
            match self.store.exchange(&key, local.clone()).await {
                Ok(merged) => {
                    report.exchanged += 1;
                    if merged != local && metric.load_from_snapshot(&merged) {
                        report.loaded += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        resource = %resource,
                        attribute = %attribute.name(),
                        error = %e,
                        "snapshot exchange failed",
                    );
                    report.failed += 1;
                }
            }
        }

        self.stats.record(&report);
        report
    }

    /// Spawns the periodic synchronization loop.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.period;
            let mut ticker = tokio::time::interval_at(start, self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let report = self.synchronize_once().await;
                        debug!(
                            resource = %self.registry.resource(),
                            exchanged = report.exchanged,
                            loaded = report.loaded,
                            failed = report.failed,
                            "synchronization pass",
                        );
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::cluster::{InMemorySnapshotStore, Snapshot};
    use crate::error::ClusterError;

    struct FailingStore;

    #[async_trait]
    impl SnapshotStore for FailingStore {
        async fn exchange(&self, key: &str, _local: Snapshot) -> Result<Snapshot, ClusterError> {
            Err(ClusterError::ExchangeFailed {
                key: key.to_string(),
                reason: "unreachable".to_string(),
            })
        }
    }

    #[test]
    fn test_snapshot_key() {
        assert_eq!(snapshot_key("orders", "latency"), "orders/latency");
    }

    #[test]
    fn test_stats_snapshot_resets() {
        let stats = SyncStats::new();
        stats.record(&SyncReport {
            exchanged: 3,
            loaded: 1,
            failed: 2,
        });
        assert_eq!(
            stats.snapshot(),
            SyncStatsSnapshot {
                exchanges: 3,
                loads: 1,
                failures: 2,
            }
        );
        assert_eq!(stats.snapshot(), SyncStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_failed_exchange_is_counted_not_fatal() {
        let registry = crate::engine::tests::registry_with(&[("g", "gauge64")]).await;
        let sync = DistributedSynchronizer::new(
            Arc::clone(&registry),
            Arc::new(FailingStore),
            Duration::from_secs(5),
        );
        let report = sync.synchronize_once().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.exchanged, 0);
        assert_eq!(sync.stats().snapshot().failures, 1);
    }

    #[tokio::test]
    async fn test_own_snapshot_is_not_reloaded() {
        let registry = crate::engine::tests::registry_with(&[("g", "gauge64")]).await;
        let sync = DistributedSynchronizer::new(
            Arc::clone(&registry),
            Arc::new(InMemorySnapshotStore::new()),
            Duration::from_secs(5),
        );
        let report = sync.synchronize_once().await;
        assert_eq!(report.exchanged, 1);
        assert_eq!(report.loaded, 0);
    }
}
