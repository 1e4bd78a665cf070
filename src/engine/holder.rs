use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;

use crate::attribute::Attribute;
use crate::cluster::Snapshot;
use crate::descriptor::{keys, Descriptor};
use crate::error::AttributeError;
use crate::metrics::{now_millis, Metric, MetricKind};
use crate::notification::MeasurementNotification;
use crate::value::{AttributeMetadata, CompositeValue, Value};

/// Snapshot, restore and reset access to a metric-backed attribute.
pub trait MetricAccess: Send + Sync {
    fn metric_kind(&self) -> MetricKind;

    /// Current view at `now_ms`, or `None` once closed.
    fn view_at(&self, now_ms: u64) -> Option<CompositeValue>;

    fn take_snapshot(&self) -> Option<Snapshot>;

    /// Replaces the held metric with one rebuilt from `snapshot`.
    /// A snapshot of another metric type is ignored. Returns whether the
    /// metric was replaced.
    fn load_from_snapshot(&self, snapshot: &Snapshot) -> bool;

    /// Clears the accumulator. False once closed.
    fn reset(&self) -> bool;

    fn is_closed(&self) -> bool;
}

/// Attribute owning exactly one live metric.
///
/// Reads and updates take the shared lock: they only touch the metric's own
/// atomics. Snapshot, restore, reset and close take the exclusive lock
/// because they read a consistent copy of, replace or drop the reference.
pub struct MetricHolder<M: Metric> {
    name: String,
    descriptor: Descriptor,
    kind: MetricKind,
    filter: Option<Regex>,
    metric: RwLock<Option<M>>,
    last_update_ms: AtomicU64,
}

impl<M: Metric> MetricHolder<M> {
    pub fn new(name: &str, descriptor: &Descriptor, metric: M) -> Result<Self, AttributeError> {
        let filter = match descriptor.get(keys::FILTER) {
            Ok(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|e| AttributeError::invalid_parameter(keys::FILTER, e.to_string()))?,
            ),
            Err(_) => None,
        };
        Ok(Self {
            name: name.to_string(),
            descriptor: descriptor.clone(),
            kind: metric.kind(),
            filter,
            metric: RwLock::new(Some(metric)),
            last_update_ms: AtomicU64::new(0),
        })
    }

    fn closed_error(&self) -> AttributeError {
        AttributeError::Closed(self.name.clone())
    }

    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<M: Metric> Attribute for MetricHolder<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn metadata(&self) -> AttributeMetadata {
        AttributeMetadata::composite(&self.name, self.kind.schema())
            .with_description(format!("{} metric", self.kind))
    }

    async fn get_value(&self) -> Result<Value, AttributeError> {
        self.view_at(now_millis())
            .map(Value::Composite)
            .ok_or_else(|| self.closed_error())
    }

    fn accept(&self, notification: &MeasurementNotification) -> Result<bool, AttributeError> {
        if let Some(filter) = &self.filter {
            if !filter.is_match(&notification.message) {
                return Ok(false);
            }
        }
        let guard = self.metric.read();
        let metric = guard.as_ref().ok_or_else(|| self.closed_error())?;
        let now = now_millis();
        let applied = metric.update(notification, now);
        if applied {
            self.last_update_ms.fetch_max(now, Ordering::Relaxed);
        }
        Ok(applied)
    }

    fn as_metric(&self) -> Option<&dyn MetricAccess> {
        Some(self)
    }

    fn close(&self) {
        self.metric.write().take();
    }
}

impl<M: Metric> MetricAccess for MetricHolder<M> {
    fn metric_kind(&self) -> MetricKind {
        self.kind
    }

    fn view_at(&self, now_ms: u64) -> Option<CompositeValue> {
        self.metric.read().as_ref().map(|m| m.view_at(now_ms))
    }

    fn take_snapshot(&self) -> Option<Snapshot> {
        let guard = self.metric.write();
        let metric = guard.as_ref()?;
        Some(Snapshot {
            last_update_ms: self.last_update_ms.load(Ordering::Relaxed),
            metric: metric.snapshot(),
        })
    }

    fn load_from_snapshot(&self, snapshot: &Snapshot) -> bool {
        if snapshot.metric.kind() != self.kind {
            return false;
        }
        let Some(restored) = M::restore(&snapshot.metric) else {
            return false;
        };
        let mut guard = self.metric.write();
        if guard.is_none() {
            return false;
        }
        *guard = Some(restored);
        self.last_update_ms
            .store(snapshot.last_update_ms, Ordering::Relaxed);
        true
    }

    fn reset(&self) -> bool {
        let guard = self.metric.write();
        let Some(metric) = guard.as_ref() else {
            return false;
        };
        let now = now_millis();
        metric.reset(now);
        self.last_update_ms.store(now, Ordering::Relaxed);
        true
    }

    fn is_closed(&self) -> bool {
        self.metric.read().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::{Flag, Gauge, MetricSnapshot, RateRecorder};
    use crate::notification::{InstantValue, Measurement, SourceIdentity, ValueChange};

    fn int(v: i64) -> MeasurementNotification {
        MeasurementNotification::new(
            SourceIdentity::new("svc", ""),
            Measurement::ValueChanged(ValueChange::Integer(v)),
        )
    }

    fn gauge_holder(descriptor: &Descriptor) -> MetricHolder<Gauge<i64>> {
        MetricHolder::new("temp", descriptor, Gauge::new(now_millis())).expect("valid holder")
    }

    #[tokio::test]
    async fn test_accept_and_get_value() {
        let holder = gauge_holder(&Descriptor::new());
        assert_eq!(holder.accept(&int(21)), Ok(true));
        let Value::Composite(view) = holder.get_value().await.expect("open holder") else {
            panic!("composite expected");
        };
        assert_eq!(view.get("lastValue"), Some(&Value::Int(21)));
        assert!(holder.last_update_ms() > 0);
    }

    #[test]
    fn test_filter_on_message() {
        let descriptor = Descriptor::new().with(keys::FILTER, "^disk");
        let holder = gauge_holder(&descriptor);
        assert_eq!(holder.accept(&int(1).with_message("cpu load")), Ok(false));
        assert_eq!(holder.accept(&int(1).with_message("disk usage")), Ok(true));
    }

    #[test]
    fn test_invalid_filter_is_construction_failure() {
        let descriptor = Descriptor::new().with(keys::FILTER, "(");
        let err = MetricHolder::new("x", &descriptor, Flag::new(0)).err();
        assert!(err.is_some_and(|e| e.is_construction_failure()));
    }

    #[test]
    fn test_snapshot_roundtrip_reproduces_view() {
        let original = gauge_holder(&Descriptor::new());
        for v in [3, 9, 6] {
            original.accept(&int(v)).expect("open holder");
        }
        let snapshot = original.take_snapshot().expect("open holder");

        let fresh = gauge_holder(&Descriptor::new());
        assert!(fresh.load_from_snapshot(&snapshot));

        let now = now_millis();
        assert_eq!(fresh.view_at(now), original.view_at(now));
        assert_eq!(fresh.last_update_ms(), original.last_update_ms());
    }

    #[test]
    fn test_mismatched_snapshot_is_ignored() {
        let holder = gauge_holder(&Descriptor::new());
        holder.accept(&int(5)).expect("open holder");
        let foreign = Snapshot {
            last_update_ms: 99,
            metric: MetricSnapshot::Rate(RateRecorder::new(0).state()),
        };
        assert!(!holder.load_from_snapshot(&foreign));
        let view = holder.view_at(now_millis()).expect("open holder");
        assert_eq!(view.get("lastValue"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_reset_and_close() {
        let holder = MetricHolder::new("f", &Descriptor::new(), Flag::new(0)).expect("holder");
        let flag = MeasurementNotification::new(
            SourceIdentity::default(),
            Measurement::Instant(InstantValue::Flag(true)),
        );
        holder.accept(&flag).expect("open holder");
        assert!(holder.reset());
        let view = holder.view_at(now_millis()).expect("open holder");
        assert_eq!(view.get("trueCount"), Some(&Value::Int(0)));

        holder.close();
        assert!(holder.is_closed());
        assert!(!holder.reset());
        assert!(holder.take_snapshot().is_none());
        assert_eq!(
            holder.accept(&flag),
            Err(AttributeError::Closed("f".to_string()))
        );
    }

    #[test]
    fn test_concurrent_accepts_lose_nothing() {
        let holder = Arc::new(gauge_holder(&Descriptor::new()));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let holder = Arc::clone(&holder);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        holder.accept(&int(2)).expect("open holder");
                    }
                })
            })
            .collect();
        // Snapshots interleave with the accepts without losing updates.
        for _ in 0..20 {
            holder.take_snapshot();
        }
        for t in threads {
            t.join().expect("thread panicked");
        }
        let view = holder.view_at(now_millis()).expect("open holder");
        assert_eq!(view.get("count"), Some(&Value::Int(4_000)));
        assert_eq!(view.get("meanValue"), Some(&Value::Float(2.0)));
    }
}
