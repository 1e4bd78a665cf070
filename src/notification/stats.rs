use std::sync::atomic::{AtomicU64, Ordering};

use super::listener::NotificationListener;
use super::{MeasurementKind, MeasurementNotification, MAX_MEASUREMENT_KIND};

/// Lock-free notification counters of one resource.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct NotificationStats {
    received: AtomicU64,
    dropped: AtomicU64,
    attribute_failures: AtomicU64,
    delivered: [AtomicU64; MAX_MEASUREMENT_KIND + 1],
}

/// Counter values drained by [`NotificationStats::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationStatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub attribute_failures: u64,
    /// Non-zero delivered counts per measurement kind.
    pub delivered: Vec<(MeasurementKind, u64)>,
}

impl NotificationStatsSnapshot {
    pub fn delivered_total(&self) -> u64 {
        self.delivered.iter().map(|(_, v)| v).sum()
    }
}

impl NotificationStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            attribute_failures: AtomicU64::new(0),
            delivered: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attribute_failures(&self, n: usize) {
        if n > 0 {
            self.attribute_failures
                .fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn record_delivered(&self, kind: MeasurementKind) {
        if let Some(counter) = self.delivered.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> NotificationStatsSnapshot {
        let mut delivered = Vec::new();
        for (i, counter) in self.delivered.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = MeasurementKind::from_u8(i as u8) {
                    delivered.push((kind, v));
                }
            }
        }

        NotificationStatsSnapshot {
            received: self.received.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            attribute_failures: self.attribute_failures.swap(0, Ordering::Relaxed),
            delivered,
        }
    }
}

impl Default for NotificationStats {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationListener for NotificationStats {
    fn handle_notification(&self, notification: &MeasurementNotification) {
        self.record_delivered(notification.kind());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notification::{InstantValue, Measurement, SourceIdentity};

    #[test]
    fn test_record_and_snapshot() {
        let stats = NotificationStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_dropped();
        stats.record_attribute_failures(0);
        stats.record_attribute_failures(3);
        stats.record_delivered(MeasurementKind::Stopwatch);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.attribute_failures, 3);
        assert_eq!(snap.delivered, vec![(MeasurementKind::Stopwatch, 1)]);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = NotificationStats::new();
        stats.record_received();
        stats.record_delivered(MeasurementKind::Text);
        assert_eq!(stats.snapshot().delivered_total(), 1);
        assert_eq!(stats.snapshot(), NotificationStatsSnapshot::default());
    }

    #[test]
    fn test_listener_counts_by_kind() {
        let stats = NotificationStats::new();
        let flag = MeasurementNotification::new(
            SourceIdentity::default(),
            Measurement::Instant(InstantValue::Flag(true)),
        );
        let timing = MeasurementNotification::new(
            SourceIdentity::default(),
            Measurement::Stopwatch {
                duration: Duration::from_millis(3),
            },
        );
        stats.handle_notification(&flag);
        stats.handle_notification(&flag);
        stats.handle_notification(&timing);

        let snap = stats.snapshot();
        assert_eq!(
            snap.delivered,
            vec![(MeasurementKind::Stopwatch, 1), (MeasurementKind::Flag, 2)]
        );
    }
}
