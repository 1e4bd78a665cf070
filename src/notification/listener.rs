use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use super::MeasurementNotification;
use crate::attribute::pool::WorkerPool;
use crate::error::AttributeError;

/// Receives every notification a dispatcher delivers.
pub trait NotificationListener: Send + Sync {
    fn handle_notification(&self, notification: &MeasurementNotification);
}

/// How a dispatcher invokes its listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerInvocation {
    /// One after another on the delivering task.
    #[default]
    Sequential,
    /// One pool task per listener, not awaited by the delivering task.
    Parallel,
}

impl ListenerInvocation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

impl FromStr for ListenerInvocation {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(AttributeError::InvalidValue(format!(
                "unknown listener invocation {other:?}"
            ))),
        }
    }
}

/// Handle returned by [`ListenerRegistry::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Plain notification listeners of one resource.
pub struct ListenerRegistry {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn NotificationListener>)>>,
    next_id: AtomicU64,
    invocation: ListenerInvocation,
    pool: Arc<WorkerPool>,
}

impl ListenerRegistry {
    pub fn new(invocation: ListenerInvocation, pool: Arc<WorkerPool>) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            invocation,
            pool,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn NotificationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Hands the notification to every listener. Returns how many were
    /// invoked (sequential) or scheduled (parallel).
    pub async fn fire(&self, notification: Arc<MeasurementNotification>) -> usize {
        let listeners: Vec<Arc<dyn NotificationListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        match self.invocation {
            ListenerInvocation::Sequential => {
                for listener in &listeners {
                    invoke(listener.as_ref(), &notification);
                }
                listeners.len()
            }
            ListenerInvocation::Parallel => {
                let mut scheduled = 0;
                for listener in listeners {
                    let Ok(permit) = self.pool.acquire().await else {
                        debug!("worker pool shut down, listener skipped");
                        break;
                    };
                    let notification = Arc::clone(&notification);
                    tokio::spawn(async move {
                        let _permit = permit;
                        invoke(listener.as_ref(), &notification);
                    });
                    scheduled += 1;
                }
                scheduled
            }
        }
    }
}

fn invoke(listener: &dyn NotificationListener, notification: &MeasurementNotification) {
    if catch_unwind(AssertUnwindSafe(|| listener.handle_notification(notification))).is_err() {
        error!(sequence = notification.sequence, "notification listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::notification::{Measurement, SourceIdentity, ValueChange};

    #[derive(Default)]
    struct Counting {
        seen: AtomicUsize,
    }

    impl NotificationListener for Counting {
        fn handle_notification(&self, _notification: &MeasurementNotification) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl NotificationListener for Panicking {
        fn handle_notification(&self, _notification: &MeasurementNotification) {
            panic!("listener panic");
        }
    }

    fn notification() -> Arc<MeasurementNotification> {
        Arc::new(MeasurementNotification::new(
            SourceIdentity::default(),
            Measurement::ValueChanged(ValueChange::Integer(1)),
        ))
    }

    #[test]
    fn test_invocation_from_str() {
        assert_eq!("Parallel".parse(), Ok(ListenerInvocation::Parallel));
        assert_eq!("sequential".parse(), Ok(ListenerInvocation::Sequential));
        assert!("random".parse::<ListenerInvocation>().is_err());
    }

    #[tokio::test]
    async fn test_sequential_isolates_panics() {
        let registry =
            ListenerRegistry::new(ListenerInvocation::Sequential, Arc::new(WorkerPool::new(1)));
        let counting = Arc::new(Counting::default());
        registry.add_listener(Arc::new(Panicking));
        registry.add_listener(Arc::clone(&counting) as Arc<dyn NotificationListener>);

        assert_eq!(registry.fire(notification()).await, 2);
        assert_eq!(counting.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let registry =
            ListenerRegistry::new(ListenerInvocation::Sequential, Arc::new(WorkerPool::new(1)));
        let counting = Arc::new(Counting::default());
        let id = registry.add_listener(Arc::clone(&counting) as Arc<dyn NotificationListener>);
        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        assert!(registry.is_empty());

        assert_eq!(registry.fire(notification()).await, 0);
        assert_eq!(counting.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_runs_on_pool() {
        let pool = Arc::new(WorkerPool::new(2));
        let registry = ListenerRegistry::new(ListenerInvocation::Parallel, Arc::clone(&pool));
        let counting = Arc::new(Counting::default());
        registry.add_listener(Arc::clone(&counting) as Arc<dyn NotificationListener>);
        registry.add_listener(Arc::new(Panicking));

        assert_eq!(registry.fire(notification()).await, 2);
        for _ in 0..100 {
            if counting.seen.load(Ordering::SeqCst) == 1 && pool.available() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counting.seen.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 2);
    }
}
