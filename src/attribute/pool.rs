use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Workers per resource when `workers` is not configured.
pub const DEFAULT_WORKERS: usize = 4;

/// Bounded worker pool, implemented as a semaphore of task permits.
///
/// Each fan-out or listener task holds one permit for its lifetime, so at
/// most `size` of them run at once per resource.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: u32,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = u32::try_from(size.max(1)).unwrap_or(u32::MAX);
        Self {
            permits: Arc::new(Semaphore::new(size as usize)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Number of idle workers.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free worker. Fails once the pool has been shut down.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.permits).acquire_owned().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }

    /// Waits for every in-flight task to release its permit, then closes the
    /// pool so later acquisitions fail immediately.
    pub async fn shutdown(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size).await {
            drop(all);
        }
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_pool_bounds_permits() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await.expect("permit");
        let _b = pool.acquire().await.expect("permit");
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_zero_size_pool_gets_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let pool = Arc::new(WorkerPool::new(1));
        let permit = pool.acquire().await.expect("permit");
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(permit);
        });

        pool.shutdown().await;
        assert!(task.is_finished());
        assert!(pool.is_shut_down());
        assert!(pool.acquire().await.is_err());
    }
}
