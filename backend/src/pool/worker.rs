//! Bounded executor for batch work.
//!
//! Submission never waits: when every slot is taken the unit of work is
//! refused and the caller decides what to do with it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};

/// Errors from [`WorkerPool::submit`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool is saturated")]
    Saturated,
    #[error("worker pool is shut down")]
    Closed,
}

/// Executor running at most `capacity` units of work at once.
pub struct WorkerPool {
    capacity: usize,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Largest number of slots a pool can have.
    pub const MAX_CAPACITY: u32 = u16::MAX as u32;

    /// Pool with `capacity` slots, at most [`Self::MAX_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let limit = Self::MAX_CAPACITY as usize;
        if capacity > limit {
            tracing::warn!("Worker pool capacity {} capped to {}", capacity, limit);
        }
        let capacity = capacity.min(limit);
        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free for new work right now.
    pub fn idle_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Units of work currently executing.
    pub fn running(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Start a unit of work if a slot is free.
    ///
    /// The slot is held until the future completes or panics.
    pub fn submit<F>(&self, work: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }

        let permit = self.slots.clone().try_acquire_owned().map_err(|e| match e {
            TryAcquireError::NoPermits => SubmitError::Saturated,
            TryAcquireError::Closed => SubmitError::Closed,
        })?;

        tokio::spawn(async move {
            let _permit = permit;
            work.await;
        });

        Ok(())
    }

    /// Stop accepting work and wait for running units to finish.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let running = self.running();
        if running > 0 {
            tracing::info!("Waiting for {} running unit(s) of work", running);
        }

        // Every slot back in hand means nothing is running.
        let all = u32::try_from(self.capacity).unwrap_or(Self::MAX_CAPACITY);
        let drained = self.slots.acquire_many(all).await;
        drop(drained);
        self.slots.close();
        tracing::info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_capacity_is_capped() {
        let pool = WorkerPool::new(usize::MAX);
        assert_eq!(pool.capacity(), WorkerPool::MAX_CAPACITY as usize);
        assert_eq!(pool.idle_slots(), pool.capacity());
    }

    #[tokio::test]
    async fn test_submit_runs_work() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = oneshot::channel();

        pool.submit(async move {
            let _ = tx.send(42);
        })
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_saturated_pool_refuses_work() {
        let pool = WorkerPool::new(2);
        let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);

        for _ in 0..2 {
            let mut release = release_tx.subscribe();
            pool.submit(async move {
                let _ = release.recv().await;
            })
            .unwrap();
        }

        assert_eq!(pool.idle_slots(), 0);
        assert_eq!(pool.running(), 2);
        assert_eq!(pool.submit(async {}), Err(SubmitError::Saturated));

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.idle_slots(), 2);
    }

    #[tokio::test]
    async fn test_panicking_work_frees_its_slot() {
        let pool = WorkerPool::new(1);
        pool.submit(async { panic!("unit of work failed") }).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.idle_slots(), 1);
        assert!(pool.submit(async {}).is_ok());
    }

    #[tokio::test]
    async fn test_parallelism_never_exceeds_capacity() {
        let pool = Arc::new(WorkerPool::new(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut accepted = 0;

        for _ in 0..10 {
            let active = active.clone();
            let peak = peak.clone();
            let result = pool.submit(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
            if result.is_ok() {
                accepted += 1;
            }
        }

        pool.shutdown().await;
        assert_eq!(accepted, 3);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.shutdown().await;
        assert!(done.load(Ordering::SeqCst));
        assert!(pool.is_closed());
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.submit(async {}), Err(SubmitError::Closed));
    }
}
