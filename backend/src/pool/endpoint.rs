//! Bounded pool of upstream endpoints.
//!
//! A pool owns a fixed set of endpoint addresses and hands each one to at
//! most one caller at a time. The free list is paired with a counting
//! semaphore: a permit is taken before an endpoint is popped and given back
//! only after the endpoint is pushed back, so the number of available
//! permits is always the number of endpoints a new caller can get.
//!
//! Checked-out endpoints are represented by an [`EndpointLease`]. Dropping
//! the lease returns the endpoint, so release happens exactly once on every
//! exit path.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{Error, Result};

/// Address of one upstream backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(Arc<str>);

impl Endpoint {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self(Arc::from(url.as_ref().trim_end_matches('/')))
    }

    pub fn url(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a caller waits for a free endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Fail with [`Error::Busy`] right away when nothing is free.
    #[default]
    NonBlocking,
    /// Wait until an endpoint is released (bounded by the pool's timeout).
    Blocking,
}

struct PoolInner {
    kind: String,
    capacity: usize,
    free: Mutex<VecDeque<Endpoint>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Option<Duration>,
    default_mode: AcquireMode,
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, VecDeque<Endpoint>> {
        // The free list is only pushed/popped; a panic elsewhere cannot leave it torn.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Concurrency limiter over a fixed set of endpoints of one model kind.
///
/// Cloning is cheap and clones share the same bookkeeping.
#[derive(Clone)]
pub struct EndpointPool {
    inner: Arc<PoolInner>,
}

impl EndpointPool {
    /// Create a pool over the given endpoints. Capacity is their count.
    pub fn new(kind: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self::with_options(kind, endpoints, AcquireMode::default(), None)
    }

    pub fn with_options(
        kind: impl Into<String>,
        endpoints: Vec<Endpoint>,
        default_mode: AcquireMode,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        let capacity = endpoints.len();
        Self {
            inner: Arc::new(PoolInner {
                kind: kind.into(),
                capacity,
                free: Mutex::new(endpoints.into_iter().collect()),
                permits: Arc::new(Semaphore::new(capacity)),
                acquire_timeout,
                default_mode,
            }),
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Number of configured endpoints.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Endpoints a caller could take right now.
    pub fn idle_count(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn checked_out(&self) -> usize {
        self.inner.capacity - self.idle_count()
    }

    /// Acquisition mode configured for batch work of this kind.
    pub fn default_mode(&self) -> AcquireMode {
        self.inner.default_mode
    }

    /// Take a free endpoint without waiting.
    pub fn try_acquire(&self) -> Result<EndpointLease> {
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => self.checkout(permit),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                tracing::debug!(kind = %self.inner.kind, "No idle endpoint");
                Err(Error::Busy)
            }
        }
    }

    /// Wait for a free endpoint.
    ///
    /// Gives up with [`Error::Busy`] once the pool's acquire timeout elapses.
    /// Dropping the returned future while it waits takes nothing from the pool.
    pub async fn acquire(&self) -> Result<EndpointLease> {
        let permits = self.inner.permits.clone();
        let permit = match self.inner.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, permits.acquire_owned()).await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(
                        kind = %self.inner.kind,
                        "Timed out after {:?} waiting for an endpoint",
                        limit
                    );
                    return Err(Error::Busy);
                }
            },
            None => permits.acquire_owned().await,
        }
        .map_err(|_| Error::Busy)?;

        self.checkout(permit)
    }

    /// Acquire with the given mode.
    pub async fn acquire_with(&self, mode: AcquireMode) -> Result<EndpointLease> {
        match mode {
            AcquireMode::NonBlocking => self.try_acquire(),
            AcquireMode::Blocking => self.acquire().await,
        }
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<EndpointLease> {
        let endpoint = self.inner.free_list().pop_front().ok_or_else(|| {
            Error::Internal(format!(
                "endpoint pool '{}' granted a permit with an empty free list",
                self.inner.kind
            ))
        })?;

        tracing::debug!(kind = %self.inner.kind, endpoint = %endpoint, "Endpoint acquired");

        Ok(EndpointLease {
            pool: self.inner.clone(),
            endpoint,
            permit: Some(permit),
        })
    }
}

impl fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("kind", &self.inner.kind)
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// Exclusive use of one endpoint until dropped.
pub struct EndpointLease {
    pool: Arc<PoolInner>,
    endpoint: Endpoint,
    permit: Option<OwnedSemaphorePermit>,
}

impl EndpointLease {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn kind(&self) -> &str {
        &self.pool.kind
    }

    /// Return the endpoint to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        tracing::debug!(kind = %self.pool.kind, endpoint = %self.endpoint, "Endpoint released");
        self.pool.free_list().push_back(self.endpoint.clone());
        // The permit goes back only after the endpoint is on the free list.
        drop(self.permit.take());
    }
}

impl fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLease")
            .field("kind", &self.pool.kind)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
