//! Concurrency limiters.
//!
//! This module provides:
//! - Endpoint pools bounding use of fixed upstream backends
//! - A registry of endpoint pools keyed by model kind
//! - A bounded worker pool for batch work

mod endpoint;
mod registry;
mod worker;

pub use endpoint::{AcquireMode, Endpoint, EndpointLease, EndpointPool};
pub use registry::{EndpointPools, PoolStatus};
pub use worker::{SubmitError, WorkerPool};
