//! Endpoint pools keyed by model kind.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::EndpointsConfig;
use crate::error::{Error, Result};

use super::{Endpoint, EndpointPool};

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub kind: String,
    pub idle: usize,
    pub capacity: usize,
}

/// Fixed set of endpoint pools, one per model kind.
///
/// Built once at startup; the set of kinds never changes afterwards.
#[derive(Debug, Default, Clone)]
pub struct EndpointPools {
    pools: HashMap<String, EndpointPool>,
}

impl EndpointPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one pool per configured kind.
    pub fn from_config(endpoints: &HashMap<String, EndpointsConfig>) -> Self {
        let mut pools = Self::new();
        for (kind, cfg) in endpoints {
            let list = cfg.urls.iter().map(Endpoint::new).collect();
            pools.insert(EndpointPool::with_options(
                kind.clone(),
                list,
                cfg.acquire,
                cfg.acquire_timeout(),
            ));
            tracing::info!(
                "Endpoint pool '{}' ready with {} endpoint(s), acquire={:?}",
                kind,
                cfg.urls.len(),
                cfg.acquire
            );
        }
        pools
    }

    /// Add a pool, replacing any pool of the same kind.
    pub fn insert(&mut self, pool: EndpointPool) {
        self.pools.insert(pool.kind().to_string(), pool);
    }

    pub fn get(&self, kind: &str) -> Result<&EndpointPool> {
        self.pools
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    /// Idle endpoints of the given kind.
    pub fn idle_count(&self, kind: &str) -> Result<usize> {
        self.get(kind).map(EndpointPool::idle_count)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.pools.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Status of every pool, sorted by kind.
    pub fn status(&self) -> Vec<PoolStatus> {
        let mut status: Vec<PoolStatus> = self
            .pools
            .values()
            .map(|p| PoolStatus {
                kind: p.kind().to_string(),
                idle: p.idle_count(),
                capacity: p.capacity(),
            })
            .collect();
        status.sort_by(|a, b| a.kind.cmp(&b.kind));
        status
    }
}
