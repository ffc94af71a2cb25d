//! Distributed connection registry
//!
//! Records which gateway instance owns the live connection of a charge
//! point, so commands arriving at another instance can be routed. The
//! production store sits outside this process; `InMemoryConnectionRegistry`
//! serves single-instance deployments and tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry write timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Record `instance_id` as the owner of `charge_point_id` for `ttl`.
    async fn set_connection(
        &self,
        charge_point_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<(), RegistryError>;

    /// Owner instance of a charge point, if a live record exists.
    async fn get_connection(&self, charge_point_id: &str) -> Result<Option<String>, RegistryError>;

    async fn delete_connection(&self, charge_point_id: &str) -> Result<(), RegistryError>;
}

pub type SharedConnectionRegistry = Arc<dyn ConnectionRegistry>;

struct RegistryEntry {
    instance_id: String,
    expires_at: Instant,
}

/// TTL map keyed by charge point id
#[derive(Default)]
pub struct InMemoryConnectionRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryConnectionRegistry {
    async fn set_connection(
        &self,
        charge_point_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        self.entries.insert(
            charge_point_id.to_string(),
            RegistryEntry {
                instance_id: instance_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_connection(&self, charge_point_id: &str) -> Result<Option<String>, RegistryError> {
        let now = Instant::now();
        // Expired records are removed lazily on read.
        if self
            .entries
            .remove_if(charge_point_id, |_, e| e.expires_at <= now)
            .is_some()
        {
            return Ok(None);
        }
        Ok(self
            .entries
            .get(charge_point_id)
            .map(|e| e.instance_id.clone()))
    }

    async fn delete_connection(&self, charge_point_id: &str) -> Result<(), RegistryError> {
        self.entries.remove(charge_point_id);
        Ok(())
    }
}

/// Registry write bounded by `limit`.
pub async fn set_with_timeout(
    registry: &dyn ConnectionRegistry,
    charge_point_id: &str,
    instance_id: &str,
    ttl: Duration,
    limit: Duration,
) -> Result<(), RegistryError> {
    match tokio::time::timeout(limit, registry.set_connection(charge_point_id, instance_id, ttl)).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Timeout(limit)),
    }
}
