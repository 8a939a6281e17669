//! Trait seam for the ownership registry: a strongly consistent KV with TTL
//! leases, key watches, and a create-if-absent primitive for leader election.
//!
//! Picker presence lives under `/scheduler/pickers/<id>` (leased), shard
//! assignments under `/scheduler/assignments/<id>`, and the leader key at
//! `/scheduler/leader`.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;

pub use memory::MemoryOwnershipRegistry;

pub const PICKERS_PREFIX: &str = "/scheduler/pickers/";
pub const ASSIGNMENTS_PREFIX: &str = "/scheduler/assignments/";
pub const LEADER_KEY: &str = "/scheduler/leader";

pub type LeaseId = Uuid;

#[async_trait]
pub trait OwnershipRegistry: Send + Sync {
    /// Grant a lease that expires unless kept alive within `ttl`.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renew a lease. Fails with a coordination error once the lease has
    /// expired; the holder must treat that as session loss.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Drop a lease and every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Create-if-absent under a lease; the election primitive. Returns true
    /// when this call created the key.
    async fn try_acquire(&self, key: &str, value: &str, lease: LeaseId) -> Result<bool>;

    /// Watch a key. The receiver is seeded with the current value and
    /// updated on every put, delete, and lease expiry.
    async fn watch(&self, key: &str) -> Result<watch::Receiver<Option<String>>>;
}
