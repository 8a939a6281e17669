//! Embedded engine backing the ownership-registry trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::registry::{LeaseId, OwnershipRegistry};

const PURGE_PERIOD: Duration = Duration::from_millis(100);

struct Lease {
    expires_at: Instant,
    ttl: Duration,
}

struct KeyEntry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Default)]
struct RegistryState {
    leases: HashMap<LeaseId, Lease>,
    keys: BTreeMap<String, KeyEntry>,
    watchers: HashMap<String, watch::Sender<Option<String>>>,
}

impl RegistryState {
    fn notify(&mut self, key: &str) {
        let value = self.keys.get(key).map(|e| e.value.clone());
        if let Some(tx) = self.watchers.get(key) {
            let _ = tx.send(value);
        }
    }

    /// Drop expired leases and the keys attached to them.
    fn purge(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.leases.remove(id);
        }
        let dead_keys: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, e)| e.lease.map(|l| expired.contains(&l)).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead_keys {
            self.keys.remove(&key);
            tracing::debug!(key, "Registry key expired with its lease");
            self.notify(&key);
        }
    }
}

/// In-process registry engine. A background task retires expired leases so
/// watchers observe expiry without any other traffic.
pub struct MemoryOwnershipRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl MemoryOwnershipRegistry {
    /// Must be called from within a tokio runtime; the purge task exits once
    /// the registry is dropped.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(RegistryState::default()));
        let weak: Weak<Mutex<RegistryState>> = Arc::downgrade(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_PERIOD);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(state) => state.lock().await.purge(Instant::now()),
                    None => break,
                }
            }
        });
        Self { state }
    }
}

impl Default for MemoryOwnershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OwnershipRegistry for MemoryOwnershipRegistry {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let id = Uuid::new_v4();
        self.state.lock().await.leases.insert(
            id,
            Lease {
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.purge(Instant::now());
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(SchedulerError::Coordination(format!(
                "lease {lease} expired"
            ))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.leases.remove(&lease);
        let dead_keys: Vec<String> = state
            .keys
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead_keys {
            state.keys.remove(&key);
            state.notify(&key);
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.purge(Instant::now());
        if let Some(l) = lease {
            if !state.leases.contains_key(&l) {
                return Err(SchedulerError::Coordination(format!("lease {l} expired")));
            }
        }
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                lease,
            },
        );
        state.notify(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        state.purge(Instant::now());
        Ok(state.keys.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.keys.remove(key);
        state.notify(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut state = self.state.lock().await;
        state.purge(Instant::now());
        Ok(state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn try_acquire(&self, key: &str, value: &str, lease: LeaseId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.purge(Instant::now());
        if !state.leases.contains_key(&lease) {
            return Err(SchedulerError::Coordination(format!(
                "lease {lease} expired"
            )));
        }
        if state.keys.contains_key(key) {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                lease: Some(lease),
            },
        );
        state.notify(key);
        Ok(true)
    }

    async fn watch(&self, key: &str) -> Result<watch::Receiver<Option<String>>> {
        let mut state = self.state.lock().await;
        state.purge(Instant::now());
        let current = state.keys.get(key).map(|e| e.value.clone());
        let tx = state
            .watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(current.clone()).0);
        Ok(tx.subscribe())
    }
}
