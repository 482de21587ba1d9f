//! Keyed, lease-bounded locks for workflow actions and maintenance runs.
//!
//! A lease expires on its own, so a crashed holder never blocks a key forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::store::StoreError;

/// Proof of holding a lease; required to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

pub trait LockProvider: Send + Sync {
    /// Take `key` for `lease`, or `None` if a live lease is held by someone else.
    fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LeaseToken>, StoreError>;

    /// Release `key` if `token` still holds it. Releasing an expired lease is a no-op.
    fn release(&self, key: &str, token: LeaseToken) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct Lease {
    token: LeaseToken,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryLockProvider {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockProvider for InMemoryLockProvider {
    fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LeaseToken>, StoreError> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::poisoned())?;
        let now = Instant::now();
        if let Some(held) = leases.get(key) {
            if held.expires_at > now {
                return Ok(None);
            }
            debug!(lock = key, "taking over expired lease");
        }
        let token = LeaseToken::new();
        leases.insert(
            key.to_string(),
            Lease {
                token,
                expires_at: now + lease,
            },
        );
        Ok(Some(token))
    }

    fn release(&self, key: &str, token: LeaseToken) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::poisoned())?;
        if leases.get(key).is_some_and(|held| held.token == token) {
            leases.remove(key);
        }
        Ok(())
    }
}

/// Lock front used by services: maps a busy key to `AlreadyProcessing`.
#[derive(Clone)]
pub struct WorkflowLocks {
    provider: Arc<dyn LockProvider>,
    lease: Duration,
}

impl WorkflowLocks {
    pub fn new(provider: Arc<dyn LockProvider>, lease: Duration) -> Self {
        Self { provider, lease }
    }

    pub fn acquire(&self, key: impl Into<String>) -> Result<LeaseGuard, LedgerError> {
        let key = key.into();
        match self.provider.try_acquire(&key, self.lease)? {
            Some(token) => Ok(LeaseGuard {
                provider: Arc::clone(&self.provider),
                key,
                token,
            }),
            None => Err(LedgerError::AlreadyProcessing { resource: key }),
        }
    }
}

/// Releases its lease on drop.
pub struct LeaseGuard {
    provider: Arc<dyn LockProvider>,
    key: String,
    token: LeaseToken,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.release(&self.key, self.token) {
            warn!(lock = %self.key, error = %err, "failed to release lease; it will expire");
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard").field("key", &self.key).finish()
    }
}
