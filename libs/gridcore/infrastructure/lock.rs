//! Distributed lock contract and the in-process implementation
//!
//! The lock protects one reconciliation key against overlapping processes
//! (for example during a deploy). A busy lock is not an error for callers;
//! they skip the round.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {0} is held by another owner")]
    Busy(String),

    #[error("Lock backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Mutual exclusion across processes for a given key
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `key` for at most `ttl`. Returns `LockError::Busy` when another
    /// owner holds an unexpired lease.
    async fn lock(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Release `key`. Releasing a lock that is not held is a no-op.
    async fn unlock(&self, key: &str) -> Result<()>;
}

/// TTL-aware lock for a single process
///
/// Used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently has an unexpired lease
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .lock()
            .get(key)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn lock(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some(expires) = leases.get(key) {
            if *expires > now {
                return Err(LockError::Busy(key.to_string()));
            }
        }

        leases.insert(key.to_string(), now + ttl);
        Ok(())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.leases.lock().remove(key);
        Ok(())
    }
}
