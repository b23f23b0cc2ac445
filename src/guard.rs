//! Process-wide capacity counters.
//!
//! A [`ResourceGuard`] owns a counter with a fixed ceiling. `try_acquire`
//! never waits: callers either get a [`ResourcePermit`] or are rejected and
//! handle backpressure themselves. Dropping the permit gives the slot back,
//! so every early return on a failure path releases it.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Bounded counter for a shared resource (active workspaces, running
/// compare tasks).
#[derive(Debug, Clone)]
pub struct ResourceGuard {
    name: &'static str,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

/// One acquired slot of a [`ResourceGuard`]. Released on drop.
#[derive(Debug)]
pub struct ResourcePermit {
    _permit: OwnedSemaphorePermit,
}

impl ResourcePermit {
    /// Give the slot back explicitly.
    pub fn release(self) {}
}

impl ResourceGuard {
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Take a slot if one is free. Returns `None` at the ceiling.
    pub fn try_acquire(&self) -> Option<ResourcePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(ResourcePermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {
                tracing::debug!(guard = self.name, limit = self.limit, "resource guard at capacity");
                None
            }
            Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }
}
