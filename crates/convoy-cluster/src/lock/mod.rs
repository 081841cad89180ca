//! Advisory lock coordination
//!
//! A lock is a named, exclusive claim on `(class, key)` held by one
//! database session inside an open transaction. Ending the transaction,
//! or losing the session, releases it; no lease or timeout is involved.
//!
//! [`LockFactory`] is the token-level contract. Callers normally go
//! through [`acquire`] / [`try_acquire`], which wrap the token in a
//! [`LockGuard`] so the lock is released on every exit path, including
//! cancellation of the surrounding task.

mod gated;
mod memory;
mod postgres;

pub use gated::SubscriptionGatedLockFactory;
pub use memory::MemoryLockFactory;
pub use postgres::PgLockFactory;

use crate::error::Result;
use crate::observability::LockMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Namespace of a lock key.
///
/// The class is hashed into the second half of the two-part advisory key,
/// so equal keys of different classes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockClass {
    Migrations,
    Resources,
    ResourceStatus,
    Events,
    StatusEvents,
    Instances,
}

impl LockClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockClass::Migrations => "migrations",
            LockClass::Resources => "resources",
            LockClass::ResourceStatus => "resource_status",
            LockClass::Events => "events",
            LockClass::StatusEvents => "status_events",
            LockClass::Instances => "instances",
        }
    }
}

impl std::fmt::Display for LockClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token identifying one held lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(Uuid);

impl LockOwner {
    pub(crate) fn new() -> Self {
        LockOwner(Uuid::new_v4())
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive locks shared by every replica
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Wait until `(class, key)` is held by this caller
    async fn lock(&self, key: &str, class: LockClass) -> Result<LockOwner>;

    /// Take `(class, key)` if free; `None` when another session holds it
    async fn try_lock(&self, key: &str, class: LockClass) -> Result<Option<LockOwner>>;

    /// Release a held lock. Unknown tokens are ignored.
    async fn unlock(&self, owner: LockOwner);
}

/// A held lock, released by [`LockGuard::release`] or on drop
pub struct LockGuard {
    factory: Arc<dyn LockFactory>,
    owner: Option<LockOwner>,
    class: LockClass,
    acquired_at: Instant,
}

impl LockGuard {
    fn new(factory: Arc<dyn LockFactory>, owner: LockOwner, class: LockClass) -> Self {
        Self {
            factory,
            owner: Some(owner),
            class,
            acquired_at: Instant::now(),
        }
    }

    pub fn class(&self) -> LockClass {
        self.class
    }

    /// Release the lock and wait for the release to complete
    pub async fn release(mut self) {
        if let Some(owner) = self.owner.take() {
            self.factory.unlock(owner).await;
            LockMetrics::record_held(self.class, self.acquired_at.elapsed());
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        LockMetrics::record_held(self.class, self.acquired_at.elapsed());
        let factory = self.factory.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { factory.unlock(owner).await });
            }
            Err(_) => {
                warn!(%owner, class = %self.class, "lock guard dropped outside a runtime; session end will release it");
            }
        }
    }
}

/// Block until `(class, key)` is held
pub async fn acquire(
    factory: &Arc<dyn LockFactory>,
    key: &str,
    class: LockClass,
) -> Result<LockGuard> {
    let started = Instant::now();
    match factory.lock(key, class).await {
        Ok(owner) => {
            LockMetrics::record_acquired(class, started.elapsed());
            Ok(LockGuard::new(factory.clone(), owner, class))
        }
        Err(e) => {
            LockMetrics::increment_failures(class);
            Err(e)
        }
    }
}

/// Take `(class, key)` if nobody holds it
pub async fn try_acquire(
    factory: &Arc<dyn LockFactory>,
    key: &str,
    class: LockClass,
) -> Result<Option<LockGuard>> {
    let started = Instant::now();
    match factory.try_lock(key, class).await {
        Ok(Some(owner)) => {
            LockMetrics::record_acquired(class, started.elapsed());
            Ok(Some(LockGuard::new(factory.clone(), owner, class)))
        }
        Ok(None) => {
            debug!(key, %class, "lock held elsewhere");
            LockMetrics::increment_contended(class);
            Ok(None)
        }
        Err(e) => {
            LockMetrics::increment_failures(class);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_names_are_distinct() {
        let classes = [
            LockClass::Migrations,
            LockClass::Resources,
            LockClass::ResourceStatus,
            LockClass::Events,
            LockClass::StatusEvents,
            LockClass::Instances,
        ];
        let keys: std::collections::HashSet<i32> = classes
            .iter()
            .map(|c| crate::hash::lock_key(c.as_str()))
            .collect();
        assert_eq!(keys.len(), classes.len());
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let factory: Arc<dyn LockFactory> = Arc::new(MemoryLockFactory::new());
        {
            let _guard = acquire(&factory, "k", LockClass::Events).await.unwrap();
            assert!(try_acquire(&factory, "k", LockClass::Events)
                .await
                .unwrap()
                .is_none());
        }
        // the drop path releases on a spawned task
        tokio::task::yield_now().await;
        let again = acquire(&factory, "k", LockClass::Events).await.unwrap();
        again.release().await;
    }
}
