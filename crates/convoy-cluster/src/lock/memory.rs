//! Process-local lock table with advisory-lock semantics

use super::{LockClass, LockFactory, LockOwner};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct LockTable {
    held: HashMap<(LockClass, String), LockOwner>,
    owners: HashMap<LockOwner, (LockClass, String)>,
}

#[derive(Default)]
struct Shared {
    table: Mutex<LockTable>,
    released: Notify,
}

/// Lock factory whose clones share one lock table, standing in for the
/// database when several replicas run in one process
#[derive(Clone, Default)]
pub struct MemoryLockFactory {
    shared: Arc<Shared>,
}

impl MemoryLockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locks currently held
    pub fn held_count(&self) -> usize {
        self.shared.table.lock().held.len()
    }

    pub fn is_held(&self, key: &str, class: LockClass) -> bool {
        self.shared
            .table
            .lock()
            .held
            .contains_key(&(class, key.to_string()))
    }

    fn try_insert(&self, key: &str, class: LockClass) -> Option<LockOwner> {
        let mut table = self.shared.table.lock();
        let slot = (class, key.to_string());
        if table.held.contains_key(&slot) {
            return None;
        }
        let owner = LockOwner::new();
        table.held.insert(slot.clone(), owner);
        table.owners.insert(owner, slot);
        Some(owner)
    }
}

#[async_trait]
impl LockFactory for MemoryLockFactory {
    async fn lock(&self, key: &str, class: LockClass) -> Result<LockOwner> {
        loop {
            // register interest before checking so a release in between is not lost
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(owner) = self.try_insert(key, class) {
                return Ok(owner);
            }
            released.await;
        }
    }

    async fn try_lock(&self, key: &str, class: LockClass) -> Result<Option<LockOwner>> {
        Ok(self.try_insert(key, class))
    }

    async fn unlock(&self, owner: LockOwner) {
        let released = {
            let mut table = self.shared.table.lock();
            match table.owners.remove(&owner) {
                Some(slot) => {
                    table.held.remove(&slot);
                    true
                }
                None => false,
            }
        };
        if released {
            self.shared.released.notify_waiters();
        }
    }
}
