//! PostgreSQL transaction-scoped advisory locks

use super::{LockClass, LockFactory, LockOwner};
use crate::error::{ConvoyError, Result};
use crate::hash::lock_key;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Lock factory holding one pooled session per lock.
///
/// Each lock runs `BEGIN` then `pg_advisory_xact_lock(key, class)` on its
/// own connection, which stays checked out of the pool until `COMMIT` on
/// unlock. A crashed replica's sessions die with it, and the server drops
/// their locks.
pub struct PgLockFactory {
    pool: Pool,
    sessions: Mutex<HashMap<LockOwner, Object>>,
}

impl PgLockFactory {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sessions currently holding a lock
    pub fn held_count(&self) -> usize {
        self.sessions.lock().len()
    }

    async fn begin(&self, key: &str, class: LockClass) -> Result<OpenSession> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| acquisition_error(key, class, e))?;
        let session = OpenSession(Some(client));
        session
            .client(key, class)?
            .batch_execute("BEGIN")
            .await
            .map_err(|e| acquisition_error(key, class, e))?;
        Ok(session)
    }

    fn register(&self, session: OpenSession) -> Option<LockOwner> {
        let client = session.into_inner()?;
        let owner = LockOwner::new();
        self.sessions.lock().insert(owner, client);
        Some(owner)
    }
}

#[async_trait]
impl LockFactory for PgLockFactory {
    async fn lock(&self, key: &str, class: LockClass) -> Result<LockOwner> {
        let session = self.begin(key, class).await?;
        session
            .client(key, class)?
            .execute(
                "SELECT pg_advisory_xact_lock($1, $2)",
                &[&lock_key(key), &lock_key(class.as_str())],
            )
            .await
            .map_err(|e| acquisition_error(key, class, e))?;

        let owner = self
            .register(session)
            .ok_or_else(|| acquisition_error(key, class, "session released early"))?;
        debug!(key, %class, %owner, "advisory lock acquired");
        Ok(owner)
    }

    async fn try_lock(&self, key: &str, class: LockClass) -> Result<Option<LockOwner>> {
        let session = self.begin(key, class).await?;
        let row = session
            .client(key, class)?
            .query_one(
                "SELECT pg_try_advisory_xact_lock($1, $2)",
                &[&lock_key(key), &lock_key(class.as_str())],
            )
            .await
            .map_err(|e| acquisition_error(key, class, e))?;
        let acquired: bool = row.try_get(0)?;

        if !acquired {
            session.rollback().await;
            return Ok(None);
        }
        Ok(self.register(session))
    }

    async fn unlock(&self, owner: LockOwner) {
        let Some(client) = self.sessions.lock().remove(&owner) else {
            return;
        };
        if let Err(e) = client.batch_execute("COMMIT").await {
            warn!(%owner, "failed to end lock transaction, closing session: {}", e);
            drop(Object::take(client));
        }
    }
}

/// A pooled session with an open transaction.
///
/// Dropping it before hand-off closes the underlying connection instead of
/// returning it to the pool, so an interrupted `pg_advisory_xact_lock`
/// cannot leave a lock or a half-finished transaction on a reused session.
struct OpenSession(Option<Object>);

impl OpenSession {
    fn client(&self, key: &str, class: LockClass) -> Result<&Object> {
        self.0
            .as_ref()
            .ok_or_else(|| acquisition_error(key, class, "session already released"))
    }

    fn into_inner(mut self) -> Option<Object> {
        self.0.take()
    }

    async fn rollback(mut self) {
        if let Some(client) = self.0.take() {
            if client.batch_execute("ROLLBACK").await.is_err() {
                drop(Object::take(client));
            }
        }
    }
}

impl Drop for OpenSession {
    fn drop(&mut self) {
        if let Some(client) = self.0.take() {
            drop(Object::take(client));
        }
    }
}

fn acquisition_error(key: &str, class: LockClass, reason: impl std::fmt::Display) -> ConvoyError {
    ConvoyError::LockAcquisition {
        key: key.to_string(),
        class: class.as_str(),
        reason: reason.to_string(),
    }
}
