//! Readiness of this replica

use crate::error::Result;
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ready,
    NotReady,
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Ready)
    }
}

/// Reports ready once the liveness scan marked this instance's row ready
pub struct HealthCheck {
    instance_id: String,
    store: Arc<dyn Store>,
}

impl HealthCheck {
    pub fn new(instance_id: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
        }
    }

    pub async fn check(&self) -> Result<HealthStatus> {
        let status = match self.store.get_instance(&self.instance_id).await? {
            Some(instance) if instance.ready => HealthStatus::Ready,
            _ => HealthStatus::NotReady,
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InstanceStore, MemoryStore};
    use chrono::Utc;

    #[tokio::test]
    async fn test_ready_follows_instance_row() {
        let store = Arc::new(MemoryStore::default());
        let health = HealthCheck::new("a", store.clone());
        assert_eq!(health.check().await.unwrap(), HealthStatus::NotReady);

        store.upsert_heartbeat("a", Utc::now()).await.unwrap();
        assert_eq!(health.check().await.unwrap(), HealthStatus::NotReady);

        store.mark_ready(&["a".to_string()]).await.unwrap();
        assert!(health.check().await.unwrap().is_ready());
    }
}
