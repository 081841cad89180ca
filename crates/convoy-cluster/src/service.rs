//! Resource lifecycle
//!
//! Every spec change appends an [`Event`] in the same transaction as the
//! resource write, which is what the event controller later delivers.
//! Concurrent writers are serialized per resource by advisory locks; spec
//! writers additionally carry the version they read, and a stale version
//! is rejected.

use crate::error::{ConvoyError, Result};
use crate::lock::{self, LockClass, LockFactory};
use crate::model::{Event, EventType, Resource};
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct ResourceService {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockFactory>,
}

impl ResourceService {
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockFactory>) -> Self {
        Self { store, locks }
    }

    pub async fn get(&self, id: Uuid) -> Result<Resource> {
        self.store
            .get_resource(id)
            .await?
            .ok_or_else(|| ConvoyError::not_found("resource", id))
    }

    pub async fn find_by_source(&self, source: &str) -> Result<Vec<Resource>> {
        self.store.find_resources_by_source(source).await
    }

    pub async fn find_by_consumer(&self, consumer: &str) -> Result<Vec<Resource>> {
        self.store.find_resources_by_consumer(consumer).await
    }

    /// Store a new resource at version 1 and queue its delivery
    pub async fn create(&self, mut resource: Resource) -> Result<Resource> {
        let now = Utc::now();
        resource.version = 1;
        resource.created_at = now;
        resource.updated_at = now;
        resource.deleted_at = None;

        self.store
            .create_resource_with_event(&resource, &Event::new(resource.id, EventType::Create))
            .await?;
        info!(resource_id = %resource.id, consumer = %resource.consumer_name, "resource created");
        Ok(resource)
    }

    /// Replace the spec of an existing resource.
    ///
    /// `resource.version` must equal the stored version. An unchanged
    /// payload is not a change and produces no event.
    pub async fn update(&self, resource: Resource) -> Result<Resource> {
        let guard = lock::acquire(&self.locks, &resource.id.to_string(), LockClass::Resources).await?;
        let result = self.update_locked(resource).await;
        guard.release().await;
        result
    }

    async fn update_locked(&self, resource: Resource) -> Result<Resource> {
        let mut stored = self.get(resource.id).await?;
        if stored.is_deleting() {
            return Err(ConvoyError::Conflict {
                id: stored.id,
                reason: "resource is being deleted".into(),
            });
        }
        if stored.version != resource.version {
            return Err(ConvoyError::Conflict {
                id: stored.id,
                reason: format!(
                    "version {} does not match stored version {}",
                    resource.version, stored.version
                ),
            });
        }
        if stored.payload == resource.payload {
            debug!(resource_id = %stored.id, "payload unchanged");
            return Ok(stored);
        }

        stored.payload = resource.payload;
        stored.version += 1;
        stored.updated_at = Utc::now();
        self.store
            .replace_resource_with_event(&stored, &Event::new(stored.id, EventType::Update))
            .await?;
        Ok(stored)
    }

    /// Apply a status reported by an agent.
    ///
    /// Returns the stored resource and whether its status changed. Reports
    /// for another spec version, identical statuses, and reports whose
    /// `sequenceId` is not newer than the stored one are ignored.
    pub async fn update_status(&self, reported: &Resource) -> Result<(Resource, bool)> {
        let guard = lock::acquire(
            &self.locks,
            &reported.id.to_string(),
            LockClass::ResourceStatus,
        )
        .await?;
        let result = self.update_status_locked(reported).await;
        guard.release().await;
        result
    }

    async fn update_status_locked(&self, reported: &Resource) -> Result<(Resource, bool)> {
        let mut stored = self.get(reported.id).await?;
        if stored.version != reported.version {
            debug!(
                resource_id = %stored.id,
                stored = stored.version,
                reported = reported.version,
                "status reported for another version"
            );
            return Ok((stored, false));
        }
        if stored.status == reported.status {
            return Ok((stored, false));
        }
        if let (Some(current), Some(incoming)) =
            (stored.status_sequence_id(), reported.status_sequence_id())
        {
            if incoming <= current {
                debug!(resource_id = %stored.id, current, incoming, "stale status sequence");
                return Ok((stored, false));
            }
        }

        stored.status = reported.status.clone();
        stored.updated_at = Utc::now();
        self.store.replace_resource(&stored).await?;
        Ok((stored, true))
    }

    /// Flag a resource for removal and queue the delete for its consumer
    pub async fn mark_as_deleting(&self, id: Uuid) -> Result<Resource> {
        let guard = lock::acquire(&self.locks, &id.to_string(), LockClass::Resources).await?;
        let result = self.mark_as_deleting_locked(id).await;
        guard.release().await;
        result
    }

    async fn mark_as_deleting_locked(&self, id: Uuid) -> Result<Resource> {
        let mut stored = self.get(id).await?;
        if stored.is_deleting() {
            return Ok(stored);
        }
        let now = Utc::now();
        stored.deleted_at = Some(now);
        stored.updated_at = now;
        self.store
            .replace_resource_with_event(&stored, &Event::new(id, EventType::Delete))
            .await?;
        info!(resource_id = %id, "resource marked as deleting");
        Ok(stored)
    }

    /// Remove the row; used once the agent confirmed the delete
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_resource(id).await? {
            debug!(resource_id = %id, "resource already removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockFactory;
    use crate::model::{Instance, StatusEvent};
    use crate::store::{
        EventInstanceStore, EventStore, InstanceStore, MemoryStore, ResourceStore,
        StatusEventStore,
    };
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use serde_json::json;

    fn service() -> (ResourceService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let service = ResourceService::new(store.clone(), Arc::new(MemoryLockFactory::new()));
        (service, store)
    }

    async fn event_types(store: &MemoryStore) -> Vec<EventType> {
        store
            .find_unreconciled_events()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_create_starts_at_version_one() {
        let (service, store) = service();
        let created = service
            .create(Resource::new("svc", "c1", json!({"replicas": 1})))
            .await
            .unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(event_types(&store).await, vec![EventType::Create]);
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let (service, store) = service();
        let created = service
            .create(Resource::new("svc", "c1", json!({"replicas": 1})))
            .await
            .unwrap();

        let mut change = created.clone();
        change.payload = json!({"replicas": 2});
        let updated = service.update(change.clone()).await.unwrap();
        assert_eq!(updated.version, 2);

        // the same write again carries a stale version
        let err = service.update(change).await.unwrap_err();
        assert!(matches!(err, ConvoyError::Conflict { .. }));
        assert_eq!(
            event_types(&store).await,
            vec![EventType::Create, EventType::Update]
        );
    }

    #[tokio::test]
    async fn test_unchanged_payload_is_not_an_update() {
        let (service, store) = service();
        let created = service
            .create(Resource::new("svc", "c1", json!({"replicas": 1})))
            .await
            .unwrap();
        let same = service.update(created.clone()).await.unwrap();
        assert_eq!(same.version, 1);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_update_rejected_while_deleting() {
        let (service, _) = service();
        let created = service
            .create(Resource::new("svc", "c1", json!({})))
            .await
            .unwrap();
        service.mark_as_deleting(created.id).await.unwrap();

        let mut change = created;
        change.payload = json!({"x": 1});
        assert!(matches!(
            service.update(change).await,
            Err(ConvoyError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_as_deleting_is_idempotent() {
        let (service, store) = service();
        let created = service
            .create(Resource::new("svc", "c1", json!({})))
            .await
            .unwrap();
        let first = service.mark_as_deleting(created.id).await.unwrap();
        let second = service.mark_as_deleting(created.id).await.unwrap();
        assert_eq!(first.deleted_at, second.deleted_at);
        assert_eq!(
            event_types(&store).await,
            vec![EventType::Create, EventType::Delete]
        );
    }

    #[tokio::test]
    async fn test_update_status_rules() {
        let (service, _) = service();
        let created = service
            .create(Resource::new("svc", "c1", json!({})))
            .await
            .unwrap();

        let report = created.clone().with_status(json!({"sequenceId": "2", "phase": "Applied"}));
        let (stored, updated) = service.update_status(&report).await.unwrap();
        assert!(updated);
        assert_eq!(stored.status["phase"], "Applied");

        // identical report
        let (_, updated) = service.update_status(&report).await.unwrap();
        assert!(!updated);

        // older sequence
        let old = created.clone().with_status(json!({"sequenceId": "1", "phase": "Pending"}));
        let (_, updated) = service.update_status(&old).await.unwrap();
        assert!(!updated);

        // report against another spec version
        let mut other = created.with_status(json!({"sequenceId": "3"}));
        other.version = 7;
        let (stored, updated) = service.update_status(&other).await.unwrap();
        assert!(!updated);
        assert_eq!(stored.status["phase"], "Applied");
    }

    /// Memory store whose event writes fail while `broken` is set
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ConvoyError::Storage("connection reset".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceStore for FlakyStore {
        async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>> {
            self.inner.get_resource(id).await
        }
        async fn create_resource(&self, resource: &Resource) -> Result<()> {
            self.inner.create_resource(resource).await
        }
        async fn replace_resource(&self, resource: &Resource) -> Result<()> {
            self.inner.replace_resource(resource).await
        }
        async fn create_resource_with_event(&self, resource: &Resource, event: &Event) -> Result<()> {
            self.check()?;
            self.inner.create_resource_with_event(resource, event).await
        }
        async fn replace_resource_with_event(
            &self,
            resource: &Resource,
            event: &Event,
        ) -> Result<()> {
            self.check()?;
            self.inner.replace_resource_with_event(resource, event).await
        }
        async fn delete_resource(&self, id: Uuid) -> Result<bool> {
            self.inner.delete_resource(id).await
        }
        async fn find_resources_by_source(&self, source: &str) -> Result<Vec<Resource>> {
            self.inner.find_resources_by_source(source).await
        }
        async fn find_resources_by_consumer(&self, consumer: &str) -> Result<Vec<Resource>> {
            self.inner.find_resources_by_consumer(consumer).await
        }
        async fn consumer_names(&self) -> Result<Vec<String>> {
            self.inner.consumer_names().await
        }
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn create_event(&self, event: &Event) -> Result<()> {
            self.check()?;
            self.inner.create_event(event).await
        }
        async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
            self.inner.get_event(id).await
        }
        async fn mark_event_reconciled(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
            self.inner.mark_event_reconciled(id, at).await
        }
        async fn find_unreconciled_events(&self) -> Result<Vec<Event>> {
            self.inner.find_unreconciled_events().await
        }
        async fn delete_reconciled_events(&self) -> Result<u64> {
            self.inner.delete_reconciled_events().await
        }
    }

    #[async_trait]
    impl StatusEventStore for FlakyStore {
        async fn create_status_event(&self, event: &StatusEvent) -> Result<()> {
            self.inner.create_status_event(event).await
        }
        async fn get_status_event(&self, id: Uuid) -> Result<Option<StatusEvent>> {
            self.inner.get_status_event(id).await
        }
        async fn find_status_events_unhandled_by(
            &self,
            instance_id: &str,
        ) -> Result<Vec<StatusEvent>> {
            self.inner.find_status_events_unhandled_by(instance_id).await
        }
        async fn delete_status_events(&self, ids: &[Uuid]) -> Result<u64> {
            self.inner.delete_status_events(ids).await
        }
        async fn count_status_events(&self) -> Result<u64> {
            self.inner.count_status_events().await
        }
    }

    #[async_trait]
    impl EventInstanceStore for FlakyStore {
        async fn record_event_instance(&self, event_id: Uuid, instance_id: &str) -> Result<bool> {
            self.inner.record_event_instance(event_id, instance_id).await
        }
        async fn event_instance_exists(&self, event_id: Uuid, instance_id: &str) -> Result<bool> {
            self.inner.event_instance_exists(event_id, instance_id).await
        }
        async fn instances_for_event(&self, event_id: Uuid) -> Result<Vec<String>> {
            self.inner.instances_for_event(event_id).await
        }
        async fn events_handled_by_all(&self, instance_ids: &[String]) -> Result<Vec<Uuid>> {
            self.inner.events_handled_by_all(instance_ids).await
        }
    }

    #[async_trait]
    impl InstanceStore for FlakyStore {
        async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
            self.inner.get_instance(id).await
        }
        async fn upsert_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Instance> {
            self.inner.upsert_heartbeat(id, at).await
        }
        async fn all_instances(&self) -> Result<Vec<Instance>> {
            self.inner.all_instances().await
        }
        async fn ready_instance_ids(&self) -> Result<Vec<String>> {
            self.inner.ready_instance_ids().await
        }
        async fn mark_ready(&self, ids: &[String]) -> Result<()> {
            self.inner.mark_ready(ids).await
        }
        async fn mark_unready(&self, ids: &[String]) -> Result<()> {
            self.inner.mark_unready(ids).await
        }
    }

    #[tokio::test]
    async fn test_failed_event_write_leaves_resource_untouched() {
        let store = Arc::new(FlakyStore::default());
        let service = ResourceService::new(store.clone(), Arc::new(MemoryLockFactory::new()));
        let created = service
            .create(Resource::new("svc", "c1", json!({"v": 1})))
            .await
            .unwrap();

        store.broken.store(true, Ordering::SeqCst);
        let mut change = created.clone();
        change.payload = json!({"v": 2});
        assert!(matches!(
            service.update(change.clone()).await,
            Err(ConvoyError::Storage(_))
        ));
        assert!(service.mark_as_deleting(created.id).await.is_err());

        let stored = service.get(created.id).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.payload, json!({"v": 1}));
        assert!(!stored.is_deleting());
        assert_eq!(event_types(&store.inner).await, vec![EventType::Create]);

        // the client retries with the version it read
        store.broken.store(false, Ordering::SeqCst);
        let updated = service.update(change).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(
            event_types(&store.inner).await,
            vec![EventType::Create, EventType::Update]
        );

        store.broken.store(true, Ordering::SeqCst);
        assert!(service
            .create(Resource::new("svc", "c2", json!({})))
            .await
            .is_err());
        assert!(service.find_by_consumer("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_resource() {
        let (service, _) = service();
        let id = Uuid::new_v4();
        assert!(service.get(id).await.unwrap_err().is_not_found());
        assert!(service
            .update_status(&Resource::new("svc", "c1", json!({})))
            .await
            .unwrap_err()
            .is_not_found());
        service.delete(id).await.unwrap();
    }
}
