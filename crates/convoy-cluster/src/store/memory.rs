//! In-memory store
//!
//! Several replicas in one process can share a single `MemoryStore`
//! (behind an `Arc`) to exercise fleet behavior without a database.

use super::{EventInstanceStore, EventStore, InstanceStore, ResourceStore, StatusEventStore};
use crate::error::{ConvoyError, Result};
use crate::model::{Event, Instance, Resource, StatusEvent};
use crate::notify::{channels, MemoryNotifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    resources: HashMap<Uuid, Resource>,
    events: HashMap<Uuid, Event>,
    status_events: HashMap<Uuid, StatusEvent>,
    event_instances: HashMap<(Uuid, String), DateTime<Utc>>,
    instances: HashMap<String, Instance>,
}

/// Process-local implementation of every store trait
pub struct MemoryStore {
    tables: RwLock<Tables>,
    notifier: MemoryNotifier,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryNotifier::new())
    }
}

impl MemoryStore {
    /// Create a store announcing inserts on `notifier`
    pub fn new(notifier: MemoryNotifier) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            notifier,
        }
    }

    pub fn notifier(&self) -> &MemoryNotifier {
        &self.notifier
    }

    /// Number of event rows, handled or not
    pub fn event_count(&self) -> usize {
        self.tables.read().events.len()
    }

    /// All status events, oldest first
    pub fn status_events(&self) -> Vec<StatusEvent> {
        let mut events: Vec<_> = self.tables.read().status_events.values().cloned().collect();
        events.sort_by_key(|e| e.created_at);
        events
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(self.tables.read().resources.get(&id).cloned())
    }

    async fn create_resource(&self, resource: &Resource) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.resources.contains_key(&resource.id) {
            return Err(ConvoyError::Conflict {
                id: resource.id,
                reason: "resource already exists".into(),
            });
        }
        tables.resources.insert(resource.id, resource.clone());
        Ok(())
    }

    async fn replace_resource(&self, resource: &Resource) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.resources.get_mut(&resource.id) {
            Some(existing) => {
                *existing = resource.clone();
                Ok(())
            }
            None => Err(ConvoyError::not_found("resource", resource.id)),
        }
    }

    async fn create_resource_with_event(&self, resource: &Resource, event: &Event) -> Result<()> {
        {
            let mut tables = self.tables.write();
            if tables.resources.contains_key(&resource.id) {
                return Err(ConvoyError::Conflict {
                    id: resource.id,
                    reason: "resource already exists".into(),
                });
            }
            tables.resources.insert(resource.id, resource.clone());
            tables.events.insert(event.id, event.clone());
        }
        self.notifier.publish(channels::EVENTS, &event.id.to_string());
        Ok(())
    }

    async fn replace_resource_with_event(&self, resource: &Resource, event: &Event) -> Result<()> {
        {
            let mut tables = self.tables.write();
            match tables.resources.get_mut(&resource.id) {
                Some(existing) => *existing = resource.clone(),
                None => return Err(ConvoyError::not_found("resource", resource.id)),
            }
            tables.events.insert(event.id, event.clone());
        }
        self.notifier.publish(channels::EVENTS, &event.id.to_string());
        Ok(())
    }

    async fn delete_resource(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables.write().resources.remove(&id).is_some())
    }

    async fn find_resources_by_source(&self, source: &str) -> Result<Vec<Resource>> {
        let mut found: Vec<_> = self
            .tables
            .read()
            .resources
            .values()
            .filter(|r| r.source == source)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn find_resources_by_consumer(&self, consumer: &str) -> Result<Vec<Resource>> {
        let mut found: Vec<_> = self
            .tables
            .read()
            .resources
            .values()
            .filter(|r| r.consumer_name == consumer)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn consumer_names(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .tables
            .read()
            .resources
            .values()
            .map(|r| r.consumer_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_event(&self, event: &Event) -> Result<()> {
        self.tables.write().events.insert(event.id, event.clone());
        self.notifier.publish(channels::EVENTS, &event.id.to_string());
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.tables.read().events.get(&id).cloned())
    }

    async fn mark_event_reconciled(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        match self.tables.write().events.get_mut(&id) {
            Some(event) => {
                event.reconciled_at = Some(at);
                Ok(())
            }
            None => Err(ConvoyError::not_found("event", id)),
        }
    }

    async fn find_unreconciled_events(&self) -> Result<Vec<Event>> {
        let mut events: Vec<_> = self
            .tables
            .read()
            .events
            .values()
            .filter(|e| !e.is_reconciled())
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn delete_reconciled_events(&self) -> Result<u64> {
        let mut tables = self.tables.write();
        let purged: HashSet<Uuid> = tables
            .events
            .values()
            .filter(|e| e.is_reconciled())
            .map(|e| e.id)
            .collect();
        tables.events.retain(|id, _| !purged.contains(id));
        tables
            .event_instances
            .retain(|(event_id, _), _| !purged.contains(event_id));
        Ok(purged.len() as u64)
    }
}

#[async_trait]
impl StatusEventStore for MemoryStore {
    async fn create_status_event(&self, event: &StatusEvent) -> Result<()> {
        self.tables
            .write()
            .status_events
            .insert(event.id, event.clone());
        self.notifier
            .publish(channels::STATUS_EVENTS, &event.id.to_string());
        Ok(())
    }

    async fn get_status_event(&self, id: Uuid) -> Result<Option<StatusEvent>> {
        Ok(self.tables.read().status_events.get(&id).cloned())
    }

    async fn find_status_events_unhandled_by(
        &self,
        instance_id: &str,
    ) -> Result<Vec<StatusEvent>> {
        let tables = self.tables.read();
        let mut events: Vec<_> = tables
            .status_events
            .values()
            .filter(|e| {
                !tables
                    .event_instances
                    .contains_key(&(e.id, instance_id.to_string()))
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn delete_status_events(&self, ids: &[Uuid]) -> Result<u64> {
        let mut tables = self.tables.write();
        let removed: HashSet<Uuid> = ids
            .iter()
            .filter(|id| tables.status_events.remove(id).is_some())
            .copied()
            .collect();
        tables
            .event_instances
            .retain(|(event_id, _), _| !removed.contains(event_id));
        Ok(removed.len() as u64)
    }

    async fn count_status_events(&self) -> Result<u64> {
        Ok(self.tables.read().status_events.len() as u64)
    }
}

#[async_trait]
impl EventInstanceStore for MemoryStore {
    async fn record_event_instance(&self, event_id: Uuid, instance_id: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        let key = (event_id, instance_id.to_string());
        if tables.event_instances.contains_key(&key) {
            return Ok(false);
        }
        tables.event_instances.insert(key, Utc::now());
        Ok(true)
    }

    async fn event_instance_exists(&self, event_id: Uuid, instance_id: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .event_instances
            .contains_key(&(event_id, instance_id.to_string())))
    }

    async fn instances_for_event(&self, event_id: Uuid) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self
            .tables
            .read()
            .event_instances
            .keys()
            .filter(|(e, _)| *e == event_id)
            .map(|(_, i)| i.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn events_handled_by_all(&self, instance_ids: &[String]) -> Result<Vec<Uuid>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        let wanted: HashSet<&String> = instance_ids.iter().collect();
        let mut seen: HashMap<Uuid, HashSet<&String>> = HashMap::new();
        for (event_id, instance_id) in tables.event_instances.keys() {
            if wanted.contains(instance_id) {
                seen.entry(*event_id).or_default().insert(instance_id);
            }
        }
        let mut ids: Vec<Uuid> = seen
            .into_iter()
            .filter(|(_, instances)| instances.len() == wanted.len())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.tables.read().instances.get(id).cloned())
    }

    async fn upsert_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Instance> {
        let mut tables = self.tables.write();
        let instance = tables
            .instances
            .entry(id.to_string())
            .or_insert_with(|| Instance {
                id: id.to_string(),
                last_heartbeat: at,
                ready: false,
            });
        instance.last_heartbeat = at;
        Ok(instance.clone())
    }

    async fn all_instances(&self) -> Result<Vec<Instance>> {
        let mut instances: Vec<_> = self.tables.read().instances.values().cloned().collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn ready_instance_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self
            .tables
            .read()
            .instances
            .values()
            .filter(|i| i.ready)
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn mark_ready(&self, ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write();
        for id in ids {
            if let Some(instance) = tables.instances.get_mut(id) {
                instance.ready = true;
            }
        }
        Ok(())
    }

    async fn mark_unready(&self, ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write();
        for id in ids {
            if let Some(instance) = tables.instances.get_mut(id) {
                instance.ready = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_event_lifecycle() {
        let store = MemoryStore::default();
        let resource = Resource::new("svc", "cluster-1", json!({}));
        let event = Event::new(resource.id, EventType::Create);
        store.create_event(&event).await.unwrap();

        assert_eq!(store.find_unreconciled_events().await.unwrap().len(), 1);
        store
            .mark_event_reconciled(event.id, Utc::now())
            .await
            .unwrap();
        assert!(store.find_unreconciled_events().await.unwrap().is_empty());
        assert_eq!(store.delete_reconciled_events().await.unwrap(), 1);
        assert!(store.get_event(event.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_drops_event_instance_records() {
        let store = MemoryStore::default();
        let done = Event::new(Uuid::new_v4(), EventType::Update);
        let pending = Event::new(Uuid::new_v4(), EventType::Update);
        store.create_event(&done).await.unwrap();
        store.create_event(&pending).await.unwrap();
        for instance in ["a", "b"] {
            store.record_event_instance(done.id, instance).await.unwrap();
        }
        store.record_event_instance(pending.id, "a").await.unwrap();
        store.mark_event_reconciled(done.id, Utc::now()).await.unwrap();

        assert_eq!(store.delete_reconciled_events().await.unwrap(), 1);
        assert!(store.instances_for_event(done.id).await.unwrap().is_empty());
        assert_eq!(store.instances_for_event(pending.id).await.unwrap(), vec!["a"]);
        let ready = vec!["a".to_string(), "b".to_string()];
        assert!(store.events_handled_by_all(&ready).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resource_and_event_written_together() {
        let store = MemoryStore::default();
        let mut resource = Resource::new("svc", "cluster-1", json!({"v": 1}));
        let created = Event::new(resource.id, EventType::Create);
        store
            .create_resource_with_event(&resource, &created)
            .await
            .unwrap();

        // a duplicate insert writes neither row
        let again = Event::new(resource.id, EventType::Create);
        assert!(store
            .create_resource_with_event(&resource, &again)
            .await
            .is_err());
        assert!(store.get_event(again.id).await.unwrap().is_none());

        resource.version = 2;
        let updated = Event::new(resource.id, EventType::Update);
        store
            .replace_resource_with_event(&resource, &updated)
            .await
            .unwrap();
        assert_eq!(store.event_count(), 2);

        // replacing a missing resource appends no event
        let orphan = Resource::new("svc", "cluster-1", json!({}));
        let lost = Event::new(orphan.id, EventType::Update);
        assert!(store
            .replace_resource_with_event(&orphan, &lost)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_event_instances_are_idempotent() {
        let store = MemoryStore::default();
        let id = Uuid::new_v4();
        assert!(store.record_event_instance(id, "a").await.unwrap());
        assert!(!store.record_event_instance(id, "a").await.unwrap());
        assert!(store.event_instance_exists(id, "a").await.unwrap());
        assert_eq!(store.instances_for_event(id).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_events_handled_by_all() {
        let store = MemoryStore::default();
        let both = Uuid::new_v4();
        let one = Uuid::new_v4();
        store.record_event_instance(both, "a").await.unwrap();
        store.record_event_instance(both, "b").await.unwrap();
        store.record_event_instance(one, "a").await.unwrap();
        // records from instances outside the ready set do not count
        store.record_event_instance(one, "dead").await.unwrap();

        let ready = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.events_handled_by_all(&ready).await.unwrap(), vec![both]);
        assert!(store.events_handled_by_all(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_upsert_keeps_readiness() {
        let store = MemoryStore::default();
        let created = store.upsert_heartbeat("a", Utc::now()).await.unwrap();
        assert!(!created.ready);

        store.mark_ready(&["a".to_string()]).await.unwrap();
        let bumped = store.upsert_heartbeat("a", Utc::now()).await.unwrap();
        assert!(bumped.ready);
        assert_eq!(store.ready_instance_ids().await.unwrap(), vec!["a"]);

        store.mark_unready(&["a".to_string()]).await.unwrap();
        assert!(store.ready_instance_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_event_notifies() {
        let store = MemoryStore::default();
        let mut rx = store.notifier().subscribe(channels::EVENTS);
        let event = Event::new(Uuid::new_v4(), EventType::Update);
        store.create_event(&event).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event.id.to_string());
    }
}
