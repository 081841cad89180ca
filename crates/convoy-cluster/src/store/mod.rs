//! Durable store
//!
//! The relational tables are the single source of truth and the only
//! medium replicas coordinate through. Each table is exposed as its own
//! async trait; [`Store`] bundles them so components can hold a single
//! `Arc<dyn Store>`.
//!
//! Two backends are provided:
//! - [`PgStore`]: PostgreSQL through a deadpool connection pool
//! - [`MemoryStore`]: process-local tables for tests and single-replica runs
//!
//! Creating an event or a status event announces the new id on the
//! matching notification channel (see [`crate::notify::channels`]).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, SCHEMA};

use crate::error::Result;
use crate::model::{Event, Instance, Resource, StatusEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Resource rows
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a resource, including one that is being deleted
    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>>;

    async fn create_resource(&self, resource: &Resource) -> Result<()>;

    /// Overwrite every mutable column of an existing resource
    async fn replace_resource(&self, resource: &Resource) -> Result<()>;

    /// Insert a resource and append its event in one transaction
    async fn create_resource_with_event(&self, resource: &Resource, event: &Event) -> Result<()>;

    /// Replace a resource and append its event in one transaction.
    ///
    /// Neither row is written when either write fails.
    async fn replace_resource_with_event(&self, resource: &Resource, event: &Event)
        -> Result<()>;

    /// Hard delete; returns whether a row was removed
    async fn delete_resource(&self, id: Uuid) -> Result<bool>;

    async fn find_resources_by_source(&self, source: &str) -> Result<Vec<Resource>>;

    async fn find_resources_by_consumer(&self, consumer: &str) -> Result<Vec<Resource>>;

    /// Distinct consumer names that own at least one resource
    async fn consumer_names(&self) -> Result<Vec<String>>;
}

/// Spec-side event log
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event and announce it on the `events` channel
    async fn create_event(&self, event: &Event) -> Result<()>;

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>>;

    async fn mark_event_reconciled(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn find_unreconciled_events(&self) -> Result<Vec<Event>>;

    /// Prune handled events and their `event_instances` records; returns
    /// the number of events removed
    async fn delete_reconciled_events(&self) -> Result<u64>;
}

/// Status-side event log
#[async_trait]
pub trait StatusEventStore: Send + Sync {
    /// Append a status event and announce it on the `status_events` channel
    async fn create_status_event(&self, event: &StatusEvent) -> Result<()>;

    async fn get_status_event(&self, id: Uuid) -> Result<Option<StatusEvent>>;

    /// Status events without an `event_instances` record for `instance_id`
    async fn find_status_events_unhandled_by(&self, instance_id: &str)
        -> Result<Vec<StatusEvent>>;

    /// Delete status events and their instance records
    async fn delete_status_events(&self, ids: &[Uuid]) -> Result<u64>;

    async fn count_status_events(&self) -> Result<u64>;
}

/// `(event, instance)` delivery records
#[async_trait]
pub trait EventInstanceStore: Send + Sync {
    /// Record that `instance_id` handled `event_id`; false if already recorded
    async fn record_event_instance(&self, event_id: Uuid, instance_id: &str) -> Result<bool>;

    async fn event_instance_exists(&self, event_id: Uuid, instance_id: &str) -> Result<bool>;

    async fn instances_for_event(&self, event_id: Uuid) -> Result<Vec<String>>;

    /// Events recorded by every one of `instance_ids`. Empty input yields nothing.
    async fn events_handled_by_all(&self, instance_ids: &[String]) -> Result<Vec<Uuid>>;
}

/// Replica heartbeat rows
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>>;

    /// Create the row (not ready) on first use, otherwise bump the heartbeat
    async fn upsert_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Instance>;

    async fn all_instances(&self) -> Result<Vec<Instance>>;

    async fn ready_instance_ids(&self) -> Result<Vec<String>>;

    async fn mark_ready(&self, ids: &[String]) -> Result<()>;

    async fn mark_unready(&self, ids: &[String]) -> Result<()>;
}

/// Every table of the coordination schema
pub trait Store:
    ResourceStore + EventStore + StatusEventStore + EventInstanceStore + InstanceStore
{
}

impl<T> Store for T where
    T: ResourceStore + EventStore + StatusEventStore + EventInstanceStore + InstanceStore
{
}
