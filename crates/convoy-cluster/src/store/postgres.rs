//! PostgreSQL store

use super::{EventInstanceStore, EventStore, InstanceStore, ResourceStore, StatusEventStore};
use crate::config::DatabaseConfig;
use crate::error::{ConvoyError, Result};
use crate::hash::lock_key;
use crate::lock::LockClass;
use crate::model::{Event, EventType, Instance, Resource, StatusEvent, StatusEventType};
use crate::notify::channels;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::info;
use uuid::Uuid;

/// Coordination schema, applied idempotently by [`PgStore::bootstrap`]
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id UUID PRIMARY KEY,
    source TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    consumer_name TEXT NOT NULL,
    version BIGINT NOT NULL,
    payload JSONB NOT NULL,
    status JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    deleted_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS resources_source_idx ON resources (source);
CREATE INDEX IF NOT EXISTS resources_consumer_idx ON resources (consumer_name);

CREATE TABLE IF NOT EXISTS events (
    id UUID PRIMARY KEY,
    resource_id UUID NOT NULL,
    event_type TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    reconciled_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS events_unreconciled_idx ON events (created_at) WHERE reconciled_at IS NULL;

CREATE TABLE IF NOT EXISTS status_events (
    id UUID PRIMARY KEY,
    resource_id UUID NOT NULL,
    resource_source TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    consumer_name TEXT NOT NULL,
    payload JSONB NOT NULL,
    status JSONB NOT NULL,
    status_event_type TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS event_instances (
    event_id UUID NOT NULL,
    instance_id TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (event_id, instance_id)
);

CREATE TABLE IF NOT EXISTS server_instances (
    id TEXT PRIMARY KEY,
    last_heartbeat TIMESTAMPTZ NOT NULL,
    ready BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

const RESOURCE_COLUMNS: &str = "id, source, resource_type, consumer_name, version, payload, status, created_at, updated_at, deleted_at";
const EVENT_COLUMNS: &str = "id, resource_id, event_type, created_at, reconciled_at";
const STATUS_EVENT_COLUMNS: &str = "id, resource_id, resource_source, resource_type, consumer_name, payload, status, status_event_type, created_at";

const INSERT_RESOURCE: &str = "INSERT INTO resources (id, source, resource_type, consumer_name, version, payload, status, created_at, updated_at, deleted_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";
const REPLACE_RESOURCE: &str = "UPDATE resources SET source = $2, resource_type = $3, consumer_name = $4, \
     version = $5, payload = $6, status = $7, updated_at = $8, deleted_at = $9 WHERE id = $1";
const INSERT_EVENT: &str = "INSERT INTO events (id, resource_id, event_type, created_at, reconciled_at) \
     VALUES ($1, $2, $3, $4, $5)";

/// Store backed by a deadpool connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from `config` and wrap it
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::new(create_pool(config)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Apply [`SCHEMA`] while holding the migrations lock, so replicas
    /// starting together do not race on DDL
    pub async fn bootstrap(&self) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let key = lock_key(LockClass::Migrations.as_str());
        tx.execute("SELECT pg_advisory_xact_lock($1, $2)", &[&key, &key])
            .await?;
        tx.batch_execute(SCHEMA).await?;
        tx.commit().await?;
        info!("database schema is up to date");
        Ok(())
    }

    async fn notify(&self, client: &tokio_postgres::Client, channel: &str, id: Uuid) -> Result<()> {
        client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &id.to_string()])
            .await?;
        Ok(())
    }
}

/// Connection pool sized for lock sessions plus regular queries
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool> {
    let mut cfg = deadpool_postgres::Config::new();
    cfg.url = Some(config.url.clone());
    cfg.pool = Some(PoolConfig::new(config.pool_size));
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    Ok(cfg.create_pool(Some(Runtime::Tokio1), NoTls)?)
}

fn insert_resource_params(resource: &Resource) -> [&(dyn ToSql + Sync); 10] {
    [
        &resource.id,
        &resource.source,
        &resource.resource_type,
        &resource.consumer_name,
        &resource.version,
        &resource.payload,
        &resource.status,
        &resource.created_at,
        &resource.updated_at,
        &resource.deleted_at,
    ]
}

fn replace_resource_params(resource: &Resource) -> [&(dyn ToSql + Sync); 9] {
    [
        &resource.id,
        &resource.source,
        &resource.resource_type,
        &resource.consumer_name,
        &resource.version,
        &resource.payload,
        &resource.status,
        &resource.updated_at,
        &resource.deleted_at,
    ]
}

fn insert_error(e: tokio_postgres::Error, id: Uuid) -> ConvoyError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        ConvoyError::Conflict {
            id,
            reason: "resource already exists".into(),
        }
    } else {
        e.into()
    }
}

fn insert_event_params<'a>(
    event: &'a Event,
    event_type: &'a &'static str,
) -> [&'a (dyn ToSql + Sync); 5] {
    [
        &event.id,
        &event.resource_id,
        event_type,
        &event.created_at,
        &event.reconciled_at,
    ]
}

fn resource_from_row(row: &Row) -> Result<Resource> {
    Ok(Resource {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        resource_type: row.try_get("resource_type")?,
        consumer_name: row.try_get("consumer_name")?,
        version: row.try_get("version")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn event_from_row(row: &Row) -> Result<Event> {
    let event_type: String = row.try_get("event_type")?;
    Ok(Event {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| ConvoyError::Storage(format!("unknown event type {event_type}")))?,
        created_at: row.try_get("created_at")?,
        reconciled_at: row.try_get("reconciled_at")?,
    })
}

fn status_event_from_row(row: &Row) -> Result<StatusEvent> {
    let event_type: String = row.try_get("status_event_type")?;
    Ok(StatusEvent {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        resource_source: row.try_get("resource_source")?,
        resource_type: row.try_get("resource_type")?,
        consumer_name: row.try_get("consumer_name")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        status_event_type: StatusEventType::parse(&event_type).ok_or_else(|| {
            ConvoyError::Storage(format!("unknown status event type {event_type}"))
        })?,
        created_at: row.try_get("created_at")?,
    })
}

fn instance_from_row(row: &Row) -> Result<Instance> {
    Ok(Instance {
        id: row.try_get("id")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        ready: row.try_get("ready")?,
    })
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| resource_from_row(&row))
            .transpose()
    }

    async fn create_resource(&self, resource: &Resource) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(INSERT_RESOURCE, &insert_resource_params(resource))
            .await
            .map_err(|e| insert_error(e, resource.id))?;
        Ok(())
    }

    async fn replace_resource(&self, resource: &Resource) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(REPLACE_RESOURCE, &replace_resource_params(resource))
            .await?;
        if updated == 0 {
            return Err(ConvoyError::not_found("resource", resource.id));
        }
        Ok(())
    }

    async fn create_resource_with_event(&self, resource: &Resource, event: &Event) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute(INSERT_RESOURCE, &insert_resource_params(resource))
            .await
            .map_err(|e| insert_error(e, resource.id))?;
        tx.execute(
            INSERT_EVENT,
            &insert_event_params(event, &event.event_type.as_str()),
        )
        .await?;
        // delivered on commit only
        tx.execute(
            "SELECT pg_notify($1, $2)",
            &[&channels::EVENTS, &event.id.to_string()],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_resource_with_event(&self, resource: &Resource, event: &Event) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let updated = tx
            .execute(REPLACE_RESOURCE, &replace_resource_params(resource))
            .await?;
        if updated == 0 {
            return Err(ConvoyError::not_found("resource", resource.id));
        }
        tx.execute(
            INSERT_EVENT,
            &insert_event_params(event, &event.event_type.as_str()),
        )
        .await?;
        tx.execute(
            "SELECT pg_notify($1, $2)",
            &[&channels::EVENTS, &event.id.to_string()],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_resource(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM resources WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }

    async fn find_resources_by_source(&self, source: &str) -> Result<Vec<Resource>> {
        let client = self.pool.get().await?;
        let query =
            format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE source = $1 ORDER BY created_at");
        client
            .query(&query, &[&source])
            .await?
            .iter()
            .map(resource_from_row)
            .collect()
    }

    async fn find_resources_by_consumer(&self, consumer: &str) -> Result<Vec<Resource>> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE consumer_name = $1 ORDER BY created_at"
        );
        client
            .query(&query, &[&consumer])
            .await?
            .iter()
            .map(resource_from_row)
            .collect()
    }

    async fn consumer_names(&self) -> Result<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT DISTINCT consumer_name FROM resources ORDER BY consumer_name",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(ConvoyError::from))
            .collect()
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn create_event(&self, event: &Event) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                INSERT_EVENT,
                &insert_event_params(event, &event.event_type.as_str()),
            )
            .await?;
        self.notify(&client, channels::EVENTS, event.id).await
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| event_from_row(&row))
            .transpose()
    }

    async fn mark_event_reconciled(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE events SET reconciled_at = $2 WHERE id = $1",
                &[&id, &at],
            )
            .await?;
        if updated == 0 {
            return Err(ConvoyError::not_found("event", id));
        }
        Ok(())
    }

    async fn find_unreconciled_events(&self) -> Result<Vec<Event>> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE reconciled_at IS NULL ORDER BY created_at"
        );
        client
            .query(&query, &[])
            .await?
            .iter()
            .map(event_from_row)
            .collect()
    }

    async fn delete_reconciled_events(&self) -> Result<u64> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let purged: Vec<Uuid> = tx
            .query(
                "DELETE FROM events WHERE reconciled_at IS NOT NULL RETURNING id",
                &[],
            )
            .await?
            .iter()
            .map(|row| row.try_get(0))
            .collect::<std::result::Result<_, _>>()?;
        if !purged.is_empty() {
            tx.execute(
                "DELETE FROM event_instances WHERE event_id = ANY($1)",
                &[&purged],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(purged.len() as u64)
    }
}

#[async_trait]
impl StatusEventStore for PgStore {
    async fn create_status_event(&self, event: &StatusEvent) -> Result<()> {
        let client = self.pool.get().await?;
        let query = format!(
            "INSERT INTO status_events ({STATUS_EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        client
            .execute(
                &query,
                &[
                    &event.id,
                    &event.resource_id,
                    &event.resource_source,
                    &event.resource_type,
                    &event.consumer_name,
                    &event.payload,
                    &event.status,
                    &event.status_event_type.as_str(),
                    &event.created_at,
                ],
            )
            .await?;
        self.notify(&client, channels::STATUS_EVENTS, event.id).await
    }

    async fn get_status_event(&self, id: Uuid) -> Result<Option<StatusEvent>> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {STATUS_EVENT_COLUMNS} FROM status_events WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| status_event_from_row(&row))
            .transpose()
    }

    async fn find_status_events_unhandled_by(
        &self,
        instance_id: &str,
    ) -> Result<Vec<StatusEvent>> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {STATUS_EVENT_COLUMNS} FROM status_events s \
             WHERE NOT EXISTS ( \
                SELECT 1 FROM event_instances ei \
                WHERE ei.event_id = s.id AND ei.instance_id = $1) \
             ORDER BY created_at"
        );
        client
            .query(&query, &[&instance_id])
            .await?
            .iter()
            .map(status_event_from_row)
            .collect()
    }

    async fn delete_status_events(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute(
            "DELETE FROM event_instances WHERE event_id IN \
             (SELECT id FROM status_events WHERE id = ANY($1))",
            &[&ids],
        )
        .await?;
        let deleted = tx
            .execute("DELETE FROM status_events WHERE id = ANY($1)", &[&ids])
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn count_status_events(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM status_events", &[])
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl EventInstanceStore for PgStore {
    async fn record_event_instance(&self, event_id: Uuid, instance_id: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                "INSERT INTO event_instances (event_id, instance_id, created_at) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                &[&event_id, &instance_id, &Utc::now()],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn event_instance_exists(&self, event_id: Uuid, instance_id: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM event_instances WHERE event_id = $1 AND instance_id = $2",
                &[&event_id, &instance_id],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn instances_for_event(&self, event_id: Uuid) -> Result<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT instance_id FROM event_instances WHERE event_id = $1 ORDER BY instance_id",
                &[&event_id],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(ConvoyError::from))
            .collect()
    }

    async fn events_handled_by_all(&self, instance_ids: &[String]) -> Result<Vec<Uuid>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let wanted = instance_ids.len() as i64;
        let rows = client
            .query(
                "SELECT event_id FROM event_instances WHERE instance_id = ANY($1) \
                 GROUP BY event_id HAVING COUNT(DISTINCT instance_id) = $2 \
                 ORDER BY event_id",
                &[&instance_ids, &wanted],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(ConvoyError::from))
            .collect()
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                "SELECT id, last_heartbeat, ready FROM server_instances WHERE id = $1",
                &[&id],
            )
            .await?
            .map(|row| instance_from_row(&row))
            .transpose()
    }

    async fn upsert_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Instance> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO server_instances (id, last_heartbeat, ready) VALUES ($1, $2, FALSE) \
                 ON CONFLICT (id) DO UPDATE SET last_heartbeat = EXCLUDED.last_heartbeat \
                 RETURNING id, last_heartbeat, ready",
                &[&id, &at],
            )
            .await?;
        instance_from_row(&row)
    }

    async fn all_instances(&self) -> Result<Vec<Instance>> {
        let client = self.pool.get().await?;
        client
            .query(
                "SELECT id, last_heartbeat, ready FROM server_instances ORDER BY id",
                &[],
            )
            .await?
            .iter()
            .map(instance_from_row)
            .collect()
    }

    async fn ready_instance_ids(&self) -> Result<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id FROM server_instances WHERE ready ORDER BY id",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(ConvoyError::from))
            .collect()
    }

    async fn mark_ready(&self, ids: &[String]) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE server_instances SET ready = TRUE WHERE id = ANY($1)",
                &[&ids],
            )
            .await?;
        Ok(())
    }

    async fn mark_unready(&self, ids: &[String]) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE server_instances SET ready = FALSE WHERE id = ANY($1)",
                &[&ids],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_every_table() {
        for table in [
            "resources",
            "events",
            "status_events",
            "event_instances",
            "server_instances",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing {table}"
            );
        }
    }
}
