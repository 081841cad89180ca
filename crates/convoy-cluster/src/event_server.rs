//! Broker-facing handlers
//!
//! [`EventServer`] turns spec events into broker messages, folds agent
//! status reports into resources, and fans recorded status events out
//! to local subscribers.

use crate::broadcast::Broadcaster;
use crate::broker::{ResourceAction, ResourceActionHandler, SourceClient};
use crate::dispatcher::Dispatcher;
use crate::error::{ConvoyError, Result};
use crate::model::{Resource, StatusEvent, StatusEventType};
use crate::observability::DispatchMetrics;
use crate::service::ResourceService;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct EventServer {
    instance_id: String,
    store: Arc<dyn Store>,
    resources: Arc<ResourceService>,
    broker: Arc<dyn SourceClient>,
    broadcaster: Broadcaster,
    dispatcher: Arc<dyn Dispatcher>,
}

impl EventServer {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn Store>,
        resources: Arc<ResourceService>,
        broker: Arc<dyn SourceClient>,
        broadcaster: Broadcaster,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            resources,
            broker,
            broadcaster,
            dispatcher,
        }
    }

    pub async fn on_create(&self, resource_id: Uuid) -> Result<()> {
        self.publish(ResourceAction::Create, resource_id).await
    }

    pub async fn on_update(&self, resource_id: Uuid) -> Result<()> {
        self.publish(ResourceAction::Update, resource_id).await
    }

    pub async fn on_delete(&self, resource_id: Uuid) -> Result<()> {
        self.publish(ResourceAction::Delete, resource_id).await
    }

    async fn publish(&self, action: ResourceAction, resource_id: Uuid) -> Result<()> {
        let Some(resource) = self.store.get_resource(resource_id).await? else {
            // removed in the meantime; nothing left to deliver
            debug!(%resource_id, %action, "resource gone, skipping publish");
            return Ok(());
        };
        self.broker.publish(action, &resource).await?;
        debug!(%resource_id, %action, consumer = %resource.consumer_name, "resource published");
        Ok(())
    }

    /// Fold an owned agent status report into the store
    pub async fn handle_status_update(&self, reported: Resource) -> Result<()> {
        let Some(stored) = self.store.get_resource(reported.id).await? else {
            warn!(resource_id = %reported.id, "status reported for unknown resource");
            return Ok(());
        };
        if stored.consumer_name != reported.consumer_name {
            return Err(ConvoyError::ConsumerMismatch {
                id: stored.id,
                stored: stored.consumer_name,
                reported: reported.consumer_name,
            });
        }

        if reported.is_deleted_on_agent() {
            let snapshot = Resource {
                status: reported.status.clone(),
                ..stored
            };
            self.store
                .create_status_event(&StatusEvent::delete(&snapshot))
                .await?;
            self.resources.delete(snapshot.id).await?;
            info!(resource_id = %snapshot.id, consumer = %snapshot.consumer_name, "resource removed by agent");
            return Ok(());
        }

        let (resource, updated) = self.resources.update_status(&reported).await?;
        if updated {
            self.store
                .create_status_event(&StatusEvent::update(&resource))
                .await?;
        }
        Ok(())
    }

    /// Broadcast a status event locally and record that this instance did
    pub async fn on_status_update(&self, status_event_id: Uuid) -> Result<()> {
        let Some(event) = self.store.get_status_event(status_event_id).await? else {
            return Ok(());
        };
        let resource = match event.status_event_type {
            StatusEventType::StatusDelete => Some(event.snapshot_resource()),
            StatusEventType::StatusUpdate => self.store.get_resource(event.resource_id).await?,
        };
        match resource {
            Some(resource) => self.broadcaster.broadcast(&resource),
            None => debug!(%status_event_id, resource_id = %event.resource_id, "resource gone, nothing to broadcast"),
        }
        self.store
            .record_event_instance(event.id, &self.instance_id)
            .await?;
        Ok(())
    }

    /// Whether this instance should handle spec event `event_id`.
    ///
    /// An event whose resource is gone is marked reconciled on the spot.
    pub async fn predicate_event(&self, event_id: Uuid) -> Result<bool> {
        let Some(event) = self.store.get_event(event_id).await? else {
            return Ok(false);
        };
        if event.is_reconciled() {
            return Ok(false);
        }
        let Some(resource) = self.store.get_resource(event.resource_id).await? else {
            self.store.mark_event_reconciled(event_id, Utc::now()).await?;
            debug!(%event_id, "resource gone, event reconciled");
            return Ok(false);
        };
        Ok(self.broker.is_consumer_subscribed(&resource.consumer_name))
    }
}

#[async_trait]
impl ResourceActionHandler for EventServer {
    async fn handle(&self, action: ResourceAction, resource: Resource) -> Result<()> {
        match action {
            ResourceAction::StatusModified => {
                if !self.dispatcher.dispatch(&resource.consumer_name) {
                    DispatchMetrics::increment_not_owned();
                    debug!(
                        consumer = %resource.consumer_name,
                        resource_id = %resource.id,
                        "status for a consumer owned elsewhere"
                    );
                    return Ok(());
                }
                self.handle_status_update(resource).await
            }
            other => Err(ConvoyError::UnsupportedAction(other.to_string())),
        }
    }
}
