//! Status event controller
//!
//! Subscribers live in each process, so every replica fans every status
//! event out to its own subscribers and records that it did. A blocking
//! lock on the consumer keeps fan-out for one consumer in order across
//! the fleet. Rows recorded by every ready replica are purged.

use super::{jittered, listen_for_ids, work_queue, Handler};
use crate::config::ControllerConfig;
use crate::error::{ConvoyError, Result};
use crate::lock::{self, LockClass, LockFactory};
use crate::model::{StatusEvent, StatusEventType};
use crate::notify::{channels, Notifier};
use crate::observability::ControllerMetrics;
use crate::queue::WorkQueue;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONTROLLER: &str = "status_events";

pub struct StatusController {
    instance_id: String,
    store: Arc<dyn Store>,
    locks: Arc<dyn LockFactory>,
    notifier: Arc<dyn Notifier>,
    handlers: HashMap<StatusEventType, Vec<Handler>>,
    queue: WorkQueue<Uuid>,
    config: ControllerConfig,
}

impl StatusController {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn Store>,
        locks: Arc<dyn LockFactory>,
        notifier: Arc<dyn Notifier>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            locks,
            notifier,
            handlers: HashMap::new(),
            queue: work_queue(&config),
            config,
        }
    }

    /// Append handlers for `event_type`; they receive the status event id
    pub fn add(&mut self, event_type: StatusEventType, handlers: Vec<Handler>) -> &mut Self {
        self.handlers.entry(event_type).or_default().extend(handlers);
        self
    }

    pub fn enqueue(&self, event_id: Uuid) {
        self.queue.add(event_id);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub async fn handle_status_event(&self, event_id: Uuid) -> Result<()> {
        let Some(event) = self.store.get_status_event(event_id).await? else {
            debug!(%event_id, "status event no longer exists");
            return Ok(());
        };
        if self
            .store
            .event_instance_exists(event_id, &self.instance_id)
            .await?
        {
            debug!(%event_id, "status event already handled here");
            return Ok(());
        }

        let guard =
            lock::acquire(&self.locks, &event.consumer_name, LockClass::StatusEvents).await?;
        let result = self.run_handlers(&event).await;
        guard.release().await;
        result
    }

    async fn run_handlers(&self, event: &StatusEvent) -> Result<()> {
        let Some(chain) = self.handlers.get(&event.status_event_type) else {
            warn!(event_id = %event.id, event_type = %event.status_event_type, "no handlers registered");
            return Ok(());
        };
        for handler in chain {
            handler(event.id).await.map_err(|e| ConvoyError::Handler {
                kind: event.status_event_type.to_string(),
                event_id: event.id,
                reason: e.to_string(),
            })?;
        }
        ControllerMetrics::increment_handled(CONTROLLER);
        debug!(
            event_id = %event.id,
            consumer = %event.consumer_name,
            event_type = %event.status_event_type,
            "status event handled"
        );
        Ok(())
    }

    /// Delete status events every ready instance has handled. Returns the
    /// number of rows removed.
    pub async fn purge(&self) -> Result<u64> {
        let ready = self.store.ready_instance_ids().await?;
        if ready.is_empty() {
            return Ok(0);
        }
        let handled = self.store.events_handled_by_all(&ready).await?;
        let mut purged = 0;
        for batch in handled.chunks(self.config.purge_batch_size.max(1)) {
            purged += self.store.delete_status_events(batch).await?;
        }
        if purged > 0 {
            ControllerMetrics::add_purged(CONTROLLER, purged);
            debug!(purged, "handled status events removed");
        }
        Ok(purged)
    }

    /// Purge, then queue every status event this instance has not handled.
    /// Returns the number queued.
    pub async fn sync(&self) -> Result<usize> {
        let started = Instant::now();
        self.purge().await?;
        let pending = self
            .store
            .find_status_events_unhandled_by(&self.instance_id)
            .await?;
        for event in &pending {
            self.queue.add(event.id);
        }
        ControllerMetrics::record_sync(CONTROLLER, started.elapsed());
        ControllerMetrics::set_queue_depth(CONTROLLER, self.queue.len());
        Ok(pending.len())
    }

    async fn worker(self: Arc<Self>) {
        while let Some(event_id) = self.queue.get().await {
            match self.handle_status_event(event_id).await {
                Ok(()) => self.queue.forget(&event_id),
                Err(e) => {
                    error!(%event_id, "failed to handle status event: {}", e);
                    ControllerMetrics::increment_retries(CONTROLLER);
                    self.queue.add_rate_limited(event_id);
                }
            }
            self.queue.done(&event_id);
            ControllerMetrics::set_queue_depth(CONTROLLER, self.queue.len());
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        listen_for_ids(
            self.notifier.clone(),
            channels::STATUS_EVENTS,
            self.queue.clone(),
            cancel.clone(),
        );
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|_| tokio::spawn(self.clone().worker()))
            .collect();
        info!(instance_id = %self.instance_id, "status controller started");

        loop {
            if let Err(e) = self.sync().await {
                error!("status event sync failed: {}", e);
            }
            let wait = jittered(self.config.sync_interval, self.config.sync_jitter);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.queue.shut_down();
        for worker in workers {
            let _ = worker.await;
        }
        info!("status controller stopped");
    }
}
