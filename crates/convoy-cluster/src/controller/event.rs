//! Spec-side event controller

use super::{jittered, listen_for_ids, work_queue, Handler};
use crate::config::ControllerConfig;
use crate::error::{ConvoyError, Result};
use crate::lock::{self, LockClass, LockFactory, LockGuard};
use crate::model::{Event, EventType};
use crate::notify::{channels, Notifier};
use crate::observability::ControllerMetrics;
use crate::queue::WorkQueue;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONTROLLER: &str = "events";

/// This replica's claim on one event, released once handling ends
pub struct Claim {
    guard: Option<LockGuard>,
}

impl Claim {
    pub fn locked(guard: LockGuard) -> Self {
        Self { guard: Some(guard) }
    }

    pub fn unlocked() -> Self {
        Self { guard: None }
    }

    pub async fn release(self) {
        if let Some(guard) = self.guard {
            guard.release().await;
        }
    }
}

/// Decides which replica handles an event and what "handled" means
#[async_trait]
pub trait EventFilter: Send + Sync {
    /// Claim `event_id` for this replica; `None` leaves it to another one
    async fn claim(&self, event_id: Uuid) -> Result<Option<Claim>>;

    /// Runs after every handler of the event succeeded
    async fn post_process(&self, event: &Event) -> Result<()>;
}

/// Whoever takes the event's advisory lock handles it, once for the fleet
pub struct LockBasedEventFilter {
    locks: Arc<dyn LockFactory>,
    store: Arc<dyn Store>,
}

impl LockBasedEventFilter {
    /// `locks` may be a [`crate::lock::SubscriptionGatedLockFactory`]
    pub fn new(locks: Arc<dyn LockFactory>, store: Arc<dyn Store>) -> Self {
        Self { locks, store }
    }
}

#[async_trait]
impl EventFilter for LockBasedEventFilter {
    async fn claim(&self, event_id: Uuid) -> Result<Option<Claim>> {
        let guard =
            lock::try_acquire(&self.locks, &event_id.to_string(), LockClass::Events).await?;
        Ok(guard.map(Claim::locked))
    }

    async fn post_process(&self, event: &Event) -> Result<()> {
        self.store.mark_event_reconciled(event.id, Utc::now()).await
    }
}

/// Async predicate over an event id
pub type EventPredicate = Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Every replica for which the predicate holds handles the event; it is
/// reconciled once all ready replicas have recorded it
pub struct PredicatedEventFilter {
    instance_id: String,
    store: Arc<dyn Store>,
    predicate: EventPredicate,
}

impl PredicatedEventFilter {
    pub fn new(instance_id: impl Into<String>, store: Arc<dyn Store>, predicate: EventPredicate) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            predicate,
        }
    }
}

#[async_trait]
impl EventFilter for PredicatedEventFilter {
    async fn claim(&self, event_id: Uuid) -> Result<Option<Claim>> {
        if (self.predicate)(event_id).await? {
            Ok(Some(Claim::unlocked()))
        } else {
            Ok(None)
        }
    }

    async fn post_process(&self, event: &Event) -> Result<()> {
        self.store
            .record_event_instance(event.id, &self.instance_id)
            .await?;
        let ready = self.store.ready_instance_ids().await?;
        if ready.is_empty() {
            return Ok(());
        }
        let recorded = self.store.instances_for_event(event.id).await?;
        if ready.iter().all(|id| recorded.contains(id)) {
            self.store.mark_event_reconciled(event.id, Utc::now()).await?;
            debug!(event_id = %event.id, "event handled by every ready instance");
        }
        Ok(())
    }
}

pub struct EventController {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    filter: Arc<dyn EventFilter>,
    handlers: HashMap<EventType, Vec<Handler>>,
    queue: WorkQueue<Uuid>,
    config: ControllerConfig,
}

impl EventController {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        filter: Arc<dyn EventFilter>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            filter,
            handlers: HashMap::new(),
            queue: work_queue(&config),
            config,
        }
    }

    /// Append handlers for `event_type`. Handlers receive the resource id
    /// and run in registration order.
    pub fn add(&mut self, event_type: EventType, handlers: Vec<Handler>) -> &mut Self {
        self.handlers.entry(event_type).or_default().extend(handlers);
        self
    }

    pub fn enqueue(&self, event_id: Uuid) {
        self.queue.add(event_id);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Claim and handle one event.
    ///
    /// `Ok` covers events claimed elsewhere, missing or already reconciled.
    pub async fn handle_event(&self, event_id: Uuid) -> Result<()> {
        let Some(claim) = self.filter.claim(event_id).await? else {
            debug!(%event_id, "event claimed elsewhere");
            return Ok(());
        };
        let result = self.handle_claimed(event_id).await;
        claim.release().await;
        result
    }

    async fn handle_claimed(&self, event_id: Uuid) -> Result<()> {
        let Some(event) = self.store.get_event(event_id).await? else {
            debug!(%event_id, "event no longer exists");
            return Ok(());
        };
        if event.is_reconciled() {
            return Ok(());
        }

        match self.handlers.get(&event.event_type) {
            Some(chain) => {
                for handler in chain {
                    handler(event.resource_id)
                        .await
                        .map_err(|e| ConvoyError::Handler {
                            kind: event.event_type.to_string(),
                            event_id,
                            reason: e.to_string(),
                        })?;
                }
            }
            None => warn!(%event_id, event_type = %event.event_type, "no handlers registered"),
        }

        self.filter.post_process(&event).await?;
        ControllerMetrics::increment_handled(CONTROLLER);
        debug!(%event_id, event_type = %event.event_type, resource_id = %event.resource_id, "event handled");
        Ok(())
    }

    /// Prune reconciled events and queue every unreconciled one.
    /// Returns the number queued.
    pub async fn sync(&self) -> Result<usize> {
        let started = Instant::now();
        let purged = self.store.delete_reconciled_events().await?;
        if purged > 0 {
            ControllerMetrics::add_purged(CONTROLLER, purged);
            debug!(purged, "reconciled events removed");
        }
        let pending = self.store.find_unreconciled_events().await?;
        for event in &pending {
            self.queue.add(event.id);
        }
        ControllerMetrics::record_sync(CONTROLLER, started.elapsed());
        ControllerMetrics::set_queue_depth(CONTROLLER, self.queue.len());
        Ok(pending.len())
    }

    async fn worker(self: Arc<Self>) {
        while let Some(event_id) = self.queue.get().await {
            match self.handle_event(event_id).await {
                Ok(()) => self.queue.forget(&event_id),
                Err(e) => {
                    let attempts = self.queue.failures(&event_id) + 1;
                    if e.is_retriable() {
                        debug!(%event_id, attempts, "event will be retried: {}", e);
                    } else {
                        error!(%event_id, attempts, "failed to handle event: {}", e);
                    }
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
            channels::EVENTS,
            self.queue.clone(),
            cancel.clone(),
        );
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|_| tokio::spawn(self.clone().worker()))
            .collect();
        info!(workers = workers.len(), "event controller started");

        loop {
            if let Err(e) = self.sync().await {
                error!("event sync failed: {}", e);
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
        info!("event controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::handler;
    use crate::lock::MemoryLockFactory;
    use crate::model::Resource;
    use crate::notify::MemoryNotifier;
    use crate::store::{EventInstanceStore, EventStore, InstanceStore, MemoryStore, ResourceStore};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        locks: Arc<MemoryLockFactory>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::default()),
                locks: Arc::new(MemoryLockFactory::new()),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn recorder(&self, name: &'static str) -> Handler {
            let log = self.log.clone();
            handler(move |_| {
                let log = log.clone();
                async move {
                    log.lock().push(name.to_string());
                    Ok(())
                }
            })
        }

        fn controller(&self) -> EventController {
            let filter = LockBasedEventFilter::new(self.locks.clone(), self.store.clone());
            let mut controller = EventController::new(
                self.store.clone(),
                Arc::new(self.store.notifier().clone()),
                Arc::new(filter),
                ControllerConfig::default(),
            );
            controller.add(
                EventType::Create,
                vec![self.recorder("first"), self.recorder("second")],
            );
            controller
        }

        async fn event(&self, event_type: EventType) -> Event {
            let resource = Resource::new("svc", "c1", json!({}));
            self.store.create_resource(&resource).await.unwrap();
            let event = Event::new(resource.id, event_type);
            self.store.create_event(&event).await.unwrap();
            event
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_order_once() {
        let fx = Fixture::new();
        let controller = fx.controller();
        let event = fx.event(EventType::Create).await;

        controller.handle_event(event.id).await.unwrap();
        controller.handle_event(event.id).await.unwrap();

        assert_eq!(*fx.log.lock(), vec!["first", "second"]);
        let stored = fx.store.get_event(event.id).await.unwrap().unwrap();
        assert!(stored.is_reconciled());
        assert_eq!(fx.locks.held_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_event_pending() {
        let fx = Fixture::new();
        let mut controller = fx.controller();
        controller.add(
            EventType::Update,
            vec![handler(|_| async { Err(ConvoyError::Broker("offline".into())) })],
        );
        let event = fx.event(EventType::Update).await;

        let err = controller.handle_event(event.id).await.unwrap_err();
        assert!(matches!(err, ConvoyError::Handler { .. }));
        assert!(!fx.store.get_event(event.id).await.unwrap().unwrap().is_reconciled());
        assert_eq!(fx.locks.held_count(), 0);
    }

    #[tokio::test]
    async fn test_locked_event_is_skipped() {
        let fx = Fixture::new();
        let controller = fx.controller();
        let event = fx.event(EventType::Create).await;

        let factory: Arc<dyn LockFactory> = fx.locks.clone();
        let held = lock::acquire(&factory, &event.id.to_string(), LockClass::Events)
            .await
            .unwrap();
        controller.handle_event(event.id).await.unwrap();
        assert!(fx.log.lock().is_empty());
        held.release().await;
    }

    #[tokio::test]
    async fn test_kind_without_handlers_is_reconciled() {
        let fx = Fixture::new();
        let controller = fx.controller();
        let event = fx.event(EventType::Delete).await;
        controller.handle_event(event.id).await.unwrap();
        assert!(fx.store.get_event(event.id).await.unwrap().unwrap().is_reconciled());
    }

    #[tokio::test]
    async fn test_sync_prunes_and_queues() {
        let fx = Fixture::new();
        let controller = fx.controller();
        let done = fx.event(EventType::Create).await;
        controller.handle_event(done.id).await.unwrap();
        fx.event(EventType::Create).await;
        fx.event(EventType::Update).await;

        assert_eq!(controller.sync().await.unwrap(), 2);
        assert_eq!(controller.queue_len(), 2);
        assert_eq!(fx.store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_predicated_filter_waits_for_all_ready() {
        let fx = Fixture::new();
        for id in ["a", "b"] {
            fx.store.upsert_heartbeat(id, Utc::now()).await.unwrap();
        }
        fx.store
            .mark_ready(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let event = fx.event(EventType::Create).await;

        let always: EventPredicate =
            Arc::new(|_: Uuid| -> BoxFuture<'static, Result<bool>> { Box::pin(async { Ok(true) }) });
        let a = PredicatedEventFilter::new("a", fx.store.clone(), always.clone());
        let b = PredicatedEventFilter::new("b", fx.store.clone(), always);

        assert!(a.claim(event.id).await.unwrap().is_some());
        a.post_process(&event).await.unwrap();
        assert!(!fx.store.get_event(event.id).await.unwrap().unwrap().is_reconciled());

        b.post_process(&event).await.unwrap();
        assert!(fx.store.get_event(event.id).await.unwrap().unwrap().is_reconciled());
    }

    #[tokio::test]
    async fn test_run_handles_notified_events() {
        let fx = Fixture::new();
        let controller = Arc::new(fx.controller());
        let cancel = CancellationToken::new();
        let running = tokio::spawn(controller.clone().run(cancel.clone()));

        // wait for the listener before announcing
        tokio::time::sleep(Duration::from_millis(50)).await;
        let event = fx.event(EventType::Create).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stored = fx.store.get_event(event.id).await.unwrap().unwrap();
                if stored.is_reconciled() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        running.await.unwrap();
    }
}
