//! Wiring of one replica
//!
//! [`CoordinatorContext`] is assembled once at startup from the four
//! infrastructure pieces (store, locks, notifier, broker) and hands the
//! same instances to every component. [`CoordinatorContext::start`]
//! spawns the background tasks; they all stop on one cancellation token.

use crate::broadcast::Broadcaster;
use crate::broker::{MemoryBroker, ResourceActionHandler, ResyncRequestHandler, SourceClient};
use crate::config::{CoordinatorConfig, EventFilterMode};
use crate::controller::{
    handler, EventController, EventFilter, EventPredicate, LockBasedEventFilter,
    PredicatedEventFilter, StatusController,
};
use crate::dispatcher::{self, Dispatcher};
use crate::error::Result;
use crate::event_server::EventServer;
use crate::health::HealthCheck;
use crate::lock::{LockFactory, MemoryLockFactory, PgLockFactory, SubscriptionGatedLockFactory};
use crate::model::{EventType, StatusEventType};
use crate::notify::{MemoryNotifier, Notifier, PgNotifier};
use crate::pulse::LivenessTracker;
use crate::resync::ResyncNegotiator;
use crate::service::ResourceService;
use crate::store::{MemoryStore, PgStore, Store};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub struct CoordinatorContext {
    pub config: CoordinatorConfig,
    pub store: Arc<dyn Store>,
    pub locks: Arc<dyn LockFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub broker: Arc<dyn SourceClient>,
    pub broadcaster: Broadcaster,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub resources: Arc<ResourceService>,
    pub resync: Arc<ResyncNegotiator>,
    pub event_server: Arc<EventServer>,
    pub event_controller: Arc<EventController>,
    pub status_controller: Arc<StatusController>,
    pub liveness: Arc<LivenessTracker>,
    pub health: Arc<HealthCheck>,
}

impl CoordinatorContext {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn Store>,
        locks: Arc<dyn LockFactory>,
        notifier: Arc<dyn Notifier>,
        broker: Arc<dyn SourceClient>,
    ) -> Result<Self> {
        config.validate()?;
        let instance_id = config.instance_id.clone();

        let broadcaster = Broadcaster::default();
        let dispatcher = dispatcher::for_mode(
            config.subscription_mode,
            &instance_id,
            store.clone(),
            notifier.clone(),
            broker.clone(),
            config.hash_ring,
            config.dispatcher.clone(),
        );
        let resources = Arc::new(ResourceService::new(store.clone(), locks.clone()));
        let resync = Arc::new(ResyncNegotiator::new(
            resources.clone(),
            broadcaster.clone(),
            broker.clone(),
        ));
        let event_server = Arc::new(EventServer::new(
            &instance_id,
            store.clone(),
            resources.clone(),
            broker.clone(),
            broadcaster.clone(),
            dispatcher.clone(),
        ));

        let filter: Arc<dyn EventFilter> = match config.controller.event_filter {
            EventFilterMode::Lock => Arc::new(LockBasedEventFilter::new(locks.clone(), store.clone())),
            EventFilterMode::RoutedLock => {
                let routed = SubscriptionGatedLockFactory::new(locks.clone(), store.clone(), broker.clone());
                Arc::new(LockBasedEventFilter::new(Arc::new(routed), store.clone()))
            }
            EventFilterMode::Predicate => {
                let server = event_server.clone();
                let predicate: EventPredicate =
                    Arc::new(move |id: Uuid| -> BoxFuture<'static, Result<bool>> {
                        let server = server.clone();
                        Box::pin(async move { server.predicate_event(id).await })
                    });
                Arc::new(PredicatedEventFilter::new(&instance_id, store.clone(), predicate))
            }
        };

        let mut event_controller = EventController::new(
            store.clone(),
            notifier.clone(),
            filter,
            config.controller.clone(),
        );
        for event_type in [EventType::Create, EventType::Update, EventType::Delete] {
            let server = event_server.clone();
            event_controller.add(
                event_type,
                vec![handler(move |resource_id| {
                    let server = server.clone();
                    async move {
                        match event_type {
                            EventType::Create => server.on_create(resource_id).await,
                            EventType::Update => server.on_update(resource_id).await,
                            EventType::Delete => server.on_delete(resource_id).await,
                        }
                    }
                })],
            );
        }

        let mut status_controller = StatusController::new(
            &instance_id,
            store.clone(),
            locks.clone(),
            notifier.clone(),
            config.controller.clone(),
        );
        for event_type in [StatusEventType::StatusUpdate, StatusEventType::StatusDelete] {
            let server = event_server.clone();
            status_controller.add(
                event_type,
                vec![handler(move |status_event_id| {
                    let server = server.clone();
                    async move { server.on_status_update(status_event_id).await }
                })],
            );
        }

        let liveness = Arc::new(LivenessTracker::new(
            &instance_id,
            store.clone(),
            locks.clone(),
            notifier.clone(),
            dispatcher.clone(),
            config.pulse.clone(),
        ));
        let health = Arc::new(HealthCheck::new(&instance_id, store.clone()));

        Ok(Self {
            config,
            store,
            locks,
            notifier,
            broker,
            broadcaster,
            dispatcher,
            resources,
            resync,
            event_server,
            event_controller: Arc::new(event_controller),
            status_controller: Arc::new(status_controller),
            liveness,
            health,
        })
    }

    /// Single-process context over in-memory tables and locks
    pub fn in_memory(config: CoordinatorConfig, broker: &MemoryBroker) -> Result<Self> {
        let notifier = MemoryNotifier::new();
        let store = Arc::new(MemoryStore::new(notifier.clone()));
        let client = broker.client(config.instance_id.clone());
        Self::new(
            config,
            store,
            Arc::new(MemoryLockFactory::new()),
            Arc::new(notifier),
            Arc::new(client),
        )
    }

    /// Context over PostgreSQL; creates the schema when missing
    pub async fn postgres(config: CoordinatorConfig, broker: Arc<dyn SourceClient>) -> Result<Self> {
        let store = PgStore::connect(&config.database)?;
        store.bootstrap().await?;
        let locks = PgLockFactory::new(store.pool().clone());
        let notifier = PgNotifier::new(&config.database, store.pool().clone());
        Self::new(
            config,
            Arc::new(store),
            Arc::new(locks),
            Arc::new(notifier),
            broker,
        )
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Route agent messages and resync requests to this replica
    pub async fn subscribe(&self) -> Result<()> {
        let handler: Arc<dyn ResourceActionHandler> = self.event_server.clone();
        self.broker.subscribe(handler).await?;
        let resync: Arc<dyn ResyncRequestHandler> = self.resync.clone();
        self.broker.subscribe_resync(resync).await
    }

    /// Subscribe to the broker and spawn every background task
    pub async fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        self.subscribe().await?;

        let tasks = vec![
            tokio::spawn(self.dispatcher.clone().run(cancel.clone())),
            tokio::spawn(self.liveness.clone().run(cancel.clone())),
            tokio::spawn(self.event_controller.clone().run(cancel.clone())),
            tokio::spawn(self.status_controller.clone().run(cancel.clone())),
        ];
        info!(
            instance_id = %self.config.instance_id,
            subscription_mode = %self.config.subscription_mode,
            "coordinator started"
        );
        Ok(tasks)
    }
}
