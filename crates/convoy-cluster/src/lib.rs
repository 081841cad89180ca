//! # Convoy Cluster
//!
//! Database-backed coordination for a control plane running as several
//! replicas over one PostgreSQL database:
//! - **Advisory locks**: fleet-wide exclusive claims, blocking or try
//! - **LISTEN/NOTIFY**: wake-up hints with keep-alive and reconnect
//! - **Liveness**: heartbeat rows and a single-scanner readiness sweep
//! - **Hash ring**: bounded-load ownership of consumers among ready replicas
//! - **Controllers**: exactly-once spec events, per-replica status fan-out
//! - **Resync**: hash-diff catch-up for reconnecting clients and agents
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      Convoy replica                        │
//! ├──────────────┬──────────────┬──────────────┬───────────────┤
//! │  Controllers │  Dispatcher  │   Liveness   │  Broadcaster  │
//! │ • events     │ • hash ring  │ • heartbeat  │ • subscribers │
//! │ • status     │ • resync     │ • ready scan │ • resync      │
//! ├──────────────┴──────────────┴──────────────┴───────────────┤
//! │      Store  ·  Advisory locks  ·  Notifier  ·  Broker      │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use convoy_cluster::{CoordinatorConfig, CoordinatorContext, MemoryBroker, SubscriptionMode};
//! use tokio_util::sync::CancellationToken;
//!
//! let broker = MemoryBroker::new(SubscriptionMode::Shared);
//! let config = CoordinatorConfig::builder().instance_id("convoy-0").build();
//! let ctx = CoordinatorContext::in_memory(config, &broker)?;
//!
//! let cancel = CancellationToken::new();
//! let tasks = ctx.start(cancel.clone()).await?;
//! ctx.resources.create(resource).await?;
//! ```

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod event_server;
pub mod hash;
pub mod health;
pub mod lock;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pulse;
pub mod queue;
pub mod resync;
pub mod ring;
pub mod service;
pub mod store;

// Re-export main types
pub use broadcast::{Broadcaster, ClientId, Subscriber, ALL_CONSUMERS};
pub use broker::{
    MemoryBroker, MemoryBrokerClient, ResourceAction, ResourceActionHandler, ResyncRequest,
    ResyncRequestHandler, SourceClient,
};
pub use config::{
    ControllerConfig, CoordinatorConfig, DatabaseConfig, DispatcherConfig, EventFilterMode,
    HashRingConfig, PulseConfig, SubscriptionMode,
};
pub use controller::{EventController, StatusController};
pub use coordinator::CoordinatorContext;
pub use dispatcher::{Dispatcher, HashDispatcher, NoopDispatcher};
pub use error::{ConvoyError, Result};
pub use event_server::EventServer;
pub use health::{HealthCheck, HealthStatus};
pub use lock::{LockClass, LockFactory, LockGuard, LockOwner};
pub use model::{Event, EventInstance, EventType, Instance, Resource, StatusEvent, StatusEventType};
pub use notify::{InstanceChange, Notifier};
pub use observability::init_metrics;
pub use pulse::{LivenessScan, LivenessTracker};
pub use resync::{ResourceStatusHash, ResourceVersion, ResyncNegotiator};
pub use ring::ConsistentRing;
pub use service::ResourceService;
pub use store::{MemoryStore, PgStore, Store};
