//! In-process fan-out of resource statuses to local subscribers
//!
//! Each subscriber owns a bounded queue drained by its own task, so a
//! slow subscriber never stalls [`Broadcaster::broadcast`] or its peers.
//! A subscriber whose queue is full, or whose callback fails, is
//! disconnected and told why on its error channel.

use crate::error::{ConvoyError, Result};
use crate::model::Resource;
use crate::observability::BroadcastMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Filter value matching every consumer
pub const ALL_CONSUMERS: &str = "*";

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub type ClientId = Uuid;

/// A local receiver of status updates, typically one client stream
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, resource: Resource) -> Result<()>;
}

struct Registration {
    consumer_filter: String,
    queue: mpsc::Sender<Resource>,
    errors: mpsc::Sender<ConvoyError>,
}

impl Registration {
    fn matches(&self, consumer: &str) -> bool {
        self.consumer_filter == ALL_CONSUMERS || self.consumer_filter == consumer
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    subscribers: Arc<DashMap<ClientId, Registration>>,
    queue_capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a subscriber for `consumer_filter` (or [`ALL_CONSUMERS`]).
    ///
    /// The returned receiver yields the reason if the broadcaster drops the
    /// subscriber, and closes once it is unregistered.
    pub fn register(
        &self,
        consumer_filter: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
    ) -> (ClientId, mpsc::Receiver<ConvoyError>) {
        let id = Uuid::new_v4();
        let (queue, mut pending) = mpsc::channel::<Resource>(self.queue_capacity);
        let (errors, error_rx) = mpsc::channel(1);

        let task_errors = errors.clone();
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            while let Some(resource) = pending.recv().await {
                match subscriber.deliver(resource).await {
                    Ok(()) => BroadcastMetrics::increment_delivered(),
                    Err(e) => {
                        warn!(client_id = %id, "subscriber failed, disconnecting: {}", e);
                        let _ = task_errors.try_send(ConvoyError::SubscriberDisconnected {
                            client: id,
                            reason: e.to_string(),
                        });
                        if subscribers.remove(&id).is_some() {
                            BroadcastMetrics::increment_disconnected("handler_error");
                            BroadcastMetrics::set_subscribers(subscribers.len());
                        }
                        return;
                    }
                }
            }
        });

        self.subscribers.insert(
            id,
            Registration {
                consumer_filter: consumer_filter.into(),
                queue,
                errors,
            },
        );
        BroadcastMetrics::set_subscribers(self.subscribers.len());
        debug!(client_id = %id, "subscriber registered");
        (id, error_rx)
    }

    /// Remove a subscriber; pending deliveries still drain
    pub fn unregister(&self, id: ClientId) {
        if self.subscribers.remove(&id).is_some() {
            BroadcastMetrics::increment_disconnected("unregistered");
            BroadcastMetrics::set_subscribers(self.subscribers.len());
            debug!(client_id = %id, "subscriber unregistered");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queue `resource` for every subscriber of its consumer. Never waits.
    pub fn broadcast(&self, resource: &Resource) {
        let mut overflowed = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.matches(&resource.consumer_name) {
                continue;
            }
            match entry.queue.try_send(resource.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*entry.key()),
                // the drain task already gave up and is removing itself
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        for id in overflowed {
            if let Some((_, registration)) = self.subscribers.remove(&id) {
                warn!(client_id = %id, "subscriber queue full, disconnecting");
                let _ = registration
                    .errors
                    .try_send(ConvoyError::SubscriberDisconnected {
                        client: id,
                        reason: "delivery queue full".into(),
                    });
                BroadcastMetrics::increment_disconnected("queue_full");
            }
        }
        BroadcastMetrics::set_subscribers(self.subscribers.len());
    }
}
