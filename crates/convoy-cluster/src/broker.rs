//! Message broker contract
//!
//! The transport moving resources to agents (MQTT, gRPC streams, ...) is
//! a collaborator. [`SourceClient`] is the surface the coordination layer
//! needs from it. [`MemoryBroker`] is an in-process implementation used by
//! tests and by the single-replica daemon.

use crate::config::SubscriptionMode;
use crate::error::{ConvoyError, Result};
use crate::model::Resource;
use crate::resync::{ResourceStatusHash, ResourceVersion};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// What a broker message asks the receiver to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
    StatusModified,
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceAction::Create => "create",
            ResourceAction::Update => "update",
            ResourceAction::Delete => "delete",
            ResourceAction::StatusModified => "status_modified",
        };
        f.write_str(s)
    }
}

/// Receives messages sent by agents
#[async_trait]
pub trait ResourceActionHandler: Send + Sync {
    async fn handle(&self, action: ResourceAction, resource: Resource) -> Result<()>;
}

/// Snapshot sent by a peer that wants to catch up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResyncRequest {
    /// A client holding these status hashes for `source`'s resources
    Status {
        source: String,
        hashes: Vec<ResourceStatusHash>,
    },
    /// An agent holding these spec versions for `consumer`
    Spec {
        consumer: String,
        versions: Vec<ResourceVersion>,
    },
}

/// Answers [`ResyncRequest`]s
#[async_trait]
pub trait ResyncRequestHandler: Send + Sync {
    /// Returns the number of resources sent back
    async fn handle_resync(&self, request: ResyncRequest) -> Result<usize>;
}

/// Source-side broker client of one replica
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Send a spec change to the resource's consumer
    async fn publish(&self, action: ResourceAction, resource: &Resource) -> Result<()>;

    /// Route agent messages to `handler`
    async fn subscribe(&self, handler: Arc<dyn ResourceActionHandler>) -> Result<()>;

    /// Route inbound resync requests to `handler`
    async fn subscribe_resync(&self, handler: Arc<dyn ResyncRequestHandler>) -> Result<()>;

    /// Ask the agents of `consumers` to resend their current statuses
    async fn resync(&self, consumers: &[String]) -> Result<()>;

    /// Fires every time the broker connection is re-established
    fn reconnected(&self) -> broadcast::Receiver<()>;

    /// Whether this replica's broker session serves `consumer`
    fn is_consumer_subscribed(&self, _consumer: &str) -> bool {
        true
    }
}

/// A message published through a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct Published {
    pub instance_id: String,
    pub action: ResourceAction,
    pub resource: Resource,
}

struct ClientState {
    instance_id: String,
    handler: RwLock<Option<Arc<dyn ResourceActionHandler>>>,
    resync_handler: RwLock<Option<Arc<dyn ResyncRequestHandler>>>,
    reconnected: broadcast::Sender<()>,
    consumers: RwLock<Option<HashSet<String>>>,
    connected: AtomicBool,
}

struct Hub {
    mode: SubscriptionMode,
    clients: RwLock<Vec<Arc<ClientState>>>,
    published: Mutex<Vec<Published>>,
    resync_requests: Mutex<Vec<(String, String)>>,
    next_shared: AtomicUsize,
}

/// In-process broker shared by the replicas of one test or process
#[derive(Clone)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
}

impl MemoryBroker {
    pub fn new(mode: SubscriptionMode) -> Self {
        Self {
            hub: Arc::new(Hub {
                mode,
                clients: RwLock::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                resync_requests: Mutex::new(Vec::new()),
                next_shared: AtomicUsize::new(0),
            }),
        }
    }

    /// Connect a replica
    pub fn client(&self, instance_id: impl Into<String>) -> MemoryBrokerClient {
        let (reconnected, _) = broadcast::channel(16);
        let state = Arc::new(ClientState {
            instance_id: instance_id.into(),
            handler: RwLock::new(None),
            resync_handler: RwLock::new(None),
            reconnected,
            consumers: RwLock::new(None),
            connected: AtomicBool::new(true),
        });
        self.hub.clients.write().push(state.clone());
        MemoryBrokerClient {
            hub: self.hub.clone(),
            state,
        }
    }

    /// Every spec message published so far
    pub fn published(&self) -> Vec<Published> {
        self.hub.published.lock().clone()
    }

    /// `(instance, consumer)` pairs of every resync request so far
    pub fn resync_requests(&self) -> Vec<(String, String)> {
        self.hub.resync_requests.lock().clone()
    }

    pub fn clear_resync_requests(&self) {
        self.hub.resync_requests.lock().clear();
    }

    /// Deliver an agent status report.
    ///
    /// Broadcast mode hands it to every connected subscriber; shared mode
    /// to exactly one, round-robin. Returns each receiver's outcome.
    pub async fn report_status(&self, resource: Resource) -> Vec<(String, Result<()>)> {
        let targets: Vec<(String, Arc<dyn ResourceActionHandler>)> = {
            let clients = self.hub.clients.read();
            let subscribed: Vec<_> = clients
                .iter()
                .filter(|c| c.connected.load(Ordering::SeqCst))
                .filter_map(|c| {
                    c.handler
                        .read()
                        .clone()
                        .map(|h| (c.instance_id.clone(), h))
                })
                .collect();
            match self.hub.mode {
                SubscriptionMode::Broadcast => subscribed,
                SubscriptionMode::Shared if subscribed.is_empty() => subscribed,
                SubscriptionMode::Shared => {
                    let idx = self.hub.next_shared.fetch_add(1, Ordering::SeqCst) % subscribed.len();
                    subscribed.into_iter().skip(idx).take(1).collect()
                }
            }
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for (instance_id, handler) in targets {
            let outcome = handler
                .handle(ResourceAction::StatusModified, resource.clone())
                .await;
            outcomes.push((instance_id, outcome));
        }
        outcomes
    }

    /// Deliver a resync request to one connected replica, round-robin.
    ///
    /// Returns the answering replica and its outcome, or `None` when no
    /// replica listens for resync requests.
    pub async fn request_resync(&self, request: ResyncRequest) -> Option<(String, Result<usize>)> {
        let (instance_id, handler) = {
            let clients = self.hub.clients.read();
            let listening: Vec<_> = clients
                .iter()
                .filter(|c| c.connected.load(Ordering::SeqCst))
                .filter_map(|c| {
                    c.resync_handler
                        .read()
                        .clone()
                        .map(|h| (c.instance_id.clone(), h))
                })
                .collect();
            if listening.is_empty() {
                return None;
            }
            let idx = self.hub.next_shared.fetch_add(1, Ordering::SeqCst) % listening.len();
            listening.into_iter().nth(idx)?
        };
        let outcome = handler.handle_resync(request).await;
        Some((instance_id, outcome))
    }

    /// Stop delivering to a replica, as if its connection dropped
    pub fn disconnect(&self, instance_id: &str) {
        for client in self.hub.clients.read().iter() {
            if client.instance_id == instance_id {
                client.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Restore a replica's connection and signal the reconnect
    pub fn reconnect(&self, instance_id: &str) {
        for client in self.hub.clients.read().iter() {
            if client.instance_id == instance_id {
                client.connected.store(true, Ordering::SeqCst);
                let _ = client.reconnected.send(());
            }
        }
    }
}

/// One replica's connection to a [`MemoryBroker`]
pub struct MemoryBrokerClient {
    hub: Arc<Hub>,
    state: Arc<ClientState>,
}

impl MemoryBrokerClient {
    /// Restrict the consumers this session serves; all by default
    pub fn set_subscribed_consumers(&self, consumers: impl IntoIterator<Item = String>) {
        *self.state.consumers.write() = Some(consumers.into_iter().collect());
    }
}

#[async_trait]
impl SourceClient for MemoryBrokerClient {
    async fn publish(&self, action: ResourceAction, resource: &Resource) -> Result<()> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(ConvoyError::Broker(format!(
                "{} is disconnected",
                self.state.instance_id
            )));
        }
        debug!(instance_id = %self.state.instance_id, %action, resource_id = %resource.id, "publish");
        self.hub.published.lock().push(Published {
            instance_id: self.state.instance_id.clone(),
            action,
            resource: resource.clone(),
        });
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn ResourceActionHandler>) -> Result<()> {
        *self.state.handler.write() = Some(handler);
        Ok(())
    }

    async fn subscribe_resync(&self, handler: Arc<dyn ResyncRequestHandler>) -> Result<()> {
        *self.state.resync_handler.write() = Some(handler);
        Ok(())
    }

    async fn resync(&self, consumers: &[String]) -> Result<()> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(ConvoyError::Broker(format!(
                "{} is disconnected",
                self.state.instance_id
            )));
        }
        let mut requests = self.hub.resync_requests.lock();
        for consumer in consumers {
            requests.push((self.state.instance_id.clone(), consumer.clone()));
        }
        Ok(())
    }

    fn reconnected(&self) -> broadcast::Receiver<()> {
        self.state.reconnected.subscribe()
    }

    fn is_consumer_subscribed(&self, consumer: &str) -> bool {
        match self.state.consumers.read().as_ref() {
            Some(consumers) => consumers.contains(consumer),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Recorder(Mutex<Vec<ResourceAction>>);

    #[async_trait]
    impl ResourceActionHandler for Recorder {
        async fn handle(&self, action: ResourceAction, _resource: Resource) -> Result<()> {
            self.0.lock().push(action);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broadcast_mode_reaches_every_subscriber() {
        let broker = MemoryBroker::new(SubscriptionMode::Broadcast);
        let a = broker.client("a");
        let b = broker.client("b");
        a.subscribe(Arc::new(Recorder(Mutex::new(vec![])))).await.unwrap();
        b.subscribe(Arc::new(Recorder(Mutex::new(vec![])))).await.unwrap();

        let outcomes = broker
            .report_status(Resource::new("svc", "c1", json!({})))
            .await;
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_mode_reaches_one_subscriber() {
        let broker = MemoryBroker::new(SubscriptionMode::Shared);
        let a = broker.client("a");
        let b = broker.client("b");
        a.subscribe(Arc::new(Recorder(Mutex::new(vec![])))).await.unwrap();
        b.subscribe(Arc::new(Recorder(Mutex::new(vec![])))).await.unwrap();

        let first = broker
            .report_status(Resource::new("svc", "c1", json!({})))
            .await;
        let second = broker
            .report_status(Resource::new("svc", "c1", json!({})))
            .await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].0, second[0].0);
    }

    #[tokio::test]
    async fn test_disconnected_client_cannot_publish() {
        let broker = MemoryBroker::new(SubscriptionMode::Shared);
        let a = broker.client("a");
        let mut reconnected = a.reconnected();
        let resource = Resource::new("svc", "c1", json!({}));

        broker.disconnect("a");
        assert!(a.publish(ResourceAction::Create, &resource).await.is_err());

        broker.reconnect("a");
        reconnected.recv().await.unwrap();
        a.publish(ResourceAction::Create, &resource).await.unwrap();
        assert_eq!(broker.published().len(), 1);
    }

    struct Counter(AtomicUsize);

    #[async_trait]
    impl ResyncRequestHandler for Counter {
        async fn handle_resync(&self, _request: ResyncRequest) -> Result<usize> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn test_resync_request_reaches_one_listener() {
        let broker = MemoryBroker::new(SubscriptionMode::Broadcast);
        let request = ResyncRequest::Spec {
            consumer: "c1".into(),
            versions: vec![],
        };
        assert!(broker.request_resync(request.clone()).await.is_none());

        let a = broker.client("a");
        let b = broker.client("b");
        a.subscribe_resync(Arc::new(Counter(AtomicUsize::new(0)))).await.unwrap();
        b.subscribe_resync(Arc::new(Counter(AtomicUsize::new(0)))).await.unwrap();

        broker.disconnect("b");
        for _ in 0..2 {
            let (answered_by, outcome) = broker.request_resync(request.clone()).await.unwrap();
            assert_eq!(answered_by, "a");
            assert!(outcome.is_ok());
        }
    }

    #[test]
    fn test_resync_request_wire_form() {
        let request = ResyncRequest::Status {
            source: "svc".into(),
            hashes: vec![],
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded, json!({"kind": "status", "source": "svc", "hashes": []}));
    }

    #[test]
    fn test_subscribed_consumers() {
        let broker = MemoryBroker::new(SubscriptionMode::Shared);
        let a = broker.client("a");
        assert!(a.is_consumer_subscribed("anything"));
        a.set_subscribed_consumers(vec!["c1".to_string()]);
        assert!(a.is_consumer_subscribed("c1"));
        assert!(!a.is_consumer_subscribed("c2"));
    }
}
