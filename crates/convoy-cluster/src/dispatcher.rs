//! Status dispatch: which replica finalizes a consumer's status reports
//!
//! - [`HashDispatcher`] (broadcast subscriptions): every replica receives
//!   every report and keeps only consumers the hash ring assigns to it.
//! - [`NoopDispatcher`] (shared subscriptions): the broker already
//!   delivers each report once, so every report is processed.
//!
//! Whenever ownership can have moved, agents are asked to resend their
//! statuses so the new owner catches up on anything it missed.

use crate::broker::SourceClient;
use crate::config::{DispatcherConfig, HashRingConfig, SubscriptionMode};
use crate::error::Result;
use crate::notify::{channels, spawn_listener, InstanceChange, Notifier, NotifyCallback};
use crate::observability::DispatchMetrics;
use crate::queue::WorkQueue;
use crate::ring::ConsistentRing;
use crate::store::Store;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Whether this replica processes status reports from `consumer`
    fn dispatch(&self, consumer: &str) -> bool;

    async fn on_instance_up(&self, instance_id: &str) -> Result<()>;

    async fn on_instance_down(&self, instance_id: &str) -> Result<()>;

    /// Background work until `cancel` fires
    async fn run(self: Arc<Self>, cancel: CancellationToken);
}

/// Pick the dispatcher for a subscription mode
pub fn for_mode(
    mode: SubscriptionMode,
    instance_id: &str,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    broker: Arc<dyn SourceClient>,
    ring: HashRingConfig,
    config: DispatcherConfig,
) -> Arc<dyn Dispatcher> {
    match mode {
        SubscriptionMode::Broadcast => Arc::new(HashDispatcher::new(
            instance_id,
            store,
            notifier,
            broker,
            ring,
            config,
        )),
        SubscriptionMode::Shared => Arc::new(NoopDispatcher::new(store, notifier, broker)),
    }
}

/// Forward `server_instances` payloads into a channel so they are applied in order
fn instance_change_feed(
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<InstanceChange> {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_notify: NotifyCallback = Arc::new(move |payload: String| match InstanceChange::decode(&payload) {
        Some(change) => {
            let _ = tx.send(change);
        }
        None => warn!(%payload, "ignoring malformed server_instances payload"),
    });
    spawn_listener(notifier, channels::SERVER_INSTANCES, on_notify, cancel);
    rx
}

// ============================================================================
// Hash dispatcher
// ============================================================================

pub struct HashDispatcher {
    instance_id: String,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    broker: Arc<dyn SourceClient>,
    ring: RwLock<ConsistentRing>,
    owned: RwLock<HashSet<String>>,
    resyncs: WorkQueue<String>,
    config: DispatcherConfig,
}

impl HashDispatcher {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        broker: Arc<dyn SourceClient>,
        ring: HashRingConfig,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            notifier,
            broker,
            ring: RwLock::new(ConsistentRing::new(ring)),
            owned: RwLock::new(HashSet::new()),
            resyncs: WorkQueue::new(Duration::from_millis(5), Duration::from_secs(60)),
            config,
        }
    }

    /// Consumers currently assigned to this replica, sorted
    pub fn owned_consumers(&self) -> Vec<String> {
        let mut owned: Vec<String> = self.owned.read().iter().cloned().collect();
        owned.sort();
        owned
    }

    pub fn ring_members(&self) -> Vec<String> {
        self.ring.read().members().map(String::from).collect()
    }

    /// Consumers waiting for a resync request
    pub fn pending_resyncs(&self) -> usize {
        self.resyncs.len()
    }

    /// Align ring members with the ready set in the store
    pub async fn check(&self) -> Result<()> {
        let ready = self.store.ready_instance_ids().await?;
        let changed = self.ring.write().set_members(ready);
        if changed {
            debug!(members = ?self.ring_members(), "ring membership corrected");
        }
        self.update_owned().await
    }

    /// Recompute owned consumers, queueing a resync for each newly owned one
    async fn update_owned(&self) -> Result<()> {
        let consumers = self.store.consumer_names().await?;
        let owned: HashSet<String> = {
            let ring = self.ring.read();
            DispatchMetrics::set_ring_members(ring.len());
            // an empty ring owns nothing
            consumers
                .into_iter()
                .filter(|c| ring.owner(c) == Some(self.instance_id.as_str()))
                .collect()
        };

        let gained: Vec<String> = {
            let mut current = self.owned.write();
            let gained = owned.difference(&current).cloned().collect();
            *current = owned;
            DispatchMetrics::set_owned_consumers(current.len());
            gained
        };
        for consumer in gained {
            debug!(%consumer, "consumer assigned to this instance");
            self.resyncs.add(consumer);
        }
        Ok(())
    }

    async fn resync_worker(self: Arc<Self>) {
        while let Some(consumer) = self.resyncs.get().await {
            info!(%consumer, "requesting status resync");
            match self.broker.resync(std::slice::from_ref(&consumer)).await {
                Ok(()) => {
                    DispatchMetrics::add_resyncs(1);
                    self.resyncs.forget(&consumer);
                }
                Err(e) => {
                    error!(%consumer, "status resync failed: {}", e);
                    self.resyncs.add_rate_limited(consumer.clone());
                }
            }
            self.resyncs.done(&consumer);
        }
    }

    async fn resync_owned(&self) {
        let owned = self.owned_consumers();
        if owned.is_empty() {
            return;
        }
        match self.broker.resync(&owned).await {
            Ok(()) => DispatchMetrics::add_resyncs(owned.len()),
            Err(e) => error!(consumers = ?owned, "status resync after reconnect failed: {}", e),
        }
    }

    async fn apply(&self, change: InstanceChange) {
        let outcome = match &change {
            InstanceChange::Ready(ids) => {
                let mut result = Ok(());
                for id in ids {
                    result = result.and(self.on_instance_up(id).await);
                }
                result
            }
            InstanceChange::Unready(ids) => {
                let mut result = Ok(());
                for id in ids {
                    result = result.and(self.on_instance_down(id).await);
                }
                result
            }
        };
        if let Err(e) = outcome {
            error!(?change, "failed to apply instance change: {}", e);
        }
    }
}

#[async_trait]
impl Dispatcher for HashDispatcher {
    fn dispatch(&self, consumer: &str) -> bool {
        self.ring.read().owner(consumer) == Some(self.instance_id.as_str())
    }

    async fn on_instance_up(&self, instance_id: &str) -> Result<()> {
        if !self.ring.write().add(instance_id) {
            return Ok(());
        }
        info!(instance_id, "instance joined the ring");
        self.update_owned().await
    }

    async fn on_instance_down(&self, instance_id: &str) -> Result<()> {
        if !self.ring.write().remove(instance_id) {
            return Ok(());
        }
        info!(instance_id, "instance left the ring");
        self.update_owned().await
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let workers: Vec<_> = (0..self.config.resync_workers.max(1))
            .map(|_| tokio::spawn(self.clone().resync_worker()))
            .collect();

        let mut changes = instance_change_feed(self.notifier.clone(), cancel.clone());
        let mut reconnected = self.broker.reconnected();
        let mut reconnect_open = true;
        let mut ticker = tokio::time::interval(self.config.check_interval);
        info!(instance_id = %self.instance_id, "hash dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(change) = changes.recv() => self.apply(change).await,
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        error!("dispatcher check failed: {}", e);
                    }
                }
                signal = reconnected.recv(), if reconnect_open => match signal {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => self.resync_owned().await,
                    Err(broadcast::error::RecvError::Closed) => reconnect_open = false,
                },
            }
        }

        self.resyncs.shut_down();
        for worker in workers {
            let _ = worker.await;
        }
        info!("hash dispatcher stopped");
    }
}

// ============================================================================
// Noop dispatcher
// ============================================================================

pub struct NoopDispatcher {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    broker: Arc<dyn SourceClient>,
}

impl NoopDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        broker: Arc<dyn SourceClient>,
    ) -> Self {
        Self {
            store,
            notifier,
            broker,
        }
    }

    /// Ask every consumer's agent to resend statuses
    async fn resync_all(&self) -> Result<()> {
        let consumers = self.store.consumer_names().await?;
        if consumers.is_empty() {
            return Ok(());
        }
        self.broker.resync(&consumers).await?;
        DispatchMetrics::add_resyncs(consumers.len());
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for NoopDispatcher {
    fn dispatch(&self, _consumer: &str) -> bool {
        true
    }

    async fn on_instance_up(&self, _instance_id: &str) -> Result<()> {
        Ok(())
    }

    async fn on_instance_down(&self, instance_id: &str) -> Result<()> {
        debug!(instance_id, "instance down, resyncing all consumers");
        self.resync_all().await
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = instance_change_feed(self.notifier.clone(), cancel.clone());
        let mut reconnected = self.broker.reconnected();
        let mut reconnect_open = true;
        info!("noop dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(change) = changes.recv() => {
                    // one resync covers any number of departed instances
                    if let InstanceChange::Unready(ids) = change {
                        if let Some(first) = ids.first() {
                            if let Err(e) = self.on_instance_down(first).await {
                                error!("status resync failed: {}", e);
                            }
                        }
                    }
                }
                signal = reconnected.recv(), if reconnect_open => match signal {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Err(e) = self.resync_all().await {
                            error!("status resync after reconnect failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => reconnect_open = false,
                },
            }
        }
        info!("noop dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::model::Resource;
    use crate::notify::MemoryNotifier;
    use crate::store::{InstanceStore, MemoryStore, ResourceStore};
    use chrono::Utc;
    use serde_json::json;

    async fn store_with_consumers(n: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        for i in 0..n {
            store
                .create_resource(&Resource::new("svc", format!("cluster-{i}"), json!({})))
                .await
                .unwrap();
        }
        store
    }

    fn hash_dispatcher(
        id: &str,
        store: Arc<MemoryStore>,
        broker: &MemoryBroker,
    ) -> HashDispatcher {
        HashDispatcher::new(
            id,
            store,
            Arc::new(MemoryNotifier::new()),
            Arc::new(broker.client(id)),
            HashRingConfig::default(),
            DispatcherConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_ring_owners_partition_consumers() {
        let store = store_with_consumers(20).await;
        let broker = MemoryBroker::new(SubscriptionMode::Broadcast);
        let a = hash_dispatcher("a", store.clone(), &broker);
        let b = hash_dispatcher("b", store.clone(), &broker);
        for d in [&a, &b] {
            d.on_instance_up("a").await.unwrap();
            d.on_instance_up("b").await.unwrap();
        }

        for i in 0..20 {
            let consumer = format!("cluster-{i}");
            assert!(a.dispatch(&consumer) ^ b.dispatch(&consumer), "{consumer}");
        }
        assert_eq!(a.owned_consumers().len() + b.owned_consumers().len(), 20);
    }

    #[tokio::test]
    async fn test_instance_down_moves_consumers_and_queues_resync() {
        let store = store_with_consumers(10).await;
        let broker = MemoryBroker::new(SubscriptionMode::Broadcast);
        let a = hash_dispatcher("a", store, &broker);
        a.on_instance_up("a").await.unwrap();
        assert_eq!(a.owned_consumers().len(), 10);
        let initial = a.pending_resyncs();
        assert_eq!(initial, 10);

        a.on_instance_up("b").await.unwrap();
        assert_eq!(a.ring_members(), vec!["a", "b"]);
        assert!(a.owned_consumers().iter().all(|c| a.dispatch(c)));

        a.on_instance_down("b").await.unwrap();
        assert_eq!(a.owned_consumers().len(), 10);
        // duplicates collapse in the queue
        assert_eq!(a.pending_resyncs(), 10);

        // repeated transitions are no-ops
        a.on_instance_down("b").await.unwrap();
        assert_eq!(a.ring_members(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_empty_ring_releases_owned_consumers() {
        let store = store_with_consumers(5).await;
        let broker = MemoryBroker::new(SubscriptionMode::Broadcast);
        let a = hash_dispatcher("a", store.clone(), &broker);
        a.on_instance_up("a").await.unwrap();
        assert_eq!(a.owned_consumers().len(), 5);

        // no ready rows in the store
        a.check().await.unwrap();
        assert!(a.ring_members().is_empty());
        assert!(a.owned_consumers().is_empty());
        assert!(!a.dispatch("cluster-0"));
    }

    #[tokio::test]
    async fn test_check_follows_ready_instances() {
        let store = store_with_consumers(3).await;
        let broker = MemoryBroker::new(SubscriptionMode::Broadcast);
        let a = hash_dispatcher("a", store.clone(), &broker);
        a.on_instance_up("ghost").await.unwrap();

        store.upsert_heartbeat("a", Utc::now()).await.unwrap();
        store.mark_ready(&["a".to_string()]).await.unwrap();
        a.check().await.unwrap();

        assert_eq!(a.ring_members(), vec!["a"]);
        assert!(a.dispatch("cluster-0"));
    }

    #[tokio::test]
    async fn test_resync_workers_drain_queue() {
        let store = store_with_consumers(4).await;
        let broker = MemoryBroker::new(SubscriptionMode::Broadcast);
        let a = Arc::new(hash_dispatcher("a", store, &broker));
        a.on_instance_up("a").await.unwrap();

        let cancel = CancellationToken::new();
        let running = tokio::spawn(a.clone().run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.resync_requests().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_dispatcher() {
        let store = store_with_consumers(3).await;
        let broker = MemoryBroker::new(SubscriptionMode::Shared);
        let d = NoopDispatcher::new(
            store,
            Arc::new(MemoryNotifier::new()),
            Arc::new(broker.client("a")),
        );
        assert!(d.dispatch("anything"));
        d.on_instance_up("b").await.unwrap();
        assert!(broker.resync_requests().is_empty());

        d.on_instance_down("b").await.unwrap();
        assert_eq!(broker.resync_requests().len(), 3);
    }
}
