//! Instance liveness
//!
//! Every replica upserts its own heartbeat row on each pulse. Separately,
//! a liveness scan flips `ready` on rows whose heartbeat crossed the
//! expiration window. At most one replica scans at a time; the others
//! skip the cycle when the scan lock is taken.
//!
//! The scanning replica updates its own hash ring right after marking
//! rows, then announces the change on `server_instances` for the rest
//! of the fleet.

use crate::config::PulseConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ConvoyError, Result};
use crate::lock::{self, LockClass, LockFactory};
use crate::model::Instance;
use crate::notify::{channels, InstanceChange, Notifier};
use crate::observability::LivenessMetrics;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fleet-wide key of the liveness scan lock
pub const LIVENESS_CHECK_KEY: &str = "instances-liveness-check";

/// Outcome of one liveness scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessScan {
    pub became_ready: Vec<String>,
    pub became_unready: Vec<String>,
}

impl LivenessScan {
    pub fn is_empty(&self) -> bool {
        self.became_ready.is_empty() && self.became_unready.is_empty()
    }
}

/// Split instances into those to mark ready and those to mark unready
pub fn classify(
    instances: &[Instance],
    now: DateTime<Utc>,
    expiration: chrono::Duration,
) -> LivenessScan {
    let mut scan = LivenessScan::default();
    for instance in instances {
        let alive = now - instance.last_heartbeat <= expiration;
        match (alive, instance.ready) {
            (true, false) => scan.became_ready.push(instance.id.clone()),
            (false, true) => scan.became_unready.push(instance.id.clone()),
            _ => {}
        }
    }
    scan.became_ready.sort();
    scan.became_unready.sort();
    scan
}

pub struct LivenessTracker {
    instance_id: String,
    store: Arc<dyn Store>,
    locks: Arc<dyn LockFactory>,
    notifier: Arc<dyn Notifier>,
    dispatcher: Arc<dyn Dispatcher>,
    config: PulseConfig,
}

impl LivenessTracker {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn Store>,
        locks: Arc<dyn LockFactory>,
        notifier: Arc<dyn Notifier>,
        dispatcher: Arc<dyn Dispatcher>,
        config: PulseConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            locks,
            notifier,
            dispatcher,
            config,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Record a heartbeat for this instance
    pub async fn pulse(&self) -> Result<()> {
        let guard = lock::acquire(&self.locks, &self.instance_id, LockClass::Instances).await?;
        let result = self.store.upsert_heartbeat(&self.instance_id, Utc::now()).await;
        guard.release().await;

        match result {
            Ok(instance) => {
                LivenessMetrics::increment_heartbeats();
                debug!(instance_id = %instance.id, ready = instance.ready, "heartbeat recorded");
                Ok(())
            }
            Err(e) => {
                LivenessMetrics::increment_heartbeat_failures();
                Err(e)
            }
        }
    }

    /// Run one liveness scan at `now`.
    ///
    /// Returns `None` when another replica holds the scan lock.
    pub async fn check_instances_at(&self, now: DateTime<Utc>) -> Result<Option<LivenessScan>> {
        let Some(guard) =
            lock::try_acquire(&self.locks, LIVENESS_CHECK_KEY, LockClass::Instances).await?
        else {
            return Ok(None);
        };
        let result = self.check_locked(now).await;
        guard.release().await;
        result.map(Some)
    }

    pub async fn check_instances(&self) -> Result<Option<LivenessScan>> {
        self.check_instances_at(Utc::now()).await
    }

    async fn check_locked(&self, now: DateTime<Utc>) -> Result<LivenessScan> {
        let expiration = chrono::Duration::from_std(self.config.expiration())
            .map_err(|e| ConvoyError::InvalidConfig(format!("instance expiration: {e}")))?;
        let instances = self.store.all_instances().await?;
        let scan = classify(&instances, now, expiration);

        let ready_count = instances.iter().filter(|i| i.ready).count()
            + scan.became_ready.len()
            - scan.became_unready.len();
        LivenessMetrics::set_ready_instances(ready_count);
        if scan.is_empty() {
            return Ok(scan);
        }

        if !scan.became_ready.is_empty() {
            self.store.mark_ready(&scan.became_ready).await?;
            LivenessMetrics::add_transitions("ready", scan.became_ready.len());
            info!(instances = ?scan.became_ready, "instances became ready");
            for id in &scan.became_ready {
                if let Err(e) = self.dispatcher.on_instance_up(id).await {
                    error!(instance_id = %id, "failed to add instance to ring: {}", e);
                }
            }
            self.announce(InstanceChange::Ready(scan.became_ready.clone()))
                .await;
        }

        if !scan.became_unready.is_empty() {
            self.store.mark_unready(&scan.became_unready).await?;
            LivenessMetrics::add_transitions("unready", scan.became_unready.len());
            warn!(instances = ?scan.became_unready, "instances stopped heartbeating");
            for id in &scan.became_unready {
                if let Err(e) = self.dispatcher.on_instance_down(id).await {
                    error!(instance_id = %id, "failed to remove instance from ring: {}", e);
                }
            }
            self.announce(InstanceChange::Unready(scan.became_unready.clone()))
                .await;
        }
        Ok(scan)
    }

    async fn announce(&self, change: InstanceChange) {
        if let Err(e) = self
            .notifier
            .notify(channels::SERVER_INSTANCES, &change.encode())
            .await
        {
            // peers still converge through their periodic ring check
            warn!(?change, "failed to announce instance change: {}", e);
        }
    }

    /// Pulse and scan on their own timers until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut pulse = tokio::time::interval(self.config.pulse_interval);
        pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check = tokio::time::interval(self.config.check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            instance_id = %self.instance_id,
            pulse_interval = ?self.config.pulse_interval,
            check_interval = ?self.config.check_interval(),
            "liveness tracker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = pulse.tick() => {
                    if let Err(e) = self.pulse().await {
                        error!(instance_id = %self.instance_id, "heartbeat failed: {}", e);
                    }
                }
                _ = check.tick() => {
                    if let Err(e) = self.check_instances().await {
                        error!("liveness scan failed: {}", e);
                    }
                }
            }
        }
        info!(instance_id = %self.instance_id, "liveness tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::SubscriptionMode;
    use crate::dispatcher::NoopDispatcher;
    use crate::lock::MemoryLockFactory;
    use crate::notify::MemoryNotifier;
    use crate::store::{InstanceStore, MemoryStore};
    use std::time::Duration;

    fn tracker(id: &str, store: Arc<MemoryStore>, locks: Arc<MemoryLockFactory>) -> LivenessTracker {
        let notifier = Arc::new(MemoryNotifier::new());
        let broker = MemoryBroker::new(SubscriptionMode::Shared);
        let dispatcher = Arc::new(NoopDispatcher::new(
            store.clone(),
            notifier.clone(),
            Arc::new(broker.client(id)),
        ));
        LivenessTracker::new(
            id,
            store,
            locks,
            notifier,
            dispatcher,
            PulseConfig::new(Duration::from_secs(10)),
        )
    }

    fn instance(id: &str, age_secs: i64, ready: bool, now: DateTime<Utc>) -> Instance {
        Instance {
            id: id.to_string(),
            last_heartbeat: now - chrono::Duration::seconds(age_secs),
            ready,
        }
    }

    #[test]
    fn test_classify_window() {
        let now = Utc::now();
        let window = chrono::Duration::seconds(30);
        let instances = vec![
            instance("fresh-unready", 5, false, now),
            instance("fresh-ready", 5, true, now),
            instance("stale-ready", 31, true, now),
            instance("stale-unready", 300, false, now),
            instance("edge", 30, false, now),
        ];
        let scan = classify(&instances, now, window);
        assert_eq!(scan.became_ready, vec!["edge", "fresh-unready"]);
        assert_eq!(scan.became_unready, vec!["stale-ready"]);
    }

    #[tokio::test]
    async fn test_pulse_creates_unready_row() {
        let store = Arc::new(MemoryStore::default());
        let t = tracker("a", store.clone(), Arc::new(MemoryLockFactory::new()));
        t.pulse().await.unwrap();

        let row = store.get_instance("a").await.unwrap().unwrap();
        assert!(!row.ready);

        let scan = t.check_instances().await.unwrap().unwrap();
        assert_eq!(scan.became_ready, vec!["a"]);
        assert!(store.get_instance("a").await.unwrap().unwrap().ready);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_marked_unready() {
        let store = Arc::new(MemoryStore::default());
        let t = tracker("a", store.clone(), Arc::new(MemoryLockFactory::new()));
        t.pulse().await.unwrap();
        t.check_instances().await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(31);
        let scan = t.check_instances_at(later).await.unwrap().unwrap();
        assert_eq!(scan.became_unready, vec!["a"]);
        assert!(store.ready_instance_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_scanner_at_a_time() {
        let store = Arc::new(MemoryStore::default());
        let locks = Arc::new(MemoryLockFactory::new());
        let a = tracker("a", store.clone(), locks.clone());

        let factory: Arc<dyn LockFactory> = locks;
        let held = lock::acquire(&factory, LIVENESS_CHECK_KEY, LockClass::Instances)
            .await
            .unwrap();
        assert!(a.check_instances().await.unwrap().is_none());
        held.release().await;
        assert!(a.check_instances().await.unwrap().is_some());
    }
}
