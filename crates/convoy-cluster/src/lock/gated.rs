//! Event locks restricted to replicas serving the event's consumer

use super::{LockClass, LockFactory, LockOwner};
use crate::broker::SourceClient;
use crate::error::{ConvoyError, Result};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Wraps a [`LockFactory`] so only a replica whose broker session
/// serves the event's consumer can take that event's lock.
///
/// Keys are event ids and only [`LockClass::Events`] is accepted. When the
/// event or its resource is already gone the inner lock is taken as-is;
/// the handler then observes the missing row and finishes the event.
pub struct SubscriptionGatedLockFactory {
    inner: Arc<dyn LockFactory>,
    store: Arc<dyn Store>,
    broker: Arc<dyn SourceClient>,
}

impl SubscriptionGatedLockFactory {
    pub fn new(
        inner: Arc<dyn LockFactory>,
        store: Arc<dyn Store>,
        broker: Arc<dyn SourceClient>,
    ) -> Self {
        Self {
            inner,
            store,
            broker,
        }
    }

    /// Consumer of the event's resource, or `None` when either row is gone
    async fn consumer_for(&self, key: &str) -> Result<Option<String>> {
        let event_id = Uuid::parse_str(key).map_err(|e| ConvoyError::LockAcquisition {
            key: key.to_string(),
            class: LockClass::Events.as_str(),
            reason: format!("key is not an event id: {e}"),
        })?;
        let Some(event) = self.store.get_event(event_id).await? else {
            return Ok(None);
        };
        let resource = self.store.get_resource(event.resource_id).await?;
        Ok(resource.map(|r| r.consumer_name))
    }

    async fn subscribed(&self, key: &str, class: LockClass) -> Result<std::result::Result<(), String>> {
        if class != LockClass::Events {
            return Err(ConvoyError::UnsupportedLockClass(class.as_str()));
        }
        match self.consumer_for(key).await? {
            Some(consumer) if !self.broker.is_consumer_subscribed(&consumer) => {
                debug!(key, consumer = %consumer, "consumer not served by this replica");
                Ok(Err(consumer))
            }
            _ => Ok(Ok(())),
        }
    }
}

#[async_trait]
impl LockFactory for SubscriptionGatedLockFactory {
    async fn lock(&self, key: &str, class: LockClass) -> Result<LockOwner> {
        if let Err(consumer) = self.subscribed(key, class).await? {
            return Err(ConvoyError::ConsumerNotSubscribed(consumer));
        }
        self.inner.lock(key, class).await
    }

    async fn try_lock(&self, key: &str, class: LockClass) -> Result<Option<LockOwner>> {
        if self.subscribed(key, class).await?.is_err() {
            return Ok(None);
        }
        self.inner.try_lock(key, class).await
    }

    async fn unlock(&self, owner: LockOwner) {
        self.inner.unlock(owner).await
    }
}
