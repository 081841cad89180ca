//! In-process notification channels

use super::{Notifier, NotifyCallback};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Channels backed by `tokio::sync::broadcast`, cheap to clone and share
/// between replicas running in one process
#[derive(Clone, Default)]
pub struct MemoryNotifier {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish without awaiting; messages with no listener are dropped
    pub fn publish(&self, channel: &str, payload: &str) {
        let _ = self.sender(channel).send(payload.to_string());
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn listen(&self, channel: &str, on_notify: NotifyCallback, cancel: CancellationToken) {
        let mut rx = self.subscribe(channel);
        debug!(channel, "listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = rx.recv() => match msg {
                    Ok(payload) => on_notify(payload),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(channel, missed, "listener lagged, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.publish(channel, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listen_until_cancelled() {
        let notifier = MemoryNotifier::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let cancel = CancellationToken::new();

        let listener = notifier.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            listener
                .listen("events", Arc::new(move |p| sink.lock().push(p)), token)
                .await
        });

        // let the listener subscribe before publishing
        tokio::time::sleep(Duration::from_millis(20)).await;
        notifier.notify("events", "e1").await.unwrap();
        notifier.notify("other", "ignored").await.unwrap();
        notifier.notify("events", "e2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*received.lock(), vec!["e1".to_string(), "e2".to_string()]);
    }
}
