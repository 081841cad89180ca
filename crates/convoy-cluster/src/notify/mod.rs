//! Change notification bridge
//!
//! Notifications are wake-up hints only. A listener reconnecting after a
//! dropped connection misses whatever was announced in between, so every
//! consumer of a channel also re-scans the store on a timer.

mod memory;
mod postgres;

pub use memory::MemoryNotifier;
pub use postgres::PgNotifier;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Well-known channel names
pub mod channels {
    /// Payload: id of a newly inserted spec event
    pub const EVENTS: &str = "events";
    /// Payload: id of a newly inserted status event
    pub const STATUS_EVENTS: &str = "status_events";
    /// Payload: `ready:<id>,<id>` or `unready:<id>,<id>`
    pub const SERVER_INSTANCES: &str = "server_instances";
}

/// Invoked with the payload of every notification
pub type NotifyCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Publish/subscribe over named channels
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver every message on `channel` to `on_notify` until `cancel` fires.
    ///
    /// Connection loss is handled internally by reconnecting.
    async fn listen(&self, channel: &str, on_notify: NotifyCallback, cancel: CancellationToken);

    /// Announce `payload` on `channel`
    async fn notify(&self, channel: &str, payload: &str) -> Result<()>;
}

/// Run [`Notifier::listen`] on its own task
pub fn spawn_listener(
    notifier: Arc<dyn Notifier>,
    channel: &'static str,
    on_notify: NotifyCallback,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let counted: NotifyCallback = Arc::new(move |payload| {
        crate::observability::NotifyMetrics::increment_received(channel);
        on_notify(payload)
    });
    tokio::spawn(async move { notifier.listen(channel, counted, cancel).await })
}

/// Membership change announced on [`channels::SERVER_INSTANCES`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceChange {
    Ready(Vec<String>),
    Unready(Vec<String>),
}

impl InstanceChange {
    /// Wire form, e.g. `ready:a,b`
    pub fn encode(&self) -> String {
        match self {
            InstanceChange::Ready(ids) => format!("ready:{}", ids.join(",")),
            InstanceChange::Unready(ids) => format!("unready:{}", ids.join(",")),
        }
    }

    pub fn decode(payload: &str) -> Option<Self> {
        let (kind, ids) = payload.split_once(':')?;
        let ids: Vec<String> = ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        match kind {
            "ready" => Some(InstanceChange::Ready(ids)),
            "unready" => Some(InstanceChange::Unready(ids)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_change_wire_form() {
        let change = InstanceChange::Ready(vec!["a".into(), "b".into()]);
        assert_eq!(change.encode(), "ready:a,b");
        assert_eq!(InstanceChange::decode("ready:a,b"), Some(change));
        assert_eq!(
            InstanceChange::decode("unready: c ,"),
            Some(InstanceChange::Unready(vec!["c".into()]))
        );
        assert_eq!(InstanceChange::decode("gone:a"), None);
        assert_eq!(InstanceChange::decode("ready"), None);
    }
}
