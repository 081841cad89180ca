//! Event dispatch controllers
//!
//! Both controllers follow the same loop: notifications and a periodic
//! re-scan feed ids into a deduplicating [`WorkQueue`]; workers pull ids,
//! claim them, and run the handler chain registered for the row's kind.
//! Notifications only shorten latency. The re-scan is what guarantees a
//! row is eventually handled after a missed notification.
//!
//! - [`EventController`]: spec-side events, claimed through an [`EventFilter`]
//! - [`StatusController`]: status events, fanned out on every replica

mod event;
mod status;

pub use event::{
    Claim, EventController, EventFilter, EventPredicate, LockBasedEventFilter,
    PredicatedEventFilter,
};
pub use status::StatusController;

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::notify::{spawn_listener, Notifier, NotifyCallback};
use crate::queue::WorkQueue;
use futures::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// One step of a handler chain; receives the id the controller documents
pub type Handler = Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Uuid) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |id| -> BoxFuture<'static, Result<()>> { Box::pin(f(id)) })
}

/// `base` stretched by a random factor in `[1, 1 + jitter]`
pub(crate) fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0.0..jitter);
    base.mul_f64(1.0 + extra)
}

pub(crate) fn work_queue(config: &ControllerConfig) -> WorkQueue<Uuid> {
    WorkQueue::new(config.retry_base_delay, config.retry_max_delay)
}

/// Queue every id announced on `channel`
pub(crate) fn listen_for_ids(
    notifier: Arc<dyn Notifier>,
    channel: &'static str,
    queue: WorkQueue<Uuid>,
    cancel: CancellationToken,
) {
    let on_notify: NotifyCallback = Arc::new(move |payload: String| match Uuid::parse_str(payload.trim()) {
        Ok(id) => queue.add(id),
        Err(_) => warn!(channel, %payload, "ignoring notification without an id"),
    });
    spawn_listener(notifier, channel, on_notify, cancel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(100);
        for _ in 0..50 {
            let d = jittered(base, 0.25);
            assert!(d >= base && d <= Duration::from_secs(125));
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[tokio::test]
    async fn test_handler_wrapper() {
        let h = handler(|id| async move {
            assert!(!id.is_nil());
            Ok(())
        });
        h(Uuid::new_v4()).await.unwrap();
    }
}
