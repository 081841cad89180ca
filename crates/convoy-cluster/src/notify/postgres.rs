//! PostgreSQL LISTEN/NOTIFY

use super::{Notifier, NotifyCallback};
use crate::config::DatabaseConfig;
use crate::error::Result;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Notifier keeping one dedicated connection per listened channel.
///
/// Listener connections are opened outside the pool so a long-lived
/// `LISTEN` never starves lock or query traffic.
pub struct PgNotifier {
    url: String,
    pool: Pool,
    keepalive_interval: Duration,
    reconnect_max_backoff: Duration,
}

/// An open `LISTEN` session
struct Listener {
    client: Client,
    payloads: mpsc::UnboundedReceiver<String>,
    driver: JoinHandle<()>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl PgNotifier {
    pub fn new(config: &DatabaseConfig, pool: Pool) -> Self {
        Self {
            url: config.url.clone(),
            pool,
            keepalive_interval: config.keepalive_interval,
            reconnect_max_backoff: config.reconnect_max_backoff,
        }
    }

    async fn connect(&self, channel: &str) -> Result<Listener> {
        let (client, mut connection) = tokio_postgres::connect(&self.url, NoTls).await?;
        let (tx, payloads) = mpsc::unbounded_channel();

        // Drive the connection and forward notifications; the task ends,
        // closing `payloads`, once the connection is gone.
        let channel_name = channel.to_string();
        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        if tx.send(n.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(channel = %channel_name, "server notice: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(channel = %channel_name, "listener connection error: {}", e);
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await?;

        Ok(Listener {
            client,
            payloads,
            driver,
        })
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn listen(&self, channel: &str, on_notify: NotifyCallback, cancel: CancellationToken) {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.connect(channel).await {
                Ok(mut listener) => {
                    info!(channel, "listening for notifications");
                    reconnect_delay = INITIAL_RECONNECT_DELAY;

                    let mut keepalive = tokio::time::interval(self.keepalive_interval);
                    keepalive.tick().await;

                    let reason = loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(channel, "listener stopped");
                                return;
                            }
                            payload = listener.payloads.recv() => match payload {
                                Some(payload) => on_notify(payload),
                                None => break "connection closed".to_string(),
                            },
                            _ = keepalive.tick() => {
                                // half-dead connections only surface on a round trip
                                let ping = listener.client.simple_query("SELECT 1");
                                match ping_within(ping, self.keepalive_interval, &cancel).await {
                                    Ping::Alive => {}
                                    Ping::Lost(reason) => break reason,
                                    Ping::Cancelled => {
                                        debug!(channel, "listener stopped");
                                        return;
                                    }
                                }
                            }
                        }
                    };
                    warn!(channel, %reason, "listener disconnected, reconnecting");
                    crate::observability::NotifyMetrics::increment_reconnects(channel);
                }
                Err(e) => {
                    error!(channel, "failed to open listener: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            reconnect_delay = (reconnect_delay * 2).min(self.reconnect_max_backoff);
        }
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &payload])
            .await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Ping {
    Alive,
    Lost(String),
    Cancelled,
}

/// Await a keep-alive round trip for at most `limit`
async fn ping_within<F, T, E>(ping: F, limit: Duration, cancel: &CancellationToken) -> Ping
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    tokio::select! {
        _ = cancel.cancelled() => Ping::Cancelled,
        outcome = tokio::time::timeout(limit, ping) => match outcome {
            Ok(Ok(_)) => Ping::Alive,
            Ok(Err(e)) => Ping::Lost(format!("keep-alive ping failed: {e}")),
            Err(_) => Ping::Lost("keep-alive ping timed out".to_string()),
        },
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("events"), "\"events\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_outcomes() {
        let cancel = CancellationToken::new();
        let limit = Duration::from_secs(10);

        let ok = async { Ok::<_, std::io::Error>(()) };
        assert_eq!(ping_within(ok, limit, &cancel).await, Ping::Alive);

        let failed = async { Err::<(), _>("connection reset") };
        assert_eq!(
            ping_within(failed, limit, &cancel).await,
            Ping::Lost("keep-alive ping failed: connection reset".into())
        );

        // a black-holed connection never answers
        let hung = futures::future::pending::<std::result::Result<(), String>>();
        assert_eq!(
            ping_within(hung, limit, &cancel).await,
            Ping::Lost("keep-alive ping timed out".into())
        );
    }

    #[tokio::test]
    async fn test_ping_yields_to_cancellation() {
        let cancel = CancellationToken::new();
        let hung = futures::future::pending::<std::result::Result<(), String>>();
        let waiting = tokio::spawn({
            let cancel = cancel.clone();
            async move { ping_within(hung, Duration::from_secs(3600), &cancel).await }
        });
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Ping::Cancelled);
    }
}
