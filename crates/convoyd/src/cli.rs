//! CLI argument parsing for the convoy replica daemon
//!
//! Every option can also be set through a `CONVOY_*` environment variable,
//! which is how replicas are usually configured in a deployment.

use clap::{Parser, ValueEnum};
use convoy_cluster::{
    ControllerConfig, CoordinatorConfig, DatabaseConfig, DispatcherConfig, EventFilterMode,
    HashRingConfig, PulseConfig, SubscriptionMode,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Get system hostname via the `hostname` command, falling back to "unknown".
fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// convoy - control-plane replica
///
/// Runs one replica of the convoy control plane. Replicas sharing a
/// PostgreSQL database coordinate through advisory locks, LISTEN/NOTIFY
/// and heartbeat rows.
#[derive(Parser, Debug)]
#[command(name = "convoyd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    // ============ Replica ============
    /// Stable replica identifier, also used as the broker client id
    #[arg(long, env = "CONVOY_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Storage backend
    #[arg(long, default_value = "memory", env = "CONVOY_STORAGE")]
    pub storage: StorageBackend,

    // ============ Database ============
    /// PostgreSQL connection string (required for the postgres backend)
    #[arg(long, env = "CONVOY_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Maximum pooled database connections
    #[arg(long, default_value = "16", env = "CONVOY_DATABASE_POOL_SIZE")]
    pub database_pool_size: usize,

    /// Keep-alive ping interval of notification listeners, in seconds
    #[arg(long, default_value = "10", env = "CONVOY_NOTIFY_KEEPALIVE_SECS")]
    pub notify_keepalive_secs: u64,

    /// Upper bound of the listener reconnect backoff, in seconds
    #[arg(long, default_value = "30", env = "CONVOY_NOTIFY_MAX_BACKOFF_SECS")]
    pub notify_max_backoff_secs: u64,

    // ============ Liveness ============
    /// Heartbeat interval in seconds
    #[arg(long, default_value = "10", env = "CONVOY_PULSE_INTERVAL")]
    pub pulse_interval: u64,

    /// Liveness scan interval in milliseconds (default: a third of the pulse interval)
    #[arg(long, env = "CONVOY_CHECK_INTERVAL_MS")]
    pub check_interval_ms: Option<u64>,

    /// Missed pulses before a replica is considered dead
    #[arg(long, default_value = "3", env = "CONVOY_EXPIRATION_MULTIPLIER")]
    pub expiration_multiplier: u32,

    // ============ Status dispatch ============
    /// Broker subscription model for status messages (shared, broadcast)
    #[arg(long, default_value = "shared", env = "CONVOY_SUBSCRIPTION_MODE")]
    pub subscription_mode: SubscriptionMode,

    /// Hash ring partition count
    #[arg(long, default_value = "7", env = "CONVOY_RING_PARTITIONS")]
    pub ring_partitions: usize,

    /// Virtual nodes per ring member
    #[arg(long, default_value = "20", env = "CONVOY_RING_REPLICATION_FACTOR")]
    pub ring_replication_factor: usize,

    /// Maximum member load relative to the average
    #[arg(long, default_value = "1.25", env = "CONVOY_RING_LOAD")]
    pub ring_load: f64,

    /// Ring membership check interval in seconds
    #[arg(long, default_value = "5", env = "CONVOY_DISPATCHER_CHECK_SECS")]
    pub dispatcher_check_secs: u64,

    /// Concurrent status resync workers
    #[arg(long, default_value = "10", env = "CONVOY_RESYNC_WORKERS")]
    pub resync_workers: usize,

    // ============ Controllers ============
    /// How spec events are claimed (lock, routed-lock, predicate)
    #[arg(long, default_value = "lock", env = "CONVOY_EVENT_FILTER")]
    pub event_filter: EventFilterMode,

    /// Workers per controller
    #[arg(long, default_value = "4", env = "CONVOY_WORKERS")]
    pub workers: usize,

    /// Full re-scan interval of unhandled events, in seconds
    #[arg(long, default_value = "300", env = "CONVOY_SYNC_INTERVAL_SECS")]
    pub sync_interval_secs: u64,

    /// Rows per statement when purging handled status events
    #[arg(long, default_value = "500", env = "CONVOY_PURGE_BATCH_SIZE")]
    pub purge_batch_size: usize,

    // ============ HTTP / Observability ============
    /// Bind address of the health and metrics endpoints
    #[arg(long, default_value = "0.0.0.0:8080", env = "CONVOY_HTTP_BIND")]
    pub http_bind: SocketAddr,

    /// Serve Prometheus metrics on /metrics
    #[arg(long, default_value = "true", env = "CONVOY_METRICS")]
    pub metrics: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", env = "CONVOY_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, default_value = "text", env = "CONVOY_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Seconds to wait for background tasks on shutdown
    #[arg(long, default_value = "30", env = "CONVOY_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,
}

/// Where coordination tables live
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq)]
pub enum StorageBackend {
    /// In-process tables, single replica only
    #[default]
    Memory,
    /// Shared PostgreSQL database
    Postgres,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Cli {
    /// Convert CLI args to the coordination config
    pub fn to_config(&self) -> CoordinatorConfig {
        let mut pulse = PulseConfig::new(Duration::from_secs(self.pulse_interval))
            .with_expiration_multiplier(self.expiration_multiplier);
        if let Some(ms) = self.check_interval_ms {
            pulse = pulse.with_check_interval(Duration::from_millis(ms));
        }

        let mut database = DatabaseConfig {
            pool_size: self.database_pool_size,
            keepalive_interval: Duration::from_secs(self.notify_keepalive_secs),
            reconnect_max_backoff: Duration::from_secs(self.notify_max_backoff_secs),
            ..Default::default()
        };
        if let Some(url) = &self.database_url {
            database.url = url.clone();
        }

        CoordinatorConfig::builder()
            .instance_id(self.effective_instance_id())
            .subscription_mode(self.subscription_mode)
            .pulse(pulse)
            .hash_ring(HashRingConfig {
                partition_count: self.ring_partitions,
                replication_factor: self.ring_replication_factor,
                load: self.ring_load,
            })
            .controller(ControllerConfig {
                event_filter: self.event_filter,
                workers: self.workers,
                sync_interval: Duration::from_secs(self.sync_interval_secs),
                purge_batch_size: self.purge_batch_size,
                ..Default::default()
            })
            .dispatcher(DispatcherConfig {
                check_interval: Duration::from_secs(self.dispatcher_check_secs),
                resync_workers: self.resync_workers,
            })
            .database(database)
            .build()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.storage == StorageBackend::Postgres && self.database_url.is_none() {
            return Err(
                "database_url (--database-url / CONVOY_DATABASE_URL) is required with the postgres backend"
                    .to_string(),
            );
        }
        if self.storage == StorageBackend::Memory
            && self.subscription_mode == SubscriptionMode::Broadcast
        {
            tracing::warn!("broadcast mode with in-memory storage only ever has one replica");
        }
        self.to_config().validate().map_err(|e| e.to_string())
    }

    /// Get effective instance ID (generated from hostname and pid if not specified)
    pub fn effective_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", hostname(), std::process::id()))
    }
}
