//! Coordination configuration

use crate::error::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How status messages are delivered by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// The broker delivers each status message to exactly one instance
    #[default]
    Shared,
    /// Every instance receives every status message; ownership is decided by the hash ring
    Broadcast,
}

impl std::str::FromStr for SubscriptionMode {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(SubscriptionMode::Shared),
            "broadcast" => Ok(SubscriptionMode::Broadcast),
            other => Err(ConvoyError::InvalidConfig(format!(
                "unsupported subscription mode: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionMode::Shared => write!(f, "shared"),
            SubscriptionMode::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Top-level coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Stable identifier of this replica (usually the broker client id)
    pub instance_id: String,

    /// Broker subscription model for status messages
    pub subscription_mode: SubscriptionMode,

    /// Heartbeat and liveness scan settings
    pub pulse: PulseConfig,

    /// Consistent hash ring parameters
    pub hash_ring: HashRingConfig,

    /// Event and status controller settings
    pub controller: ControllerConfig,

    /// Status dispatcher settings
    pub dispatcher: DispatcherConfig,

    /// Database connection settings
    pub database: DatabaseConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            subscription_mode: SubscriptionMode::default(),
            pulse: PulseConfig::default(),
            hash_ring: HashRingConfig::default(),
            controller: ControllerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration builder
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(ConvoyError::InvalidConfig(
                "instance id must not be empty".into(),
            ));
        }
        self.pulse.validate()?;
        self.hash_ring.validate()?;
        self.controller.validate()?;
        self.dispatcher.validate()?;
        Ok(())
    }
}

/// Builder for coordination configuration
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    instance_id: Option<String>,
    subscription_mode: Option<SubscriptionMode>,
    pulse: Option<PulseConfig>,
    hash_ring: Option<HashRingConfig>,
    controller: Option<ControllerConfig>,
    dispatcher: Option<DispatcherConfig>,
    database: Option<DatabaseConfig>,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn subscription_mode(mut self, mode: SubscriptionMode) -> Self {
        self.subscription_mode = Some(mode);
        self
    }

    pub fn pulse(mut self, config: PulseConfig) -> Self {
        self.pulse = Some(config);
        self
    }

    pub fn hash_ring(mut self, config: HashRingConfig) -> Self {
        self.hash_ring = Some(config);
        self
    }

    pub fn controller(mut self, config: ControllerConfig) -> Self {
        self.controller = Some(config);
        self
    }

    pub fn dispatcher(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = Some(config);
        self
    }

    pub fn database(mut self, config: DatabaseConfig) -> Self {
        self.database = Some(config);
        self
    }

    pub fn build(self) -> CoordinatorConfig {
        CoordinatorConfig {
            instance_id: self
                .instance_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            subscription_mode: self.subscription_mode.unwrap_or_default(),
            pulse: self.pulse.unwrap_or_default(),
            hash_ring: self.hash_ring.unwrap_or_default(),
            controller: self.controller.unwrap_or_default(),
            dispatcher: self.dispatcher.unwrap_or_default(),
            database: self.database.unwrap_or_default(),
        }
    }
}

/// Heartbeat and liveness scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Interval between heartbeats of this instance
    pub pulse_interval: Duration,

    /// Interval between liveness scans; `pulse_interval / 3` when unset
    pub check_interval: Option<Duration>,

    /// Number of missed pulse intervals before an instance is considered dead
    pub expiration_multiplier: u32,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            pulse_interval: Duration::from_secs(10),
            check_interval: None,
            expiration_multiplier: 3,
        }
    }
}

impl PulseConfig {
    pub fn new(pulse_interval: Duration) -> Self {
        Self {
            pulse_interval,
            ..Default::default()
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    pub fn with_expiration_multiplier(mut self, multiplier: u32) -> Self {
        self.expiration_multiplier = multiplier;
        self
    }

    /// Effective liveness scan interval
    pub fn check_interval(&self) -> Duration {
        self.check_interval.unwrap_or(self.pulse_interval / 3)
    }

    /// Heartbeat age after which an instance is no longer ready
    pub fn expiration(&self) -> Duration {
        self.pulse_interval * self.expiration_multiplier
    }

    pub fn validate(&self) -> Result<()> {
        if self.pulse_interval.is_zero() {
            return Err(ConvoyError::InvalidConfig(
                "pulse interval must be greater than zero".into(),
            ));
        }
        if self.check_interval().is_zero() {
            return Err(ConvoyError::InvalidConfig(
                "liveness check interval must be greater than zero".into(),
            ));
        }
        if self.expiration_multiplier == 0 {
            return Err(ConvoyError::InvalidConfig(
                "expiration multiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Consistent hash ring parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HashRingConfig {
    /// Number of hash buckets keys are spread over
    pub partition_count: usize,

    /// Virtual nodes per member
    pub replication_factor: usize,

    /// Maximum load of a member relative to the average
    pub load: f64,
}

impl Default for HashRingConfig {
    fn default() -> Self {
        Self {
            partition_count: 7,
            replication_factor: 20,
            load: 1.25,
        }
    }
}

impl HashRingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(ConvoyError::InvalidConfig(
                "hash ring partition count must be greater than zero".into(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(ConvoyError::InvalidConfig(
                "hash ring replication factor must be greater than zero".into(),
            ));
        }
        if !self.load.is_finite() || self.load < 1.0 {
            return Err(ConvoyError::InvalidConfig(format!(
                "hash ring load factor must be >= 1.0, got {}",
                self.load
            )));
        }
        Ok(())
    }
}

/// How a replica claims spec events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventFilterMode {
    /// The replica taking the event's advisory lock handles it
    #[default]
    Lock,
    /// Like `Lock`, but only replicas whose broker session serves the consumer may take it
    RoutedLock,
    /// Every replica serving the consumer handles it; reconciled once all ready replicas did
    Predicate,
}

impl std::str::FromStr for EventFilterMode {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "lock" => Ok(EventFilterMode::Lock),
            "routed_lock" => Ok(EventFilterMode::RoutedLock),
            "predicate" => Ok(EventFilterMode::Predicate),
            other => Err(ConvoyError::InvalidConfig(format!(
                "unsupported event filter: {other}"
            ))),
        }
    }
}

/// Event and status controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// How spec events are claimed
    #[serde(default)]
    pub event_filter: EventFilterMode,

    /// Concurrent workers draining the event queue
    pub workers: usize,

    /// Period of the full re-scan of unhandled rows
    pub sync_interval: Duration,

    /// Jitter factor applied to `sync_interval` (0.25 = up to +25%)
    pub sync_jitter: f64,

    /// First retry delay of a failed event
    pub retry_base_delay: Duration,

    /// Upper bound of the per-event retry delay
    pub retry_max_delay: Duration,

    /// Rows deleted per statement when purging handled status events
    pub purge_batch_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            event_filter: EventFilterMode::default(),
            workers: 4,
            sync_interval: Duration::from_secs(300),
            sync_jitter: 0.25,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_secs(60),
            purge_batch_size: 500,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ConvoyError::InvalidConfig(
                "controller workers must be greater than zero".into(),
            ));
        }
        if self.sync_interval.is_zero() {
            return Err(ConvoyError::InvalidConfig(
                "controller sync interval must be greater than zero".into(),
            ));
        }
        if self.purge_batch_size == 0 {
            return Err(ConvoyError::InvalidConfig(
                "purge batch size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Status dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Interval of the ring membership check against the instance table
    pub check_interval: Duration,

    /// Concurrent status resync workers
    pub resync_workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            resync_workers: 10,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() || self.resync_workers == 0 {
            return Err(ConvoyError::InvalidConfig(
                "dispatcher check interval and resync workers must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub url: String,

    /// Maximum pooled connections (advisory locks hold one each while held)
    pub pool_size: usize,

    /// Keep-alive ping interval of notification listeners
    pub keepalive_interval: Duration,

    /// Upper bound of the listener reconnect backoff
    pub reconnect_max_backoff: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "host=localhost user=convoy dbname=convoy".to_string(),
            pool_size: 16,
            keepalive_interval: Duration::from_secs(10),
            reconnect_max_backoff: Duration::from_secs(30),
        }
    }
}
