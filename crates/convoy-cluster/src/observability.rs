//! Metrics for the coordination layer
//!
//! Thin facades over the `metrics` crate with Prometheus export. With the
//! `metrics-prometheus` feature disabled every call compiles to nothing.
//!
//! ```rust,ignore
//! use convoy_cluster::observability::{LockMetrics, init_metrics};
//!
//! init_metrics(None)?;
//! LockMetrics::increment_contended(LockClass::Events);
//! ```

use crate::lock::LockClass;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Lock Metrics
// ============================================================================

/// Advisory lock metrics
pub struct LockMetrics;

impl LockMetrics {
    /// Time spent waiting for a lock that was granted
    pub fn record_acquired(class: LockClass, wait: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("convoy_lock_wait_seconds", "class" => class.as_str())
            .record(wait.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (class, wait);
    }

    /// A try-lock found the lock held elsewhere
    pub fn increment_contended(class: LockClass) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_lock_contended_total", "class" => class.as_str()).increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = class;
    }

    /// Acquisition failed with an error
    pub fn increment_failures(class: LockClass) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_lock_failures_total", "class" => class.as_str()).increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = class;
    }

    pub fn record_held(class: LockClass, held: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("convoy_lock_held_seconds", "class" => class.as_str())
            .record(held.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (class, held);
    }
}

// ============================================================================
// Notification Metrics
// ============================================================================

/// LISTEN/NOTIFY metrics
pub struct NotifyMetrics;

impl NotifyMetrics {
    pub fn increment_received(channel: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_notify_received_total", "channel" => channel.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = channel;
    }

    /// Listener connection re-established after a failure
    pub fn increment_reconnects(channel: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_notify_reconnects_total", "channel" => channel.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = channel;
    }
}

// ============================================================================
// Controller Metrics
// ============================================================================

/// Event and status controller metrics, labelled by controller name
pub struct ControllerMetrics;

impl ControllerMetrics {
    pub fn increment_handled(controller: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_controller_handled_total", "controller" => controller)
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = controller;
    }

    /// A handler failed and the key was re-queued with backoff
    pub fn increment_retries(controller: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_controller_retries_total", "controller" => controller)
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = controller;
    }

    pub fn set_queue_depth(controller: &'static str, depth: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("convoy_controller_queue_depth", "controller" => controller)
            .set(depth as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (controller, depth);
    }

    /// Rows removed by a periodic sync
    pub fn add_purged(controller: &'static str, rows: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_controller_purged_total", "controller" => controller)
            .increment(rows);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (controller, rows);
    }

    pub fn record_sync(controller: &'static str, duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("convoy_controller_sync_seconds", "controller" => controller)
            .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (controller, duration);
    }
}

// ============================================================================
// Liveness Metrics
// ============================================================================

/// Heartbeat and readiness metrics
pub struct LivenessMetrics;

impl LivenessMetrics {
    pub fn increment_heartbeats() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_liveness_heartbeats_total").increment(1);
    }

    pub fn increment_heartbeat_failures() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_liveness_heartbeat_failures_total").increment(1);
    }

    pub fn set_ready_instances(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("convoy_liveness_ready_instances").set(count as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    /// Readiness flips; `direction` is "ready" or "unready"
    pub fn add_transitions(direction: &'static str, count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_liveness_transitions_total", "direction" => direction)
            .increment(count as u64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (direction, count);
    }
}

// ============================================================================
// Dispatch Metrics
// ============================================================================

/// Consumer ownership metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn set_owned_consumers(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("convoy_dispatch_owned_consumers").set(count as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    pub fn set_ring_members(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("convoy_dispatch_ring_members").set(count as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    /// Status resync requests sent to agents
    pub fn add_resyncs(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_dispatch_resyncs_total").increment(count as u64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    /// Status reports dropped because another replica owns the consumer
    pub fn increment_not_owned() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_dispatch_not_owned_total").increment(1);
    }
}

// ============================================================================
// Broadcast Metrics
// ============================================================================

/// In-process subscriber fan-out metrics
pub struct BroadcastMetrics;

impl BroadcastMetrics {
    pub fn set_subscribers(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("convoy_broadcast_subscribers").set(count as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    pub fn increment_delivered() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_broadcast_delivered_total").increment(1);
    }

    /// Subscriber removed; `reason` is "queue_full", "handler_error" or "unregistered"
    pub fn increment_disconnected(reason: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("convoy_broadcast_disconnected_total", "reason" => reason).increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = reason;
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Install the recorder and serve `/metrics` on `addr`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }

    /// Install the recorder without a server, for embedding in an existing router
    pub fn init_prometheus_recorder() -> Result<
        metrics_exporter_prometheus::PrometheusHandle,
        Box<dyn std::error::Error + Send + Sync>,
    > {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(handle)
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::{init_prometheus_exporter, init_prometheus_recorder};

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem. Safe to call more than once.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = prometheus_addr;

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}
