//! Health and metrics endpoints
//!
//! - `GET /healthz`: 200 once this replica's instance row is ready,
//!   503 before that, 500 when the store cannot be read
//! - `GET /metrics`: Prometheus text exposition (when enabled)

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use convoy_cluster::{HealthCheck, HealthStatus};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(feature = "metrics-prometheus")]
use metrics_exporter_prometheus::PrometheusHandle;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    health: Arc<HealthCheck>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<PrometheusHandle>,
}

impl HttpState {
    pub fn new(health: Arc<HealthCheck>) -> Self {
        Self {
            health,
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn create_router(state: HttpState) -> Router {
    let router = Router::new().route("/healthz", get(healthz_handler));

    #[cfg(feature = "metrics-prometheus")]
    let router = if state.metrics.is_some() {
        router.route("/metrics", get(metrics_handler))
    } else {
        router
    };

    router.with_state(state)
}

async fn healthz_handler(State(state): State<HttpState>) -> impl IntoResponse {
    match state.health.check().await {
        Ok(HealthStatus::Ready) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                error: None,
            }),
        ),
        Ok(HealthStatus::NotReady) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not ready",
                error: None,
            }),
        ),
        Err(e) => {
            warn!("health check failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HealthResponse {
                    status: "error",
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

#[cfg(feature = "metrics-prometheus")]
async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Serve the endpoints until `cancel` fires
pub async fn serve(
    bind_addr: SocketAddr,
    state: HttpState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("HTTP endpoints listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use convoy_cluster::store::InstanceStore;
    use convoy_cluster::MemoryStore;
    use tower::ServiceExt;

    async fn get_healthz(app: Router) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_follows_readiness() {
        let store = Arc::new(MemoryStore::default());
        let state = HttpState::new(Arc::new(HealthCheck::new("convoy-0", store.clone())));

        // no instance row yet
        let (status, body) = get_healthz(create_router(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not ready");

        store.upsert_heartbeat("convoy-0", Utc::now()).await.unwrap();
        let (status, _) = get_healthz(create_router(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        store.mark_ready(&["convoy-0".to_string()]).await.unwrap();
        let (status, body) = get_healthz(create_router(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_metrics_route_absent_without_handle() {
        let store = Arc::new(MemoryStore::default());
        let app = create_router(HttpState::new(Arc::new(HealthCheck::new("a", store))));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
