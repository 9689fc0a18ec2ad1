use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, info};

use crate::metrics::MetricsCollector;

// ---------------------------------------------------------------------------
// Health/metrics endpoint shared by the coordinator and runner binaries
// ---------------------------------------------------------------------------

/// What `/healthz` reports about this process.
#[derive(Clone)]
pub struct HealthState {
    pub instance_id: String,
    /// "coordinator" or "runner".
    pub role: &'static str,
    /// Present only on coordinators; reflects the cached leader flag.
    pub is_leader: Option<Arc<AtomicBool>>,
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsCollector>,
    health: HealthState,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::json!({
        "status": "ok",
        "instance_id": state.health.instance_id,
        "role": state.health.role,
    });
    if let Some(flag) = &state.health.is_leader {
        body["is_leader"] = serde_json::json!(flag.load(Ordering::Relaxed));
    }
    Json(body)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
}

/// Router serving `/healthz` and `/metrics`.
pub fn router(metrics_collector: Arc<MetricsCollector>, health: HealthState) -> Router {
    let state = AppState {
        metrics: metrics_collector,
        health,
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind and serve the observability router in a background task.
/// Returns the bound address (useful with port 0).
pub async fn spawn_server(
    addr: &str,
    metrics_collector: Arc<MetricsCollector>,
    health: HealthState,
) -> std::io::Result<std::net::SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let app = router(metrics_collector, health);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "observability server error");
        }
    });
    info!(%bound, "observability server listening");
    Ok(bound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn health(role: &'static str, leader: Option<bool>) -> HealthState {
        HealthState {
            instance_id: "test-1".into(),
            role,
            is_leader: leader.map(|v| Arc::new(AtomicBool::new(v))),
        }
    }

    #[tokio::test]
    async fn healthz_reports_role_and_leadership() {
        let metrics_collector = Arc::new(MetricsCollector::with_defaults());
        let bound = spawn_server("127.0.0.1:0", metrics_collector, health("coordinator", Some(true)))
            .await
            .unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://{bound}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["role"], "coordinator");
        assert_eq!(body["is_leader"], true);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let metrics_collector = Arc::new(MetricsCollector::with_defaults());
        metrics_collector.increment_counter("work_claimed_total", &[]);
        let bound = spawn_server("127.0.0.1:0", metrics_collector, health("runner", None))
            .await
            .unwrap();

        let text = reqwest::get(format!("http://{bound}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("work_claimed_total 1"));
    }
}
