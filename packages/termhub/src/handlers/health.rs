use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::breaker::CircuitState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub active_sessions: u64,
    pub live_connections: u64,
    pub circuit_state: CircuitState,
    pub buffer_overflow_count: u64,
    pub uptime_secs: u64,
}

/// Health check endpoint; "degraded" while the persistence circuit is
/// open, since live operation continues regardless.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    let circuit = state.persist.breaker().state().await;

    let status = if circuit == CircuitState::Open {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthStatus {
        status: status.to_string(),
        active_sessions: snapshot.sessions.active,
        live_connections: snapshot.connections.live,
        circuit_state: circuit,
        buffer_overflow_count: snapshot.streaming.buffer_overflows,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Liveness probe; 200 whenever the process is serving requests.
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe; checks the session store when persistence is on.
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let store_ok = match &state.store {
        Some(store) => store.pool.acquire().await.is_ok(),
        None => true,
    };

    if store_ok {
        Json(serde_json::json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "store": "disconnected" })),
        )
            .into_response()
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_app_state;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn health_reports_healthy_with_closed_circuit() {
        let state = test_app_state().await;
        let resp = health_handler(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["circuit_state"], "closed");
        assert!(json.get("active_sessions").is_some());
        assert!(json.get("live_connections").is_some());
        assert!(json.get("buffer_overflow_count").is_some());
    }

    #[tokio::test]
    async fn liveness_is_always_200() {
        let resp = health_live_handler().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_without_store_is_200() {
        let state = test_app_state().await;
        let resp = health_ready_handler(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_snapshot_serializes() {
        let state = test_app_state().await;
        let resp = metrics_handler(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.get("sessions").is_some());
        assert!(json.get("streaming").is_some());
        assert!(json.get("events_dropped").is_some());
    }
}
