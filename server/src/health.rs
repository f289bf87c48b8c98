use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    backends: BackendsStatus,
}

#[derive(Debug, Serialize)]
pub struct BackendsStatus {
    configured: usize,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
}

/// Liveness probe - 200 OK whenever the process is running.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe. Backends are built before the listener starts, so the
/// gateway is ready as soon as it serves traffic.
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let ready = !state.router.is_empty();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready }))
}

/// Health endpoint with a little detail for dashboards.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                backends: BackendsStatus {
                    configured: state.router.len(),
                },
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
