use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::api::responses::{ApiResponse, IdempotencyStatsResponse};
use crate::observability::{AggregatedHealth, HealthChecker};

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<AggregatedHealth>> {
    let checker = match &state.health_checker {
        Some(checker) => checker.clone(),
        None => std::sync::Arc::new(HealthChecker::new(
            state.coordinator.config().data_dir.clone(),
            state.coordinator.shared_cache(),
        )),
    };

    Json(ApiResponse::success(checker.check_all().await))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let ready = match &state.health_checker {
        Some(checker) => checker.is_ready().await,
        None => true,
    };

    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics not enabled".to_string()),
    }
}

/// Coordinator counters for this instance.
pub async fn idempotency_stats(
    State(state): State<AppState>,
) -> Json<ApiResponse<IdempotencyStatsResponse>> {
    let coordinator = &state.coordinator;
    Json(ApiResponse::success(IdempotencyStatsResponse {
        in_flight: coordinator.in_flight(),
        shared_cache: coordinator.shared_cache().map(|c| c.name().to_string()),
        counters: coordinator.metrics().snapshot(),
    }))
}
