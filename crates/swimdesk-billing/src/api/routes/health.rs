use crate::api::types::HealthResponse;
use crate::api::AppState;
use axum::{extract::State, response::Json};

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "swimdesk-billing".to_string(),
        timestamp: state.clock.now(),
    })
}

/// Prometheus text exposition
pub async fn render_metrics(State(state): State<AppState>) -> String {
    match &state.metrics {
        Some(recorder) => recorder.render(),
        None => "# Metrics collection disabled\n".to_string(),
    }
}
