// handlers/public/health.rs - HealthService/Check

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::app::AppState;
use crate::database::manager::TargetHealth;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub master: TargetHealth,
    pub tenants_checked: usize,
    pub tenants_unavailable: usize,
}

/// Summary only: per-family targets stay out of a public response.
pub async fn check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.registry.health_check().await;

    let master = report.targets.get("master").copied().unwrap_or(TargetHealth::Unavailable);
    let tenants: Vec<&TargetHealth> = report
        .targets
        .iter()
        .filter(|(target, _)| target.starts_with("family:"))
        .map(|(_, health)| health)
        .collect();
    let tenants_unavailable = tenants.iter().filter(|h| !matches!(h, TargetHealth::Ok)).count();

    let (code, status) = if report.is_healthy() {
        (StatusCode::OK, "serving")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_serving")
    };

    (
        code,
        Json(HealthResponse {
            status,
            master,
            tenants_checked: tenants.len(),
            tenants_unavailable,
        }),
    )
}
