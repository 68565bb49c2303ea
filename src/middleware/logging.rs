use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::auth::CallIdentity;
use super::response::ApplicationError;

/// One structured event per call, public or not.
///
/// Mounted outside [`auth_interceptor`](super::auth::auth_interceptor), so it
/// reads the caller identity back from the response extensions.
pub async fn log_calls(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let procedure = request.uri().path().to_string();
    let request_id = Uuid::new_v4();

    let response = next.run(request).await;

    let duration_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    let identity = response.extensions().get::<CallIdentity>().cloned().unwrap_or_default();
    let user_id = identity.user_id.as_deref().unwrap_or("-");
    let family_id = identity.family_id.as_deref().unwrap_or("-");
    let app_error = response.extensions().get::<ApplicationError>().map(|e| e.0);

    if response.status().is_server_error() {
        error!(%request_id, procedure = %procedure, user_id, family_id, duration_ms, status, outcome = "error", "rpc call");
    } else if response.status().is_client_error() {
        warn!(%request_id, procedure = %procedure, user_id, family_id, duration_ms, status, outcome = "error", "rpc call");
    } else if let Some(code) = app_error {
        info!(%request_id, procedure = %procedure, user_id, family_id, duration_ms, status, outcome = "error", code, "rpc call");
    } else {
        info!(%request_id, procedure = %procedure, user_id, family_id, duration_ms, status, outcome = "success", "rpc call");
    }

    response
}
