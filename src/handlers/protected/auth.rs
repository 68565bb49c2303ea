// handlers/protected/auth.rs - Session operations on the caller's own session

use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::app::AppState;
use crate::database::models::{Session, User};
use crate::handlers::RpcRequest;
use crate::middleware::{envelope, ApiResult, AuthContext};
use crate::services::{SessionCredential, ValidatedSession};

#[derive(Debug, Default, Deserialize)]
pub struct ValidateSessionRequest {
    /// Token to check. Defaults to the caller's own session.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    pub session: Option<Session>,
    pub user: Option<User>,
    pub family_id: Option<String>,
}

impl From<Option<ValidatedSession>> for ValidateSessionResponse {
    fn from(validated: Option<ValidatedSession>) -> Self {
        match validated {
            Some(v) => Self {
                valid: true,
                family_id: v.family_id().map(str::to_string),
                session: Some(v.session),
                user: Some(v.user),
            },
            None => Self {
                valid: false,
                session: None,
                user: None,
                family_id: None,
            },
        }
    }
}

/// AuthService/Logout
pub async fn logout(State(state): State<AppState>, ctx: AuthContext) -> ApiResult<Value> {
    envelope(state.auth.logout(&ctx.session_id).await.map(|()| json!({})))
}

/// AuthService/RefreshSession
pub async fn refresh_session(State(state): State<AppState>, ctx: AuthContext) -> ApiResult<Session> {
    envelope(state.auth.refresh_session(&ctx.session_id).await)
}

/// AuthService/ValidateSession
pub async fn validate_session(
    State(state): State<AppState>,
    ctx: AuthContext,
    RpcRequest(req): RpcRequest<ValidateSessionRequest>,
) -> ApiResult<ValidateSessionResponse> {
    let result = match req.token.as_deref().and_then(SessionCredential::parse) {
        Some(credential) => state.auth.validate_credential(&credential).await,
        None => state.auth.validate_session_by_id(&ctx.session_id).await,
    };
    envelope(result.map(ValidateSessionResponse::from))
}
