// handlers/public/auth.rs - Register and Login

use axum::{
    extract::{ConnectInfo, State},
    http::{header::USER_AGENT, HeaderMap},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::app::AppState;
use crate::database::models::{Session, User};
use crate::handlers::RpcRequest;
use crate::middleware::{envelope, ApiResult};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub session: Session,
    pub user: User,
}

/// AuthService/Register
pub async fn register(State(state): State<AppState>, RpcRequest(req): RpcRequest<RegisterRequest>) -> ApiResult<User> {
    envelope(state.auth.register(&req.email, &req.name, &req.password).await)
}

/// AuthService/Login
///
/// The token in the response is the only copy the server ever hands out.
pub async fn login(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    RpcRequest(req): RpcRequest<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let ip_address = client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    let result = state
        .auth
        .login(&req.email, &req.password, user_agent, &ip_address)
        .await
        .map(|login| LoginResponse {
            token: login.token,
            session: login.session,
            user: login.user,
        });
    envelope(result)
}

// First hop of X-Forwarded-For wins over the socket peer
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}
