// handlers/protected/family.rs - FamilyService procedures

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::app::AppState;
use crate::database::models::Family;
use crate::error::ApiError;
use crate::handlers::RpcRequest;
use crate::middleware::AuthContext;
use crate::services::family_service::FamilyMember;

#[derive(Debug, Deserialize)]
pub struct CreateFamilyRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinFamilyRequest {
    #[serde(default)]
    pub invite_code: String,
}

#[derive(Debug, Serialize)]
pub struct GetFamilyResponse {
    pub family: Family,
    pub members: Vec<FamilyMember>,
}

/// FamilyService/CreateFamily
pub async fn create_family(
    State(state): State<AppState>,
    ctx: AuthContext,
    RpcRequest(req): RpcRequest<CreateFamilyRequest>,
) -> Result<Json<Family>, ApiError> {
    let family = state.families.create_family(&ctx.user, &req.name).await?;
    Ok(Json(family))
}

/// FamilyService/JoinFamily
pub async fn join_family(
    State(state): State<AppState>,
    ctx: AuthContext,
    RpcRequest(req): RpcRequest<JoinFamilyRequest>,
) -> Result<Json<Family>, ApiError> {
    let family = state.families.join_family(&ctx.user, &req.invite_code).await?;
    Ok(Json(family))
}

/// FamilyService/LeaveFamily
pub async fn leave_family(State(state): State<AppState>, ctx: AuthContext) -> Result<Json<Value>, ApiError> {
    ctx.require_family()?;
    state.families.leave_family(&ctx.user).await?;
    Ok(Json(json!({})))
}

/// FamilyService/GetFamily
pub async fn get_family(State(state): State<AppState>, ctx: AuthContext) -> Result<Json<GetFamilyResponse>, ApiError> {
    let family_id = ctx.require_family()?;
    let family = state.families.get_family(family_id).await?;
    let members = state.families.list_members(family_id).await?;
    Ok(Json(GetFamilyResponse { family, members }))
}

/// FamilyService/DeleteFamily
pub async fn delete_family(State(state): State<AppState>, ctx: AuthContext) -> Result<Json<Value>, ApiError> {
    ctx.require_family_manager()?;
    state.families.delete_family(&ctx.user).await?;
    Ok(Json(json!({})))
}
