// handlers/mod.rs - RPC handlers, one per procedure
//
// Public handlers run without a session. Protected handlers receive the
// AuthContext attached by the auth interceptor.

use axum::{
    async_trait,
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::ApiError;

pub mod protected;
pub mod public;

/// Procedure paths. The path of a call is its procedure name.
pub mod procedures {
    pub const REGISTER: &str = "/tally.v1.AuthService/Register";
    pub const LOGIN: &str = "/tally.v1.AuthService/Login";
    pub const LOGOUT: &str = "/tally.v1.AuthService/Logout";
    pub const REFRESH_SESSION: &str = "/tally.v1.AuthService/RefreshSession";
    pub const VALIDATE_SESSION: &str = "/tally.v1.AuthService/ValidateSession";

    pub const CREATE_FAMILY: &str = "/tally.v1.FamilyService/CreateFamily";
    pub const JOIN_FAMILY: &str = "/tally.v1.FamilyService/JoinFamily";
    pub const LEAVE_FAMILY: &str = "/tally.v1.FamilyService/LeaveFamily";
    pub const GET_FAMILY: &str = "/tally.v1.FamilyService/GetFamily";
    pub const DELETE_FAMILY: &str = "/tally.v1.FamilyService/DeleteFamily";

    pub const CREATE_CATEGORY: &str = "/tally.v1.ExpenseService/CreateCategory";
    pub const LIST_CATEGORIES: &str = "/tally.v1.ExpenseService/ListCategories";
    pub const DELETE_CATEGORY: &str = "/tally.v1.ExpenseService/DeleteCategory";
    pub const CREATE_EXPENSE: &str = "/tally.v1.ExpenseService/CreateExpense";
    pub const LIST_EXPENSES: &str = "/tally.v1.ExpenseService/ListExpenses";
    pub const DELETE_EXPENSE: &str = "/tally.v1.ExpenseService/DeleteExpense";

    pub const HEALTH_CHECK: &str = "/tally.v1.HealthService/Check";
}

/// JSON request message. Malformed bodies are rejected as `invalid_argument`
/// in the same error shape as every other failure.
pub struct RpcRequest<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for RpcRequest<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(message) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::invalid_argument(rejection.body_text()))?;
        Ok(RpcRequest(message))
    }
}
