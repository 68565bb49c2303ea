// handlers/protected/expense.rs - ExpenseService procedures
//
// Every call runs against the caller's tenant database.

use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::database::models::{Category, Expense};
use crate::error::ApiError;
use crate::handlers::RpcRequest;
use crate::middleware::AuthContext;
use crate::services::{ExpenseService, NewExpense};

#[derive(Debug, Deserialize)]
pub struct CreateCategoryRequest {
    #[serde(default)]
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListExpensesRequest {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListCategoriesResponse {
    pub categories: Vec<Category>,
}

#[derive(Debug, Serialize)]
pub struct ListExpensesResponse {
    pub expenses: Vec<Expense>,
}

fn service(ctx: &AuthContext) -> Result<ExpenseService, ApiError> {
    Ok(ExpenseService::new(ctx.tenant()?.clone()))
}

/// ExpenseService/CreateCategory
pub async fn create_category(
    ctx: AuthContext,
    RpcRequest(req): RpcRequest<CreateCategoryRequest>,
) -> Result<Json<Category>, ApiError> {
    let category = service(&ctx)?
        .create_category(&ctx.user_id, &req.name, req.color.as_deref())
        .await?;
    Ok(Json(category))
}

/// ExpenseService/ListCategories
pub async fn list_categories(ctx: AuthContext) -> Result<Json<ListCategoriesResponse>, ApiError> {
    let categories = service(&ctx)?.list_categories().await?;
    Ok(Json(ListCategoriesResponse { categories }))
}

/// ExpenseService/DeleteCategory (manager only)
pub async fn delete_category(ctx: AuthContext, RpcRequest(req): RpcRequest<DeleteRequest>) -> Result<Json<Value>, ApiError> {
    ctx.require_family_manager()?;
    service(&ctx)?.delete_category(&req.id).await?;
    Ok(Json(json!({})))
}

/// ExpenseService/CreateExpense
pub async fn create_expense(ctx: AuthContext, RpcRequest(req): RpcRequest<NewExpense>) -> Result<Json<Expense>, ApiError> {
    let expense = service(&ctx)?.create_expense(&ctx.user_id, req).await?;
    Ok(Json(expense))
}

/// ExpenseService/ListExpenses
pub async fn list_expenses(
    ctx: AuthContext,
    RpcRequest(req): RpcRequest<ListExpensesRequest>,
) -> Result<Json<ListExpensesResponse>, ApiError> {
    let expenses = service(&ctx)?.list_expenses(req.limit).await?;
    Ok(Json(ListExpensesResponse { expenses }))
}

/// ExpenseService/DeleteExpense
pub async fn delete_expense(ctx: AuthContext, RpcRequest(req): RpcRequest<DeleteRequest>) -> Result<Json<Value>, ApiError> {
    service(&ctx)?.delete_expense(&req.id).await?;
    Ok(Json(json!({})))
}
