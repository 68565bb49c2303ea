// Transport-level RPC errors
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::database::manager::DatabaseError;
use crate::services::auth_service::AuthError;
use crate::services::expense_service::ExpenseError;
use crate::services::family_service::FamilyError;

/// RPC error with a stable code and a client-safe message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    // 400 Bad Request
    InvalidArgument(String),
    FailedPrecondition(String),

    // 401 Unauthorized
    Unauthenticated(String),

    // 403 Forbidden
    PermissionDenied(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict
    AlreadyExists(String),

    // 500 Internal Server Error
    Internal(String),

    // 503 Service Unavailable
    Unavailable(String),
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::FailedPrecondition(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidArgument(msg)
            | ApiError::FailedPrecondition(msg)
            | ApiError::Unauthenticated(msg)
            | ApiError::PermissionDenied(msg)
            | ApiError::NotFound(msg)
            | ApiError::AlreadyExists(msg)
            | ApiError::Internal(msg)
            | ApiError::Unavailable(msg) => msg,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(_) => "invalid_argument",
            ApiError::FailedPrecondition(_) => "failed_precondition",
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::PermissionDenied(_) => "permission_denied",
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyExists(_) => "already_exists",
            ApiError::Internal(_) => "internal",
            ApiError::Unavailable(_) => "unavailable",
        }
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        json!({
            "code": self.error_code(),
            "message": self.message()
        })
    }
}

// Static constructor methods
impl ApiError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ApiError::InvalidArgument(message.into())
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        ApiError::FailedPrecondition(message.into())
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        ApiError::Unauthenticated(message.into())
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        ApiError::PermissionDenied(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        ApiError::AlreadyExists(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ApiError::Unavailable(message.into())
    }
}

// Convert other error types to ApiError. Internal details are logged here,
// once, and replaced by a generic message.
impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => ApiError::not_found(msg),
            DatabaseError::TenantNotFound(family_id) => {
                tracing::error!(family_id = %family_id, "Tenant database not registered");
                ApiError::internal("Family database is unavailable")
            }
            DatabaseError::Conflict(msg) => ApiError::already_exists(msg),
            DatabaseError::Provisioning { database, source } => {
                tracing::error!(database = %database, error = %source, "Provisioning error");
                ApiError::internal("Family database is unavailable")
            }
            DatabaseError::Migration(e) => {
                tracing::error!(error = %e, "Migration error");
                ApiError::unavailable("Service is being updated, please try again later")
            }
            DatabaseError::Sqlx(sqlx_err) => {
                // Log the real error but return generic message
                tracing::error!(error = %sqlx_err, "SQLx error");
                ApiError::internal("An error occurred while processing your request")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Database(e) => e.into(),
            AuthError::Hashing(msg) => {
                tracing::error!(error = %msg, "Password hashing failed");
                ApiError::internal("An error occurred while processing your request")
            }
            AuthError::InvalidCredentials | AuthError::InvalidSession => ApiError::unauthenticated(err.to_string()),
            AuthError::UserExists => ApiError::already_exists(err.to_string()),
            AuthError::InvalidEmail | AuthError::WeakPassword | AuthError::MissingFields(_) => {
                ApiError::invalid_argument(err.to_string())
            }
        }
    }
}

impl From<FamilyError> for ApiError {
    fn from(err: FamilyError) -> Self {
        match err {
            FamilyError::Database(e) => e.into(),
            FamilyError::Auth(e) => e.into(),
            FamilyError::InvalidName(_) => ApiError::invalid_argument(err.to_string()),
            FamilyError::InvalidInviteCode | FamilyError::FamilyNotFound => ApiError::not_found(err.to_string()),
            FamilyError::AlreadyInFamily | FamilyError::NotInFamily | FamilyError::ManagerCannotLeave => {
                ApiError::failed_precondition(err.to_string())
            }
            FamilyError::NotManager => ApiError::permission_denied(err.to_string()),
        }
    }
}

impl From<ExpenseError> for ApiError {
    fn from(err: ExpenseError) -> Self {
        match err {
            ExpenseError::Database(e) => e.into(),
            ExpenseError::Sqlx(e) => DatabaseError::Sqlx(e).into(),
            ExpenseError::CorruptAmount(raw) => {
                tracing::error!(amount = %raw, "Stored amount could not be parsed");
                ApiError::internal("An error occurred while processing your request")
            }
            ExpenseError::InvalidAmount | ExpenseError::InvalidName | ExpenseError::UnknownMember(_) => {
                ApiError::invalid_argument(err.to_string())
            }
            ExpenseError::CategoryExists(_) => ApiError::already_exists(err.to_string()),
            ExpenseError::CategoryNotFound(_) | ExpenseError::ExpenseNotFound(_) => ApiError::not_found(err.to_string()),
        }
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), Json(self.to_json())).into_response()
    }
}
