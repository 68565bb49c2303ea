use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sqlx::SqlitePool;
use tracing::error;

use crate::app::AppState;
use crate::database::manager::TenantPool;
use crate::database::models::{Role, User};
use crate::error::ApiError;
use crate::handlers::procedures;
use crate::services::{SessionCredential, ValidatedSession};

/// Procedures reachable without a session. Matched on the exact path.
pub const PUBLIC_PROCEDURES: &[&str] = &[procedures::REGISTER, procedures::LOGIN, procedures::HEALTH_CHECK];

pub fn is_public_procedure(path: &str) -> bool {
    PUBLIC_PROCEDURES.contains(&path)
}

/// Caller identity attached to the request by [`auth_interceptor`].
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user: User,
    pub user_id: String,
    pub family_id: Option<String>,
    pub role: Option<Role>,
    pub session_id: String,
    pub tenant: Option<TenantPool>,
}

/// Who made a call, copied onto the response for the logging interceptor.
#[derive(Clone, Debug, Default)]
pub struct CallIdentity {
    pub user_id: Option<String>,
    pub family_id: Option<String>,
}

impl AuthContext {
    pub fn from_validated(validated: &ValidatedSession, tenant: Option<TenantPool>) -> Self {
        Self {
            user: validated.user.clone(),
            user_id: validated.user.id.clone(),
            family_id: validated.family_id().map(str::to_string),
            role: validated.role(),
            session_id: validated.session.id.clone(),
            tenant,
        }
    }

    /// The caller's family id, or `FailedPrecondition` when they have none.
    pub fn require_family(&self) -> Result<&str, ApiError> {
        self.family_id
            .as_deref()
            .ok_or_else(|| ApiError::failed_precondition("You must belong to a family to do this"))
    }

    /// Like [`require_family`](Self::require_family), additionally requiring the manager role.
    pub fn require_family_manager(&self) -> Result<&str, ApiError> {
        let family_id = self.require_family()?;
        match self.role {
            Some(Role::Manager) => Ok(family_id),
            _ => Err(ApiError::permission_denied("Only the family manager can do this")),
        }
    }

    /// The tenant database of the caller's family.
    pub fn tenant(&self) -> Result<&SqlitePool, ApiError> {
        self.require_family()?;
        match &self.tenant {
            Some(TenantPool(pool)) => Ok(pool),
            None => {
                error!(user_id = %self.user_id, "Family session without a tenant connection");
                Err(ApiError::internal("Family database is unavailable"))
            }
        }
    }

    fn identity(&self) -> CallIdentity {
        CallIdentity {
            user_id: Some(self.user_id.clone()),
            family_id: self.family_id.clone(),
        }
    }
}

/// Handlers take `AuthContext` as an argument; a missing context means the
/// route was mounted outside the interceptor.
#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| ApiError::unauthenticated("Authentication required"))
    }
}

/// Authenticate every non-public call and attach an [`AuthContext`].
///
/// The interceptor only populates context. Per-procedure authorization is
/// left to the handlers through the `require_*` helpers.
pub async fn auth_interceptor(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if is_public_procedure(request.uri().path()) {
        return next.run(request).await;
    }

    let context = match authenticate(&state, request.headers()).await {
        Ok(context) => context,
        Err(err) => return err.into_response(),
    };

    let identity = context.identity();
    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;
    response.extensions_mut().insert(identity);
    response
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let credential = extract_credential(headers)?;

    let validated = match state.auth.validate_credential(&credential).await {
        Ok(Some(validated)) => validated,
        Ok(None) => return Err(ApiError::unauthenticated("Invalid or expired session")),
        Err(e) => {
            error!(error = %e, "Session validation failed");
            return Err(ApiError::internal("An error occurred while processing your request"));
        }
    };

    let tenant = match validated.family_id() {
        Some(family_id) => match state.registry.resolve(family_id).await {
            Ok(pool) => Some(TenantPool(pool)),
            Err(e) => {
                // The session is fine, the tenant is not: infrastructure fault
                error!(family_id, user_id = %validated.user.id, error = %e, "Failed to resolve tenant database");
                return Err(ApiError::internal("Family database is unavailable"));
            }
        },
        None => None,
    };

    Ok(AuthContext::from_validated(&validated, tenant))
}

fn extract_credential(headers: &HeaderMap) -> Result<SessionCredential, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthenticated("Missing Authorization header"))?;

    let raw = value
        .to_str()
        .map_err(|_| ApiError::unauthenticated("Invalid Authorization header format"))?;

    SessionCredential::parse(raw).ok_or_else(|| ApiError::unauthenticated("Empty session token"))
}
