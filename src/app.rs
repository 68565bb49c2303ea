use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware,
    routing::post,
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::config::AppConfig;
use crate::database::manager::TenantRegistry;
use crate::handlers::{procedures, protected, public};
use crate::middleware::{auth_interceptor, log_calls};
use crate::services::{AuthService, FamilyService};

/// Shared application state handed to every handler and interceptor.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TenantRegistry>,
    pub auth: AuthService,
    pub families: FamilyService,
}

impl AppState {
    pub fn new(registry: Arc<TenantRegistry>, bcrypt_cost: u32) -> Self {
        let auth = AuthService::new(registry.master().clone(), bcrypt_cost);
        let families = FamilyService::new(registry.clone(), auth.clone());
        Self {
            registry,
            auth,
            families,
        }
    }
}

pub fn router(state: AppState, config: &AppConfig) -> Router {
    let router = Router::new()
        // Public
        .merge(public_routes())
        // Session required
        .merge(auth_routes())
        .merge(family_routes())
        .merge(expense_routes())
        .layer(middleware::from_fn_with_state(state.clone(), auth_interceptor));

    // Outside the auth interceptor so rejected calls are logged too
    let router = if config.api.enable_request_logging {
        router.layer(middleware::from_fn(log_calls))
    } else {
        router
    };

    router
        .layer(DefaultBodyLimit::max(config.api.max_request_size_bytes))
        .layer(cors_layer(&config.security.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn public_routes() -> Router<AppState> {
    Router::new()
        .route(procedures::REGISTER, post(public::auth::register))
        .route(procedures::LOGIN, post(public::auth::login))
        .route(procedures::HEALTH_CHECK, post(public::health::check).get(public::health::check))
}

fn auth_routes() -> Router<AppState> {
    use protected::auth;

    Router::new()
        .route(procedures::LOGOUT, post(auth::logout))
        .route(procedures::REFRESH_SESSION, post(auth::refresh_session))
        .route(procedures::VALIDATE_SESSION, post(auth::validate_session))
}

fn family_routes() -> Router<AppState> {
    use protected::family;

    Router::new()
        .route(procedures::CREATE_FAMILY, post(family::create_family))
        .route(procedures::JOIN_FAMILY, post(family::join_family))
        .route(procedures::LEAVE_FAMILY, post(family::leave_family))
        .route(procedures::GET_FAMILY, post(family::get_family))
        .route(procedures::DELETE_FAMILY, post(family::delete_family))
}

fn expense_routes() -> Router<AppState> {
    use protected::expense;

    Router::new()
        .route(procedures::CREATE_CATEGORY, post(expense::create_category))
        .route(procedures::LIST_CATEGORIES, post(expense::list_categories))
        .route(procedures::DELETE_CATEGORY, post(expense::delete_category))
        .route(procedures::CREATE_EXPENSE, post(expense::create_expense))
        .route(procedures::LIST_EXPENSES, post(expense::list_expenses))
        .route(procedures::DELETE_EXPENSE, post(expense::delete_expense))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(ctx: &TestContext) -> Router {
        let state = AppState {
            registry: ctx.registry.clone(),
            auth: ctx.auth.clone(),
            families: ctx.families.clone(),
        };
        router(state, &AppConfig::from_env())
    }

    fn call(path: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_check_is_public() {
        let ctx = TestContext::new().await;
        let response = app(&ctx).oneshot(call(procedures::HEALTH_CHECK, None, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_procedures_require_a_session() {
        let ctx = TestContext::new().await;
        let response = app(&ctx).oneshot(call(procedures::GET_FAMILY, None, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(&ctx)
            .oneshot(call(procedures::GET_FAMILY, Some("Bearer nope"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn family_gating_uses_distinct_codes() {
        let ctx = TestContext::new().await;
        ctx.register("alice@x.com", "Alice").await;
        let login = ctx.auth.login("alice@x.com", "password123", "", "").await.unwrap();
        let bearer = format!("Bearer {}", login.token);

        // No family yet
        let response = app(&ctx)
            .oneshot(call(procedures::LIST_CATEGORIES, Some(&bearer), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(&ctx)
            .oneshot(call(procedures::CREATE_FAMILY, Some(&bearer), r#"{"name":"Smiths"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&ctx)
            .oneshot(call(procedures::LIST_CATEGORIES, Some(&bearer), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_argument() {
        let ctx = TestContext::new().await;
        let response = app(&ctx).oneshot(call(procedures::REGISTER, None, "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
