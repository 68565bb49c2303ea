use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;
use crate::services::AuthError;

/// Application-level outcome carried inside an HTTP 200 body.
///
/// Auth procedures report expected failures (bad password, taken email) here
/// rather than through the transport status, so callers check both.
#[derive(Debug)]
pub enum ApiResponse<T: Serialize> {
    Success(T),
    Failure { code: &'static str, message: String },
}

/// Marker left on responses whose envelope reports a failure.
#[derive(Clone, Copy, Debug)]
pub struct ApplicationError(pub &'static str);

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        ApiResponse::Success(data)
    }

    pub fn failure(code: &'static str, message: impl Into<String>) -> Self {
        ApiResponse::Failure {
            code,
            message: message.into(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success(data) => {
                // Convert data to JSON Value for consistent envelope format
                let data_value = match serde_json::to_value(&data) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::error!("Failed to serialize response data: {}", e);
                        return ApiError::internal("Failed to serialize response data").into_response();
                    }
                };

                (StatusCode::OK, Json(json!({ "success": true, "data": data_value }))).into_response()
            }
            ApiResponse::Failure { code, message } => {
                let body = json!({
                    "success": false,
                    "error": { "code": code, "message": message }
                });
                let mut response = (StatusCode::OK, Json(body)).into_response();
                response.extensions_mut().insert(ApplicationError(code));
                response
            }
        }
    }
}

/// Split an auth result: client mistakes go into the envelope, faults become transport errors.
pub fn envelope<T: Serialize>(result: Result<T, AuthError>) -> ApiResult<T> {
    match result {
        Ok(data) => Ok(ApiResponse::success(data)),
        Err(e) if e.is_client_error() => Ok(ApiResponse::failure(e.code(), e.to_string())),
        Err(e) => Err(e.into()),
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_stay_in_the_envelope() {
        let response = envelope::<()>(Err(AuthError::WeakPassword)).unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.extensions().get::<ApplicationError>().is_some());
    }

    #[test]
    fn faults_become_transport_errors() {
        let err = envelope::<()>(Err(AuthError::Hashing("boom".to_string()))).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message().contains("boom"));
    }
}
