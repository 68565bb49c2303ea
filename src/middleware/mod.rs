pub mod auth;
pub mod logging;
pub mod response;

pub use auth::{auth_interceptor, AuthContext, CallIdentity, PUBLIC_PROCEDURES};
pub use logging::log_calls;
pub use response::{envelope, ApiResponse, ApiResult};
