use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Request-path error types. Configuration problems are reported through
/// `anyhow` at startup and never reach this enum.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("plugin configuration error: {0}")]
    PluginConfig(String),

    #[error("rate limit rule '{0}' is not defined")]
    UnknownRateLimitRule(String),

    #[error("service '{0}' is not configured")]
    ServiceNotConfigured(String),

    #[error("service '{0}' has no registered instances")]
    NoInstances(String),

    #[error("service '{0}' has no healthy instances")]
    NoHealthyInstance(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::PluginConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UnknownRateLimitRule(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ServiceNotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoInstances(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
