use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Data-plane errors surfaced to downstream clients
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No service configured for host: {0:?}")]
    RouteNotFound(String),

    #[error("No healthy backend servers available for: {0}")]
    NoHealthyBackend(String),

    #[error("Bad Gateway: {0}")]
    Upstream(String),

    #[error("Missing or invalid Host header")]
    MissingHost,
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::NoHealthyBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::MissingHost => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
