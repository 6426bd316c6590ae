use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chatline::protocol::Reply;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidRequest(_) | RelayError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::ConnectionClosed(_) => StatusCode::GONE,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to a client. Internal causes are not exposed.
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if let RelayError::Internal(e) = &self {
            tracing::error!(error = %format!("{e:#}"), "request failed");
        }
        (self.status(), Json(Reply::fail(self.public_message()))).into_response()
    }
}
