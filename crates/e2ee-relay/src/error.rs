//! `RelayError` maps server-side failures onto HTTP statuses (§9). Unlike
//! `e2ee_crypto::error::CryptoError`, this enum is axum-facing: every variant
//! knows its own status code and JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("too many one-time prekeys in one request")]
    TooManyOneTimePrekeys,

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("unknown recipient {0}")]
    UnknownRecipient(String),

    #[error("unknown message {0}")]
    UnknownMessage(i64),

    #[error("not authorized")]
    Unauthorized,

    #[error("rate limited, retry later")]
    RateLimited,

    #[error("storage error: {0}")]
    Storage(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Malformed(_) => (StatusCode::BAD_REQUEST, "Malformed"),
            Self::MalformedEnvelope => (StatusCode::BAD_REQUEST, "MalformedEnvelope"),
            Self::TooManyOneTimePrekeys => (StatusCode::BAD_REQUEST, "TooManyOneTimePrekeys"),
            Self::UnknownUser(_) => (StatusCode::NOT_FOUND, "UnknownUser"),
            Self::UnknownRecipient(_) => (StatusCode::NOT_FOUND, "UnknownRecipient"),
            Self::UnknownMessage(_) => (StatusCode::NOT_FOUND, "UnknownMessage"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RateLimited"),
            Self::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "StorageError"),
        };
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
