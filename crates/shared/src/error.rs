use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    #[serde(other)]
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 409 | 422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the messaging service and carried by realtime
/// `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an error from a non-success HTTP response body. Bodies that are
    /// not an `ApiError` document keep the raw text as the message.
    pub fn from_response_body(status: u16, body: &str) -> Self {
        if let Ok(parsed) = serde_json::from_str::<ApiError>(body) {
            return parsed;
        }

        #[derive(Deserialize)]
        struct MessageOnly {
            message: String,
        }

        let message = serde_json::from_str::<MessageOnly>(body)
            .map(|m| m.message)
            .unwrap_or_else(|_| body.trim().to_string());
        Self::new(ErrorCode::from_status(status), message)
    }
}
