//! Error taxonomy for the proxy, rendered as OpenAI-style error envelopes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid request parameters: {0}")]
    InvalidRequest(String),

    #[error("Model {0} not supported")]
    UnknownModel(String),

    #[error("Max tokens {requested} exceeds limit {limit}")]
    MaxTokensExceeded { requested: i64, limit: u32 },

    #[error("Invalid or missing authorization")]
    Unauthorized,

    #[error("No valid cookies available")]
    NoCredentials,

    #[error("All cookies are temporarily unavailable.")]
    CredentialsExhausted { attempts: usize },

    #[error("Detected that you are using Chinese for conversation, please use English for conversation.")]
    UnsupportedLanguage,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Client disconnected")]
    ClientDisconnected,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownModel(_) | Self::MaxTokensExceeded { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI `error.type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) | Self::MaxTokensExceeded { .. } => "invalid_request_error",
            Self::InvalidRequest(_) => "request_error",
            Self::Unauthorized => "authentication_error",
            Self::NoCredentials | Self::CredentialsExhausted { .. } => "upstream_unavailable",
            _ => "upstream_error",
        }
    }

    /// OpenAI `error.code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "500",
            Self::UnknownModel(_) => "invalid_model",
            Self::MaxTokensExceeded { .. } => "invalid_max_tokens",
            Self::Unauthorized => "invalid_api_key",
            Self::NoCredentials => "no_credentials",
            Self::CredentialsExhausted { .. } => "credentials_exhausted",
            Self::UnsupportedLanguage => "unsupported_language",
            Self::Upstream(_) => "upstream_error",
            Self::Transport(_) => "transport_error",
            Self::Serialization(_) => "serialization_error",
            Self::ClientDisconnected => "client_disconnected",
        }
    }

    pub fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorBody {
                message: self.to_string(),
                r#type: self.kind().to_string(),
                code: Some(self.code().to_string()),
            },
        }
    }
}

/// Error envelope matching OpenAI's format.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
