use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Webhook handler already registered for {plugin}/{path}")]
    DuplicateWebhook { plugin: String, path: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn plugin(plugin: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Plugin {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::Config(format!("invalid url: {}", err))
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            SyncError::NodeNotFound(msg) | SyncError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, msg.clone())
            }
            SyncError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            SyncError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            SyncError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg.clone()),
            SyncError::DuplicateWebhook { .. } | SyncError::Conflict(_) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            // Default to 500
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
            "code": status.as_u16(),
            "type": format!("{:?}", self)
                .split(|c: char| c == '(' || c == ' ' || c == '{')
                .next()
                .unwrap_or("Error")
        });

        (status, Json(body)).into_response()
    }
}
