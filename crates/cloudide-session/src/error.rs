use std::path::PathBuf;

use thiserror::Error;

/// Failures of a single websocket connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotReady,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of a correlated request/response exchange.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("workspace connection is not open")]
    NotReady,
    #[error("timeout waiting for {request_type} reply after {timeout_ms}ms")]
    Timeout {
        request_type: &'static str,
        timeout_ms: u64,
    },
    #[error("connection lost before a reply arrived")]
    ConnectionLost,
    #[error("backend rejected request: {message}")]
    Rejected { message: String },
    #[error("unexpected reply payload: {message}")]
    UnexpectedPayload { message: String },
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl RequestError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotReady | Self::Timeout { .. } | Self::ConnectionLost | Self::Transport(_)
        )
    }
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotReady => Self::NotReady,
            TransportError::ConnectionLost { .. } => Self::ConnectionLost,
            other => Self::Transport(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {field}: {value} (expected a ws:// or wss:// url)")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}
