use thiserror::Error;

use crate::backend::BackendKind;

#[derive(Debug, Error)]
pub enum QuillError {
    /// Non-success HTTP status, or a transport failure the adapter classified itself.
    #[error("network error from {backend}: {message}")]
    Network {
        backend: BackendKind,
        message: String,
        status: Option<u16>,
    },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Malformed JSON in a `data:` field, or a record that doesn't match the backend's shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A generation is already in flight on this coordinator.
    #[error("a generation is already in progress")]
    Busy,

    #[error("config error: {0}")]
    Config(String),

    /// Only returned by calls that resolve to a single value (tokenize).
    /// Streams end silently on cancellation instead.
    #[error("cancelled")]
    Cancelled,
}

impl QuillError {
    pub(crate) fn status(backend: BackendKind, status: reqwest::StatusCode, body: &str) -> Self {
        Self::Network {
            backend,
            message: if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {}", body.trim())
            },
            status: Some(status.as_u16()),
        }
    }

    /// Transport-level failures and non-success statuses.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Request(_) | Self::WebSocket(_)
        )
    }

    /// Returns true for transient errors a caller may choose to retry.
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            // No status means the failure did not come from HTTP; treat as not retryable.
            Self::Network { status, .. } => status.is_some_and(|s| s >= 500),
            Self::Request(_) | Self::WebSocket(_) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Message safe to show in the host's error channel.
    /// Leaves out upstream bodies and connection details.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network {
                backend,
                status: Some(status),
                ..
            } => format!("{backend} returned HTTP {status}"),
            Self::Network { backend, .. } => format!("could not reach {backend} server"),
            Self::Request(_) => "request to inference server failed".to_string(),
            Self::WebSocket(_) => "websocket connection failed".to_string(),
            Self::Protocol(_) => "failed to parse server response".to_string(),
            Self::InvalidEndpoint(endpoint) => format!("invalid endpoint: {endpoint}"),
            Self::Busy => "cancel the current generation before starting another".to_string(),
            Self::Config(msg) => format!("config error: {msg}"),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}
