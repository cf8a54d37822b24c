use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Result type for benchmark operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop a benchmark run or a pipeline stage.
///
/// Per-request failures are not errors in this sense: they are captured as a
/// [`RequestError`] on the request's record and counted by the metrics.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid or contradictory configuration, detected before any traffic is sent
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A derived metric could not be evaluated
    #[error("Aggregation error: {message}")]
    Aggregation { message: String },

    /// A schedule or trace file could not be interpreted
    #[error("Schedule error at line {line}: {message}")]
    Schedule { line: usize, message: String },

    /// The dataset could not produce a turn for a credit
    #[error("Dataset error: {message}")]
    Dataset { message: String },

    /// A pipeline channel closed while the run still needed it
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn aggregation(message: impl Into<String>) -> Self {
        Self::Aggregation {
            message: message.into(),
        }
    }
}

/// How a single request ended when it did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestErrorKind {
    /// Connection could not be established or broke mid-exchange
    Transport,
    /// The endpoint answered with a non-success status
    Http,
    /// The request exceeded its timeout, or was still running when the grace period expired
    Timeout,
    /// The request was deliberately cancelled by the cancellation strategy
    Cancelled,
    /// The response could not be parsed
    Protocol,
    /// No prompt could be built for the credit
    Dataset,
}

impl std::fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transport => "TransportError",
            Self::Http => "HTTPError",
            Self::Timeout => "TimeoutError",
            Self::Cancelled => "RequestCancellationError",
            Self::Protocol => "ProtocolError",
            Self::Dataset => "DatasetError",
        };
        f.write_str(name)
    }
}

/// Error details attached to a failed request record.
#[derive(ThisError, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RequestError {
    /// HTTP status code, when the endpoint answered
    pub code: Option<u16>,
    pub kind: RequestErrorKind,
    pub message: String,
}

impl RequestError {
    pub fn new(kind: RequestErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: None,
            kind,
            message: message.into(),
        }
    }

    pub fn http(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            kind: RequestErrorKind::Http,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RequestErrorKind::Timeout, message)
    }

    /// Cancellations carry the 499 client-closed-request code.
    pub fn cancelled(delay: std::time::Duration) -> Self {
        Self {
            code: Some(499),
            kind: RequestErrorKind::Cancelled,
            message: format!(
                "Request was cancelled after {}",
                humantime::format_duration(delay)
            ),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == RequestErrorKind::Cancelled
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::timeout(e.to_string());
        }
        let kind = if e.is_decode() {
            RequestErrorKind::Protocol
        } else {
            RequestErrorKind::Transport
        };
        Self {
            code: e.status().map(|s| s.as_u16()),
            kind,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancellation_error_shape() {
        let err = RequestError::cancelled(Duration::from_millis(1500));
        assert_eq!(err.code, Some(499));
        assert!(err.is_cancellation());
        assert_eq!(
            err.to_string(),
            "RequestCancellationError: Request was cancelled after 1s 500ms"
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let err = RequestError::http(503, "overloaded");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "http");
        assert_eq!(json["code"], 503);
    }
}
