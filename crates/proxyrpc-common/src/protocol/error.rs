//! ProxyRPC Error Taxonomy
//!
//! Every failure surfaced by the client runtime is an [`RpcError`]. Variants map onto a
//! small set of classes ([`ErrorKind`]) that drive the retry, bouncing and propagation
//! policy of the interceptor chain:
//!
//! | Kind           | Variants                                           | Policy                         |
//! |----------------|----------------------------------------------------|--------------------------------|
//! | `Discovery`    | `Discovery`                                        | surfaced                       |
//! | `Connectivity` | `Dial`, `Transport`                                | retried, `Dial` bounces        |
//! | `Protocol`     | `Protocol`                                         | surfaced immediately           |
//! | `Server`       | `Server`                                           | per-code retryable / permanent |
//! | `Timeout`      | `Timeout`, `Cancelled`, `RetriesExhausted`         | surfaced                       |
//! | `Transaction`  | `Transaction`                                      | surfaced                       |
//!
//! `RpcError` is `Clone` so that a single dial or discovery outcome can be handed to every
//! caller waiting on it. Foreign errors are converted into string-carrying variants.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes reported by the backend in a structured failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The proxy refuses to serve this client (banned, draining, wrong role).
    WrongProxy,
    /// The backend is temporarily unavailable.
    Unavailable,
    /// Explicit "try again" response.
    RetryLater,
    /// The proxy request queue overflowed before the request was accepted.
    RequestQueueFull,
    /// The backend gave up on the request before applying it.
    ServerTimeout,
    NoSuchTransaction,
    AuthorizationError,
    InvalidRequest,
    SchemaMismatch,
    NoSuchMethod,
    Internal,
}

impl ErrorCode {
    /// Default retryability of the code, used when the server does not classify the
    /// failure itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::RetryLater
                | ErrorCode::RequestQueueFull
                | ErrorCode::ServerTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::WrongProxy => "wrong_proxy",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::RetryLater => "retry_later",
            ErrorCode::RequestQueueFull => "request_queue_full",
            ErrorCode::ServerTimeout => "server_timeout",
            ErrorCode::NoSuchTransaction => "no_such_transaction",
            ErrorCode::AuthorizationError => "authorization_error",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::SchemaMismatch => "schema_mismatch",
            ErrorCode::NoSuchMethod => "no_such_method",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure returned by the backend.
///
/// The server may override the default retryability of `code` through `retryable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("server error {code}: {message}")]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: None,
        }
    }

    /// Overrides the retryability the code implies.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or_else(|| self.code.is_retryable())
    }
}

/// Phase of an ambient transaction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Start,
    Commit,
    Abort,
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStage::Start => f.write_str("start"),
            TxStage::Commit => f.write_str("commit"),
            TxStage::Abort => f.write_str("abort"),
        }
    }
}

/// Coarse classification of an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Discovery,
    Connectivity,
    Protocol,
    Server,
    Timeout,
    Transaction,
    /// Local misuse: closed pool, malformed arguments.
    Client,
}

#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("proxy discovery failed: {0}")]
    Discovery(String),

    /// The connection could not be established; the request never left the client.
    #[error("failed to connect to {address}: {message}")]
    Dial { address: String, message: String },

    /// Sending the request or receiving the response failed. The backend may or may not
    /// have applied the request.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Server(#[from] ServerError),

    /// The caller's deadline expired.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("call cancelled")]
    Cancelled,

    /// The call's backoff budget ran out while the last attempt was still failing.
    #[error("retry budget exhausted after {attempts} attempts ({elapsed_ms}ms): {source}")]
    RetriesExhausted {
        attempts: u32,
        elapsed_ms: u64,
        source: Box<RpcError>,
    },

    #[error("failed to {stage} ambient transaction: {source}")]
    Transaction {
        stage: TxStage,
        source: Box<RpcError>,
    },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Context attached to every error leaving the interceptor chain.
    #[error("{method} via {address} (attempt {attempt}): {source}")]
    Call {
        method: String,
        address: String,
        attempt: u32,
        source: Box<RpcError>,
    },
}

impl RpcError {
    /// Strips the [`RpcError::Call`] context wrapper.
    pub fn root(&self) -> &RpcError {
        match self {
            RpcError::Call { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            RpcError::Discovery(_) => ErrorKind::Discovery,
            RpcError::Dial { .. } | RpcError::Transport(_) => ErrorKind::Connectivity,
            RpcError::Protocol(_) => ErrorKind::Protocol,
            RpcError::Server(_) => ErrorKind::Server,
            RpcError::Timeout(_) | RpcError::Cancelled | RpcError::RetriesExhausted { .. } => {
                ErrorKind::Timeout
            }
            RpcError::Transaction { .. } => ErrorKind::Transaction,
            RpcError::PoolClosed | RpcError::InvalidRequest(_) => ErrorKind::Client,
            RpcError::Call { source, .. } => source.kind(),
        }
    }

    pub fn server_error(&self) -> Option<&ServerError> {
        match self.root() {
            RpcError::Server(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_server_code(&self, code: ErrorCode) -> bool {
        self.server_error().is_some_and(|e| e.code == code)
    }

    /// Errors that may be retried with backoff.
    ///
    /// Connectivity failures (dial or send) and server errors classified as retryable.
    /// `WrongProxy` is excluded: the same proxy will keep refusing the call.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            RpcError::Dial { .. } | RpcError::Transport(_) => true,
            RpcError::Server(err) => err.code != ErrorCode::WrongProxy && err.is_retryable(),
            _ => false,
        }
    }

    /// Errors after which re-sending a mutation that carries a mutation id cannot apply it
    /// twice: the request never reached the backend, the backend rejected it before
    /// applying, or the response was lost and the backend deduplicates the retry by its
    /// mutation id.
    pub fn is_safe_to_retry_mutation(&self) -> bool {
        self.is_retryable()
    }

    /// Whether the request never left the client.
    pub fn is_dial(&self) -> bool {
        matches!(self.root(), RpcError::Dial { .. })
    }

    /// Errors that mean the selected proxy cannot serve the call at all.
    pub fn should_bounce(&self) -> bool {
        match self.root() {
            RpcError::Dial { .. } => true,
            RpcError::Server(err) => err.code == ErrorCode::WrongProxy,
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), RpcError::Cancelled | RpcError::Timeout(_))
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped(source: RpcError) -> RpcError {
        RpcError::Call {
            method: "GetNode".to_string(),
            address: "proxy-1:9013".to_string(),
            attempt: 2,
            source: Box::new(source),
        }
    }

    #[test]
    fn test_default_code_retryability() {
        assert!(ErrorCode::Unavailable.is_retryable());
        assert!(ErrorCode::RetryLater.is_retryable());
        assert!(!ErrorCode::AuthorizationError.is_retryable());
        assert!(!ErrorCode::SchemaMismatch.is_retryable());
        assert!(!ErrorCode::WrongProxy.is_retryable());
    }

    #[test]
    fn test_server_override_wins() {
        let err = ServerError::new(ErrorCode::Internal, "flaky").with_retryable(true);
        assert!(err.is_retryable());

        let err = ServerError::new(ErrorCode::Unavailable, "gone").with_retryable(false);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classification_looks_through_call_wrapper() {
        let err = wrapped(RpcError::Transport("reset".into()));
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.is_retryable());
        assert!(!err.should_bounce());

        let err = wrapped(RpcError::Server(ServerError::new(ErrorCode::WrongProxy, "banned")));
        assert!(err.should_bounce());
        assert!(!err.is_retryable());
        assert!(err.is_server_code(ErrorCode::WrongProxy));
    }

    #[test]
    fn test_dial_failure_bounces_and_is_retryable() {
        let err = wrapped(RpcError::Dial {
            address: "a:1".into(),
            message: "connection refused".into(),
        });
        assert!(err.should_bounce());
        assert!(err.is_retryable());
        assert!(err.is_safe_to_retry_mutation());
        assert!(err.is_dial());
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(!RpcError::Transport("reset".into()).is_dial());
    }

    #[test]
    fn test_permanent_errors() {
        for err in [
            RpcError::Protocol("bad frame".into()),
            RpcError::Server(ServerError::new(ErrorCode::AuthorizationError, "denied")),
            RpcError::Server(ServerError::new(ErrorCode::SchemaMismatch, "column x")),
            RpcError::Cancelled,
            RpcError::PoolClosed,
        ] {
            assert!(!err.is_retryable(), "{err} must not be retryable");
            assert!(!err.is_safe_to_retry_mutation());
        }
    }

    #[test]
    fn test_timeout_class() {
        let err = RpcError::RetriesExhausted {
            attempts: 4,
            elapsed_ms: 1200,
            source: Box::new(RpcError::Transport("reset".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_retryable());
        assert_eq!(RpcError::Cancelled.kind(), ErrorKind::Timeout);
        assert!(RpcError::Timeout(10).is_cancellation());
    }

    #[test]
    fn test_display_carries_context() {
        let err = wrapped(RpcError::Server(ServerError::new(
            ErrorCode::NoSuchTransaction,
            "tx 1 not found",
        )));
        let text = err.to_string();
        assert!(text.contains("GetNode"));
        assert!(text.contains("proxy-1:9013"));
        assert!(text.contains("attempt 2"));
        assert!(text.contains("no_such_transaction"));
    }

    #[test]
    fn test_server_error_json_shape() {
        let err: ServerError =
            serde_json::from_str(r#"{"code":"retry_later","message":"busy"}"#).unwrap();
        assert_eq!(err.code, ErrorCode::RetryLater);
        assert!(err.retryable.is_none());
        assert!(err.is_retryable());
    }
}
