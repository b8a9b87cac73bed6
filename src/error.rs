use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Why a string failed to parse into one of the core types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    UrnInvalid,
    UuidInvalid,
    ModelInvalid,
    CertInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoErrorKind {
    PinIncorrect,
    DeviceError,
    GeneralError,
    ArgumentsBad,
    SignatureInvalid,
    /// The HSM is running in deterministic fallback mode. Advisory:
    /// production verifiers refuse such signatures.
    FallbackInUse,
    Other(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsErrorKind {
    HandshakeFailed,
    PeerUntrusted,
    Hostname,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Connect,
    Read,
    Write,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayErrorKind {
    NonceSeen,
    TimestampOutOfWindow,
    SignatureInvalid,
    ShardMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingErrorKind {
    LocalHandlerMissing,
    ScatterTimeout,
    PartialFailure,
}

#[derive(Debug)]
pub enum AppError {
    Parse(ParseErrorKind, String),
    /// The hash ring holds no shards. Signalling, not fatal.
    RingEmpty,
    /// A shard id resolved by the ring has no topology entry.
    TopologyMiss(String),
    Crypto(CryptoErrorKind, String),
    Tls(TlsErrorKind, String),
    Network(NetworkErrorKind, String),
    Replay(ReplayErrorKind, String),
    Routing(RoutingErrorKind, String),
    NotFound(String),
    BadRequest(String),
    Internal(String),
    ConfigurationError(String),
    Io(anyhow::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Parse(kind, msg) => write!(f, "Parse error ({:?}): {}", kind, msg),
            AppError::RingEmpty => write!(f, "Hash ring is empty: no shards available"),
            AppError::TopologyMiss(shard_id) => {
                write!(f, "Shard {} not present in topology", shard_id)
            }
            AppError::Crypto(kind, msg) => write!(f, "Crypto error ({:?}): {}", kind, msg),
            AppError::Tls(kind, msg) => write!(f, "TLS error ({:?}): {}", kind, msg),
            AppError::Network(kind, msg) => write!(f, "Network error ({:?}): {}", kind, msg),
            AppError::Replay(kind, msg) => write!(f, "Replay check failed ({:?}): {}", kind, msg),
            AppError::Routing(kind, msg) => write!(f, "Routing error ({:?}): {}", kind, msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Network-class errors are the only ones the mTLS layer retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Network(_, _))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Parse(_, msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::RingEmpty => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No shards available".to_string(),
            ),
            AppError::TopologyMiss(shard_id) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Shard {} not available", shard_id),
            ),
            AppError::Crypto(_, msg) => {
                tracing::error!("Crypto error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Tls(_, msg) => {
                tracing::error!("TLS error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::Network(_, msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Replay(_, msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Routing(RoutingErrorKind::ScatterTimeout, msg) => {
                (StatusCode::GATEWAY_TIMEOUT, msg.clone())
            }
            AppError::Routing(_, msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::ConfigurationError(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Io(err) => {
                tracing::error!("I/O error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status_code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => NetworkErrorKind::Connect,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                NetworkErrorKind::Timeout
            }
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::WriteZero => {
                NetworkErrorKind::Write
            }
            _ => NetworkErrorKind::Read,
        };
        AppError::Network(kind, err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
