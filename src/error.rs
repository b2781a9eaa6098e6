//! Error types and failure classification.
//!
//! Every failure raised by a transport passes through [`ClassifiedError::classify`]
//! exactly once per attempt. Classification extracts a status code from
//! either the transport-level failure or a nested API error body, derives a
//! category and a retryability flag, and keeps the original cause attached.
//! Retryability is a pure function of the code — never of how many attempts
//! have been made.

use std::fmt;

use thiserror::Error;

use crate::api::Method;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, SheetsError>;

/// Result of a raw transport call, before classification.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Structured error body returned by the remote API, carrying its own
/// status code nested under the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub message: String,
}

/// Low-level connection failure kinds considered transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Reset,
    TimedOut,
    DnsNotFound,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionKind::Reset => "connection reset",
            ConnectionKind::TimedOut => "connection timed out",
            ConnectionKind::DnsNotFound => "dns lookup failed",
        };
        f.write_str(s)
    }
}

/// A raw failure surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP-level failure with a direct status code.
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },

    /// API error body with the status nested in the response.
    #[error("api error {}: {}", response.code, response.message)]
    Api { response: ErrorResponse },

    /// Socket-level failure before any status was received.
    #[error("{kind}: {message}")]
    Connection {
        kind: ConnectionKind,
        message: String,
    },

    /// Anything else the transport could not attribute.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        TransportError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn connection(kind: ConnectionKind, message: impl Into<String>) -> Self {
        TransportError::Connection {
            kind,
            message: message.into(),
        }
    }
}

/// Normalized error code extracted from a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Status(u16),
    Connection(ConnectionKind),
    Unknown,
}

impl ErrorCode {
    pub fn of(error: &TransportError) -> Self {
        match error {
            TransportError::Status { code, .. } => ErrorCode::Status(*code),
            TransportError::Api { response } => ErrorCode::Status(response.code),
            TransportError::Connection { kind, .. } => ErrorCode::Connection(*kind),
            TransportError::Other(_) => ErrorCode::Unknown,
        }
    }

    /// Retryable set: 429 and the 5xx transient statuses, plus every
    /// connection-level failure kind.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorCode::Status(code) => matches!(code, 429 | 500 | 502 | 503 | 504),
            ErrorCode::Connection(_) => true,
            ErrorCode::Unknown => false,
        }
    }

    /// Category priority: 429 → RateLimit, 403 → Permission, 404 →
    /// NotFound, any other retryable code → Transient, else Unknown.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::Status(429) => ErrorCategory::RateLimit,
            ErrorCode::Status(403) => ErrorCategory::Permission,
            ErrorCode::Status(404) => ErrorCategory::NotFound,
            code if code.is_retryable() => ErrorCategory::Transient,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Status(code) => write!(f, "{code}"),
            ErrorCode::Connection(kind) => write!(f, "{kind}"),
            ErrorCode::Unknown => f.write_str("unknown"),
        }
    }
}

/// Failure taxonomy used for programmatic branching. Callers branch on
/// this (or on `retryable`), never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    RateLimit,
    Permission,
    NotFound,
    Transient,
    Unknown,
}

impl ErrorCategory {
    /// Fixed, user-facing sentence per category. Not localized and not
    /// configurable.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => {
                "Rate limit exceeded. Please slow down and try again shortly."
            }
            ErrorCategory::Permission => {
                "You do not have permission to access this spreadsheet."
            }
            ErrorCategory::NotFound => {
                "The requested spreadsheet or range could not be found."
            }
            ErrorCategory::Transient => {
                "A temporary service error occurred. The request may be retried."
            }
            ErrorCategory::Unknown => {
                "An unexpected error occurred while talking to the spreadsheet service."
            }
        }
    }
}

/// A transport failure after classification. Immutable once built; the
/// retry engine constructs a fresh one per failed attempt and surfaces the
/// last one when it gives up.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub message: String,
    #[source]
    pub cause: TransportError,
}

impl ClassifiedError {
    pub fn classify(cause: TransportError) -> Self {
        let code = ErrorCode::of(&cause);
        Self {
            code,
            category: code.category(),
            retryable: code.is_retryable(),
            message: cause.to_string(),
            cause,
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.category.user_message()
    }
}

/// Boundary error type. Remote failures always arrive as `Api` once they
/// have passed the retry engine; `Transport` only exists between the
/// transport seam and that engine. The remaining variants are raised
/// synchronously by this layer for its own precondition violations and are
/// never retried.
#[derive(Debug, Error)]
pub enum SheetsError {
    #[error(transparent)]
    Api(#[from] ClassifiedError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid range notation: {0}")]
    InvalidRange(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The inner service answered with a response shape that does not
    /// match the request that was issued.
    #[error("unexpected {got} response to {method}")]
    UnexpectedResponse { method: Method, got: &'static str },
}

impl SheetsError {
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            SheetsError::Api(c) => Some(c),
            _ => None,
        }
    }

    /// Normalized code for metrics bucketing.
    pub fn code(&self) -> ErrorCode {
        match self {
            SheetsError::Api(c) => c.code,
            SheetsError::Transport(t) => ErrorCode::of(t),
            _ => ErrorCode::Unknown,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        match self {
            SheetsError::Api(c) => c.category == ErrorCategory::RateLimit,
            SheetsError::Transport(t) => ErrorCode::of(t) == ErrorCode::Status(429),
            _ => false,
        }
    }

    /// Whether the underlying failure carries a retryable code. Pure in
    /// the code: attempt counts and layer position play no part.
    pub fn is_transient(&self) -> bool {
        match self {
            SheetsError::Api(c) => c.retryable,
            SheetsError::Transport(t) => ErrorCode::of(t).is_retryable(),
            _ => false,
        }
    }
}
