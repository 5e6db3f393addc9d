use std::time::Duration;

use strum::{AsRefStr, Display};

/// Metric-label category every RPC-side error maps to. Exactly one per error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Connection,
    Rpc,
    Value,
    Unknown,
}

/// Sub-categorisation of a well-formed JSON-RPC error response, decided by
/// code (and message shape) at the client boundary so callers can branch on
/// the tag instead of string-matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcIssue {
    /// Provider-side throttling; transient.
    RateLimit,
    /// The requested log range exceeds the provider's span or payload cap;
    /// transient, and the chunker reacts to it by halving.
    RangeTooWide,
    /// Method not supported by this endpoint; permanent.
    MethodNotFound,
    /// Request was malformed from the provider's point of view; permanent.
    InvalidParams,
    /// Any other code. Treated as transient unless flagged otherwise.
    Other { transient: bool },
}

impl RpcIssue {
    pub fn is_transient(self) -> bool {
        match self {
            RpcIssue::RateLimit | RpcIssue::RangeTooWide => true,
            RpcIssue::MethodNotFound | RpcIssue::InvalidParams => false,
            RpcIssue::Other { transient } => transient,
        }
    }
}

/// Tagged error value surfaced by every RPC client operation.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request exceeded the {0:?} budget")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        issue: RpcIssue,
    },

    /// Decoding/ABI/format failure, e.g. a `balanceOf` call against a
    /// contract that is not a token. Permanent; logged once then suppressed.
    #[error("value error: {0}")]
    Value(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl RpcError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RpcError::Timeout(_) => ErrorCategory::Timeout,
            RpcError::Connection(_) => ErrorCategory::Connection,
            RpcError::Rpc { .. } => ErrorCategory::Rpc,
            RpcError::Value(_) => ErrorCategory::Value,
            RpcError::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Timeout(_) | RpcError::Connection(_) | RpcError::Unknown(_) => true,
            RpcError::Rpc { issue, .. } => issue.is_transient(),
            RpcError::Value(_) => false,
        }
    }

    /// Whether this is the provider telling us the log query span is too
    /// large. Drives the chunker's halving.
    pub fn is_range_too_wide(&self) -> bool {
        matches!(
            self,
            RpcError::Rpc {
                issue: RpcIssue::RangeTooWide,
                ..
            }
        )
    }
}
