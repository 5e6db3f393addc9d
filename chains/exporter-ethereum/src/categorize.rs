//! Maps transport-level errors onto the exporter's taxonomy at the client
//! boundary. All string inspection lives here; everything above branches on
//! the resulting tags.

use ethers::providers::{JsonRpcError, ProviderError, RpcError as EthersRpcError};

use exporter_core::{RpcError, RpcIssue};

/// Message fragments providers use when a log query exceeds their span or
/// payload caps. Codes are not standardised for this case, so the message is
/// part of the signal.
const RANGE_TOO_WIDE_MARKERS: &[&str] = &[
    "block range",
    "log response size",
    "query returned more than",
    "too many results",
    "range is too large",
    "max results",
    "response size exceeded",
    "query timeout exceeded",
];

const CONNECTION_MARKERS: &[&str] = &[
    "error sending request",
    "connection",
    "connect",
    "dns",
    "refused",
    "reset",
    "broken pipe",
    "tls",
    "certificate",
];

/// Categorise a well-formed JSON-RPC error response.
pub fn categorize_jsonrpc(err: &JsonRpcError) -> RpcError {
    let message = err.message.to_ascii_lowercase();

    // Execution reverts surface as value errors: retrying a revert is
    // pointless and the collector wants to suppress them after one log.
    if err.code == 3 || message.contains("execution reverted") || message.contains("revert") {
        return RpcError::Value(err.message.clone());
    }

    if RANGE_TOO_WIDE_MARKERS.iter().any(|m| message.contains(m)) {
        return rpc_error(err, RpcIssue::RangeTooWide);
    }

    let issue = match err.code {
        -32601 => RpcIssue::MethodNotFound,
        -32602 => RpcIssue::InvalidParams,
        -32005 | -32029 | 429 => RpcIssue::RateLimit,
        _ if message.contains("rate limit") || message.contains("too many requests") => {
            RpcIssue::RateLimit
        }
        _ => RpcIssue::Other { transient: true },
    };
    rpc_error(err, issue)
}

/// Categorise an ethers provider error from a completed (non-timed-out)
/// request.
pub fn categorize_provider_error(err: ProviderError) -> RpcError {
    if let Some(jsonrpc) = err.as_error_response() {
        return categorize_jsonrpc(jsonrpc);
    }
    match err {
        ProviderError::JsonRpcClientError(inner) => {
            if inner.as_serde_error().is_some() {
                return RpcError::Value(inner.to_string());
            }
            let message = inner.to_string();
            if looks_like_connection_error(&message) {
                RpcError::Connection(message)
            } else {
                RpcError::Unknown(message)
            }
        }
        ProviderError::SerdeJson(e) => RpcError::Value(e.to_string()),
        ProviderError::HexError(e) => RpcError::Value(e.to_string()),
        ProviderError::HTTPError(e) => RpcError::Connection(e.to_string()),
        other => RpcError::Unknown(other.to_string()),
    }
}

fn looks_like_connection_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    CONNECTION_MARKERS.iter().any(|m| message.contains(m))
}

fn rpc_error(err: &JsonRpcError, issue: RpcIssue) -> RpcError {
    RpcError::Rpc {
        code: err.code,
        message: err.message.clone(),
        issue,
    }
}
