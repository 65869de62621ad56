//! Error types for wallet synchronization
//!
//! Adapter failures are recoverable and travel as events; selection shortfalls
//! are plain values on `UtxoSelection`. Only queue underflow is fatal, and that
//! one panics instead of producing an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Chain;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Invalid address for {chain}: {reason}")]
    InvalidAddress { chain: Chain, reason: String },

    #[error("Invalid worker message: {0}")]
    InvalidMessage(String),

    #[error("Message for {received} delivered to {expected} worker")]
    ChainMismatch { expected: Chain, received: Chain },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("No usable provider: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Invalid selection request: {0}")]
    Selection(#[from] SelectionError),

    #[error("Worker closed: {0}")]
    WorkerClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure reported by a chain client adapter.
///
/// Cloneable so one failure can be both logged and forwarded to the host.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum AdapterError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AdapterError::Decode(e.to_string())
        } else {
            AdapterError::Network(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Requests rejected before any UTXO is looked at.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Amount must be greater than zero")]
    ZeroAmount,
}

/// One probe group that did not fully succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFailure {
    pub group: String,
    pub errors: Vec<String>,
}

/// Every probe group failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("All {} probe group(s) failed: {}", .failures.len(), describe_failures(.failures))]
pub struct ResolveError {
    pub failures: Vec<GroupFailure>,
}

impl ResolveError {
    /// First recorded error of the first group, usually the most actionable one.
    pub fn first_error(&self) -> Option<&str> {
        self.failures
            .iter()
            .flat_map(|f| f.errors.iter())
            .map(String::as_str)
            .next()
    }
}

fn describe_failures(failures: &[GroupFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}: {}]", f.group, f.errors.join("; ")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_lists_every_group() {
        let err = ResolveError {
            failures: vec![
                GroupFailure {
                    group: "primary".to_string(),
                    errors: vec!["timeout".to_string()],
                },
                GroupFailure {
                    group: "fallback".to_string(),
                    errors: vec!["HTTP 503: busy".to_string(), "refused".to_string()],
                },
            ],
        };

        let text = err.to_string();
        assert!(text.starts_with("All 2 probe group(s) failed"));
        assert!(text.contains("[primary: timeout]"));
        assert!(text.contains("[fallback: HTTP 503: busy; refused]"));
        assert_eq!(err.first_error(), Some("timeout"));
    }
}
