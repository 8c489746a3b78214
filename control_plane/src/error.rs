//! Control-plane error types.
//!
//! Every background task and bus handler logs these instead of propagating
//! them; the types exist so each step can report precisely what failed.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading, merging or writing gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration path configured")]
    NoPath,

    #[error("Failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration payload must be a JSON object")]
    NotAnObject,
}

/// Errors raised by a message bus when publishing.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("No subscribers listening for {0}")]
    NoSubscribers(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Errors returned by a rate-limit aggregator when a peer report is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("Rate limiter is not ready")]
    NotReady,

    #[error("Segment mismatch: report tagged {got:?}, local segment is {expected:?}")]
    SegmentMismatch { expected: String, got: String },

    #[error("Inconsistent load report: {0}")]
    Inconsistent(String),
}

/// Errors returned by the remote-call client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC client is not connected")]
    NotConnected,

    #[error("RPC function not found: {0}")]
    FunctionNotFound(String),

    #[error("RPC call {method} failed: {message}")]
    Call { method: String, message: String },
}

impl RpcError {
    pub fn call(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Call {
            method: method.into(),
            message: message.into(),
        }
    }
}
