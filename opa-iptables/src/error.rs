//! Error types.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Standard error payload returned by the policy engine on non-2xx responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

impl std::error::Error for EngineError {}

/// Errors talking to the policy engine.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Network failure or timeout.
    #[error("policy engine request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Structured error answer from the policy engine.
    #[error("policy engine error: {0}")]
    Engine(EngineError),

    /// Non-2xx answer whose body was not an engine error payload.
    #[error("policy engine returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The answer could not be decoded into a rule set.
    #[error("invalid policy document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid document path: {0:?}")]
    InvalidPath(String),
}

/// Errors applying or listing rules in the host's rule table.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },

    #[error("{command} did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to parse rule listing: {0}")]
    Parse(String),
}

/// Which side of a batch an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => f.write_str("inserting"),
            Operation::Delete => f.write_str("deleting"),
        }
    }
}

/// Aggregate error: at least one rule of a batch failed.
///
/// Carries counts only. Per-rule detail is in [`crate::batch::BatchResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("error during {operation} rules ({failed} of {total} failed)")]
pub struct BatchError {
    pub operation: Operation,
    pub failed: usize,
    pub total: usize,
}

/// Invalid runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("watcher interval must be greater than zero")]
    ZeroInterval,

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("invalid policy engine endpoint {endpoint:?}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("watch targets {0:?} given but the watcher is disabled")]
    WatchWithoutWatcher(Vec<String>),
}

/// Errors talking to a running watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watcher is not running")]
    Stopped,
}
