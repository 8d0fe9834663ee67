//! Typed domain error enums.
//!
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use hive_common::{InvalidAgentId, Mode};
use thiserror::Error;

// ── Protocol errors ───────────────────────────────────────────────────────────

/// A message that breaks the line grammar or is addressed to someone else.
///
/// Protocol errors are never fatal: the offending message is discarded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("message has no command token: {0:?}")]
    MissingCommand(String),

    #[error("message addressed to '{received}', this agent is '{expected}'")]
    IdentityMismatch { expected: String, received: String },

    #[error("invalid configuration payload: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    InvalidAgentId(#[from] InvalidAgentId),
}

// ── Key material errors ───────────────────────────────────────────────────────

/// Problems with provisioned key files.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file {path} is not valid base64")]
    Encoding { path: String },

    #[error("key file {path} holds {len} bytes, expected {expected}")]
    Length {
        path: String,
        len: usize,
        expected: usize,
    },
}

// ── Escalation causes ─────────────────────────────────────────────────────────

/// Conditions that terminate the agent with a failure status.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("workload '{mode}' failed: {reason}")]
    WorkloadFault { mode: Mode, reason: String },

    #[error("workload '{mode}' panicked")]
    WorkloadPanicked { mode: Mode },

    #[error("{0} task panicked")]
    TaskPanicked(&'static str),
}
