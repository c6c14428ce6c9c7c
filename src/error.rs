//! Error taxonomy (spec.md §7) and the JSON envelope every tool returns on
//! failure.
//!
//! The Python prototype this was distilled from inlines `{"success":
//! False, "error": ...}` dicts ad hoc in every tool function. This module
//! is the one place that shape is defined, so every tool in
//! [`crate::server`] produces the same envelope.

use serde::Serialize;
use thiserror::Error;

/// A tool-call-level failure, tagged with the error kind string (spec.md
/// §7) an agent can branch on.
#[derive(Debug, Error, Clone)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),
    #[error("no binary loaded. Use set_file first")]
    NoBinary,
    #[error("cannot perform this operation while inferior is '{0}'")]
    BadState(String),
    #[error("unknown step alias '{0}'")]
    UnknownStep(String),
    #[error("command timed out")]
    Timeout,
    #[error("controller is dead; a fresh controller is required")]
    ControllerDead,
    #[error("failed to spawn debugger: {0}")]
    SpawnFailed(String),
    #[error("process '{0}' not found")]
    ProcessNotFound(String),
    #[error("no active exploit pipe")]
    NoPipe,
    #[error("exploit pipe is dead")]
    PipeDead,
    #[error("{0}")]
    Other(String),
}

impl ToolError {
    /// The stable kind string (spec.md §7 taxonomy), not the human message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation",
            ToolError::NoBinary => "no_binary",
            ToolError::BadState(_) => "bad_state",
            ToolError::UnknownStep(_) => "unknown_step",
            ToolError::Timeout => "timeout",
            ToolError::ControllerDead => "controller_dead",
            ToolError::SpawnFailed(_) => "spawn_failed",
            ToolError::ProcessNotFound(_) => "process_not_found",
            ToolError::NoPipe => "no_pipe",
            ToolError::PipeDead => "pipe_dead",
            ToolError::Other(_) => "error",
        }
    }
}

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        ToolError::Other(s)
    }
}

/// The `{success: false, error, type}` shape every failing tool call
/// returns (spec.md §7 propagation policy).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&ToolError> for ErrorEnvelope {
    fn from(e: &ToolError) -> Self {
        Self {
            success: false,
            error: e.to_string(),
            kind: e.kind().to_string(),
        }
    }
}

impl From<ToolError> for ErrorEnvelope {
    fn from(e: ToolError) -> Self {
        ErrorEnvelope::from(&e)
    }
}
