//! Error types for registration runs and evaluations.
//!
//! Every failure a caller can observe is one of these variants. Failures are
//! either returned synchronously (`Busy`) or carried inside the outcome that
//! is handed to a completion callback.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for registration and evaluation operations.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Empty or mismatched inputs, detected before any expensive work.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No resolvable configuration artifact or engine executable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A collaborator failed to export an input into the working directory.
    #[error("Export of {what} failed: {reason}")]
    Export { what: String, reason: String },

    /// The engine process could not be started.
    #[error("Failed to start engine process: {0}")]
    Spawn(String),

    /// The engine exited with a non-zero code (or was killed by a signal).
    #[error("Engine process failed with exit code {}", fmt_exit_code(.exit_code))]
    ProcessFailure { exit_code: Option<i32> },

    /// The engine exited cleanly but produced no usable transform artifact.
    #[error("Missing output: no transform artifact found in {}", .directory.display())]
    MissingOutput { directory: PathBuf },

    /// More than one candidate artifact and no way to pick one.
    #[error("Ambiguous output: {} candidate transform artifacts ({})", .candidates.len(), .candidates.join(", "))]
    AmbiguousOutput { candidates: Vec<String> },

    /// The artifact exists but could not be parsed into a transform.
    #[error("Failed to load transform from {}: {reason}", .path.display())]
    TransformLoad { path: PathBuf, reason: String },

    /// The run was cancelled before it reached a terminal state.
    #[error("Run cancelled")]
    Cancelled,

    /// The intensity metric failed on the worker thread.
    #[error("Metric error: {0}")]
    Metric(String),

    /// Another operation of the same kind is still in flight.
    #[error("Busy: {0} already in progress")]
    Busy(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

impl RegistrationError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an export error for the named input.
    pub fn export(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Export {
            what: what.into(),
            reason: format!("{err:#}"),
        }
    }

    /// Create a transform load error.
    pub fn transform_load(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::TransformLoad {
            path: path.into(),
            reason: format!("{reason:#}"),
        }
    }

    /// Create a metric error.
    pub fn metric(msg: impl Into<String>) -> Self {
        Self::Metric(msg.into())
    }

    /// True for the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
