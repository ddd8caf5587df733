//! Error types for the tether-shell crate.
//!
//! Only setup problems surface as `ShellError`. Failures while a command runs
//! (timeouts, rejected input, a dead shell) come back as sentinel exit codes
//! inside a `CompletedProcess`.

use thiserror::Error;

use crate::types::SessionState;

/// All errors that can originate from session setup and bookkeeping.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Session names end up in checkpoint file names.
    #[error("Invalid session name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The shell could not be spawned or died right after spawning.
    #[error("Shell spawn error: {0}")]
    Spawn(String),

    /// The requested session does not exist in the manager.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// `start` was called on a session that already ran.
    #[error("Session {name} cannot be started: it is {state}")]
    NotStartable { name: String, state: SessionState },

    /// I/O while preparing the checkpoint directory or polling the new shell.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ShellError>;
