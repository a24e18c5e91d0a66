//! Error types for session operations

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while creating, driving, or tearing down sessions
#[derive(Error, Debug)]
pub enum SessionError {
    /// Template or session directory could not be prepared
    #[error("failed to provision session directory: {0}")]
    Provision(String),

    /// The OS refused to start the worker process
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker reported an initialization failure or never initialized
    #[error("worker initialization failed: {0}")]
    Init(String),

    /// No session registered under the given id
    #[error("session not found: {0}")]
    NotFound(String),

    /// The worker did not answer within the command timeout
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The worker's pipe closed or its process exited mid-command
    #[error("worker is dead: {0}")]
    WorkerDead(String),

    /// The worker produced a line that is not a valid response
    #[error("malformed worker response: {0}")]
    Protocol(String),

    /// The vendor library rejected the command; message passed through verbatim
    #[error("{0}")]
    Vendor(String),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Errors after which the session cannot be trusted and must be torn down
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WorkerDead(_) | Self::Protocol(_))
    }

    /// True when the worker answered but the vendor library refused the command
    pub fn is_vendor(&self) -> bool {
        matches!(self, Self::Vendor(_))
    }

    /// True when the session id did not resolve to a registered session
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
