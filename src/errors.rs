use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PalmgrError {
    /// Expected absence of a process or file, never an exceptional condition.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed settings document: {0}")]
    MalformedDocument(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("backup integrity check failed: {0}")]
    IntegrityFailure(String),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("another lifecycle transition is already in flight")]
    TransitionInFlight,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
