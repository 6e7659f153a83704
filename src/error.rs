//! Error types for the resource-lock coordinator.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// The reason a single resource failed to lock or refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input has never been produced, or its producer currently holds the output lock.
    InputMissing,
    /// On refresh only: another writer has seized the input.
    InputLockLost,
    /// Output marker present and `overwrite=false`; unrecoverable by waiting.
    OutputExists,
    /// Another holder owns the output lock.
    OutputLocked,
    /// Some reader still holds an input lock on the output name.
    OutputUsed,
    /// On refresh only: our output lock expired; reacquired in the same call.
    OutputLockLost,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputMissing => "input_missing",
            ErrorKind::InputLockLost => "input_lock_lost",
            ErrorKind::OutputExists => "output_exists",
            ErrorKind::OutputLocked => "output_locked",
            ErrorKind::OutputUsed => "output_used",
            ErrorKind::OutputLockLost => "output_lock_lost",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<ErrorKind> {
        match s {
            "input_missing" => Some(ErrorKind::InputMissing),
            "input_lock_lost" => Some(ErrorKind::InputLockLost),
            "output_exists" => Some(ErrorKind::OutputExists),
            "output_locked" => Some(ErrorKind::OutputLocked),
            "output_used" => Some(ErrorKind::OutputUsed),
            "output_lock_lost" => Some(ErrorKind::OutputLockLost),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A grouping of offending resource names by failure kind.
pub type ErrorMap = HashMap<ErrorKind, Vec<String>>;

/// Errors surfaced by this crate.
#[derive(Debug, Error)]
pub enum FlowLockError {
    /// One or more inputs were unavailable, or one or more outputs were already locked,
    /// after exhausting the wait budget (or immediately, for a hard failure on refresh).
    #[error("resource unavailable: {0:?}")]
    ResourceUnavailable(ErrorMap),
    /// The manager was used incorrectly (e.g. mutating inputs/outputs while running).
    #[error("usage error: {0}")]
    Usage(String),
    /// The underlying Redis store returned an error.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
    /// A script reply could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowLockError>;
