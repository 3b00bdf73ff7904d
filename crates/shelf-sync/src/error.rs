// File: shelf-sync/src/error.rs
// Purpose: Error types surfaced by the engine

use thiserror::Error;

use crate::identifier::RecordId;
use crate::queue::ActionKind;

/// Failure of a single call to the server
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// The request never got a response
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response body could not be decoded
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Transient failures are expected to go away once the server is reachable again
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout => true,
            ClientError::Rejected { status, .. } => *status >= 500,
            ClientError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Enqueue rejected before the action reached the queue
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("{kind} action requires a record id")]
    MissingIdentifier { kind: ActionKind },

    #[error("{kind} action requires book fields")]
    MissingDraft { kind: ActionKind },
}

/// Errors returned by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Client(#[from] ClientError),

    /// A local id this device no longer tracks (already synced or deleted)
    #[error("unknown local record {0}")]
    UnknownRecord(RecordId),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
