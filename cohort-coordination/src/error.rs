//! Error types for coordination

use cohort_config::ConfigError;
use cohort_ipc::{IpcError, Rank, Tag};
use thiserror::Error;

/// Coordination result type
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Coordination errors
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Transport error: {0}")]
    Transport(#[from] IpcError),

    #[error("Unknown message type tag {tag}")]
    UnknownMessageType { tag: Tag },

    #[error("Message type {kind} is not registered")]
    UnregisteredMessage { kind: String },

    #[error("Message type {kind} registered twice")]
    DuplicateMessageType { kind: String },

    #[error("Expected message {expected}, received {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    #[error("No handler for message {kind} on this process")]
    NoHandler { kind: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Rank {rank} sent {kind} with contents inconsistent with the other ranks")]
    InconsistentRequest { kind: String, rank: Rank },

    #[error("Number of jobs ({actual}) expected by rank {rank} is inconsistent with {expected}")]
    InconsistentJobList {
        expected: usize,
        actual: usize,
        rank: Rank,
    },

    #[error("Iteration context presented by rank {rank} does not match the other ranks")]
    InconsistentContext { rank: Rank },

    #[error("Rank {rank} left while {kind} was still waiting for it")]
    CollectiveAbandoned { kind: String, rank: Rank },

    #[error("Error on rank {rank} while processing {kind}: {message}")]
    Remote {
        rank: Rank,
        kind: String,
        message: String,
    },

    #[error("The coordinator cannot take part in a barrier while workers exist")]
    CoordinatorBarrier,

    #[error("The coordinator cannot iterate over jobs while workers exist")]
    CoordinatorCannotIterate,

    #[error("Lock {name} is not held")]
    LockNotHeld { name: String },

    #[error("Lock protocol violation: {0}")]
    LockProtocol(String),

    #[error("No accumulator registered for kind {kind}")]
    UnknownAccumulator { kind: String },

    #[error("No accumulator with id {id}")]
    UnknownAccumulatorId { id: usize },

    #[error("No active iteration with id {id}")]
    UnknownIteration { id: u64 },

    #[error("Dataset {name} is unavailable")]
    DatasetUnavailable { name: String },

    #[error("Rank {rank} does not hold the current dataset")]
    DatasetNotHeld { rank: Rank },

    #[error("Array {name} not found in dataset {dataset}")]
    ArrayNotFound { dataset: String, name: String },

    #[error("Invalid array: {0}")]
    InvalidArray(String),

    #[error("Shared segment {name} is unavailable")]
    SegmentUnavailable { name: String },

    #[error("A connection to dataset {name} is already open")]
    ConnectionActive { name: String },

    #[error("Operation {operation} is only available to workers")]
    WorkerOnly { operation: &'static str },

    #[error("Rank {rank} panicked: {message}")]
    WorkerPanicked { rank: Rank, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinationError {
    /// Check if this error corrupts shared coordinator state; such errors end
    /// the session rather than being returned to a single requester.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinationError::UnknownMessageType { .. }
                | CoordinationError::UnexpectedMessageType { .. }
                | CoordinationError::NoHandler { .. }
                | CoordinationError::Codec(_)
                | CoordinationError::InconsistentRequest { .. }
                | CoordinationError::InconsistentJobList { .. }
                | CoordinationError::InconsistentContext { .. }
                | CoordinationError::CollectiveAbandoned { .. }
                | CoordinationError::LockProtocol(_)
        ) || matches!(self, CoordinationError::Transport(err) if err.is_terminal())
    }

    /// Check if this error was raised on another process and re-raised here
    pub fn is_remote(&self) -> bool {
        matches!(self, CoordinationError::Remote { .. })
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<base64::DecodeError> for CoordinationError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert!(CoordinationError::UnknownMessageType { tag: 999 }.is_fatal());
        assert!(CoordinationError::InconsistentJobList {
            expected: 10,
            actual: 9,
            rank: 2
        }
        .is_fatal());
        assert!(CoordinationError::Transport(IpcError::ConnectionClosed).is_fatal());

        assert!(!CoordinationError::UnknownAccumulatorId { id: 4 }.is_fatal());
        assert!(!CoordinationError::DatasetUnavailable {
            name: "snap".to_string()
        }
        .is_fatal());
        assert!(!CoordinationError::Transport(IpcError::InvalidRank { rank: 9, size: 2 }).is_fatal());
    }

    #[test]
    fn test_remote_classification() {
        let err = CoordinationError::Remote {
            rank: 0,
            kind: "lock_release".to_string(),
            message: "boom".to_string(),
        };
        assert!(err.is_remote());
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Error on rank 0 while processing lock_release: boom"
        );
    }

    #[test]
    fn test_job_list_message() {
        let err = CoordinationError::InconsistentJobList {
            expected: 10,
            actual: 9,
            rank: 3,
        };
        assert_eq!(
            err.to_string(),
            "Number of jobs (9) expected by rank 3 is inconsistent with 10"
        );
    }
}
