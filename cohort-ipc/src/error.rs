//! Transport error types

use thiserror::Error;

use crate::transport::Rank;

/// Transport result type
pub type IpcResult<T> = Result<T, IpcError>;

/// Transport error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Coordination was attempted without a multi-process transport
    #[error("Cannot communicate with another process: parallelism is disabled")]
    TransportDisabled,

    /// Destination rank outside the session
    #[error("Invalid rank {rank} (session size is {size})")]
    InvalidRank { rank: Rank, size: usize },

    /// The peer endpoint has gone away
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport was used after finalize()
    #[error("Transport already finalized")]
    Finalized,

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl IpcError {
    /// Check if this error means the transport can no longer be used at all
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IpcError::TransportDisabled | IpcError::ConnectionClosed | IpcError::Finalized
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_terminal() {
        assert!(IpcError::TransportDisabled.is_terminal());
        assert!(IpcError::ConnectionClosed.is_terminal());
        assert!(IpcError::Finalized.is_terminal());
        assert!(!IpcError::InvalidRank { rank: 4, size: 2 }.is_terminal());
        assert!(!IpcError::IoError("pipe".to_string()).is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = IpcError::InvalidRank { rank: 7, size: 3 };
        assert_eq!(err.to_string(), "Invalid rank 7 (session size is 3)");
    }
}
