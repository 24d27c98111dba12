//! Error types for ContribChain

use thiserror::Error;

/// Coarse classification of a [`ChainError`], used by callers to decide
/// between rejecting, retrying and treating a failure as a tamper signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Consensus,
    Integrity,
    Network,
    Conflict,
    Storage,
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: String, required: String },
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),
    #[error("Double spend detected: {0}")]
    DoubleSpendDetected(String),
    #[error("Mempool is full")]
    MempoolFull,
    #[error("Consensus rejected: {0}")]
    Consensus(String),
    #[error("Integrity violation: {0}")]
    Integrity(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Chain conflict: {0}")]
    Conflict(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::InvalidTransaction(_)
            | ChainError::InvalidBlock(_)
            | ChainError::InsufficientBalance { .. }
            | ChainError::DuplicateTransaction(_)
            | ChainError::DoubleSpendDetected(_)
            | ChainError::MempoolFull
            | ChainError::CryptoError(_)
            | ChainError::Serialization(_) => ErrorKind::Validation,
            ChainError::Consensus(_) => ErrorKind::Consensus,
            ChainError::Integrity(_) => ErrorKind::Integrity,
            ChainError::NetworkError(_)
            | ChainError::FrameTooLarge { .. }
            | ChainError::IoError(_) => ErrorKind::Network,
            ChainError::Conflict(_) => ErrorKind::Conflict,
            ChainError::StorageError(_) => ErrorKind::Storage,
        }
    }

    /// Consensus rejections may succeed with a different candidate set and
    /// network failures are transient; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Consensus | ErrorKind::Network)
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ChainError::InvalidTransaction("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ChainError::Integrity("x".into()).kind(), ErrorKind::Integrity);
        assert_eq!(ChainError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert!(ChainError::Consensus("x".into()).is_retryable());
        assert!(ChainError::NetworkError("x".into()).is_retryable());
        assert!(!ChainError::MempoolFull.is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = ChainError::InsufficientBalance {
            available: "10.0000".into(),
            required: "20.0000".into(),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance: available 10.0000, required 20.0000"
        );
        assert_eq!(ChainError::MempoolFull.to_string(), "Mempool is full");
    }
}
