//! Grid-specific error types

use thiserror::Error;

/// How an error should be treated by the retry policy and the check cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or API hiccup, safe to retry with backoff
    Transient,
    /// Not enough capital or base asset; retried on a later cycle
    Insufficient,
    /// Exchange refused the request (bad price/size, rate limit)
    Rejected,
    /// Local tables disagree with each other
    Inconsistent,
    /// Engine must stop and wait for a manual restart
    Fatal,
}

/// Errors that can occur in grid and volume-cycling operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Grid level not found: index {0}")]
    LevelNotFound(usize),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("{operation} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        reason: String,
    },

    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Engine is in invalid state for operation: {current_state}")]
    InvalidState { current_state: String },

    #[error("Cannot start {requested}: {running} is already running")]
    ModeConflict { requested: String, running: String },

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl GridError {
    /// Classify this error for retry and recovery decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::Exchange(_) | GridError::Stream(_) | GridError::Timeout(_) => {
                ErrorKind::Transient
            }
            GridError::InsufficientBalance { .. } => ErrorKind::Insufficient,
            GridError::Rejected(_) | GridError::RetriesExhausted { .. } => ErrorKind::Rejected,
            GridError::LevelNotFound(_)
            | GridError::OrderNotFound(_)
            | GridError::Inconsistent(_) => ErrorKind::Inconsistent,
            GridError::InvalidConfig(_)
            | GridError::StatePersistence(_)
            | GridError::RiskLimitExceeded(_)
            | GridError::InvalidState { .. }
            | GridError::ModeConflict { .. }
            | GridError::ChannelSend(_)
            | GridError::JsonParse(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the retry policy may re-issue the failed call
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(GridError::Exchange("timeout".into()).is_retryable());
        assert!(GridError::Timeout("fill wait".into()).is_retryable());
        assert!(!GridError::Rejected("bad size".into()).is_retryable());
        assert_eq!(
            GridError::InsufficientBalance { required: 10.0, available: 1.0 }.kind(),
            ErrorKind::Insufficient
        );
        assert_eq!(GridError::LevelNotFound(3).kind(), ErrorKind::Inconsistent);
        assert_eq!(
            GridError::RiskLimitExceeded("total stop-loss".into()).kind(),
            ErrorKind::Fatal
        );
    }
}
