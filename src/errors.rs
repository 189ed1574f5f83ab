//! Error types for the server and connection pools

use crate::connection::ResultCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Server list is empty")]
    EmptyServerList,

    #[error("Invalid capacity settings: initial size {initial}, capacity {capacity}")]
    InvalidCapacity { initial: usize, capacity: usize },

    #[error("No directory server available")]
    NoServerAvailable,

    #[error("Pool is closed")]
    Closed,

    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Directory operation failed with code {code}: {message}")]
    Directory { code: ResultCode, message: String },

    #[error("Metrics export failed: {0}")]
    Metrics(String),
}

impl PoolError {
    /// Startup misconfiguration; retrying cannot help.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::EmptyServerList | Self::InvalidCapacity { .. })
    }

    /// Whether the caller may back off and try acquiring again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoServerAvailable | Self::Connect { .. } | Self::Timeout(_)
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_taxonomy() {
        assert!(PoolError::EmptyServerList.is_config());
        assert!(PoolError::InvalidCapacity { initial: 3, capacity: 2 }.is_config());
        assert!(!PoolError::NoServerAvailable.is_config());

        assert!(PoolError::NoServerAvailable.is_retryable());
        assert!(PoolError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!PoolError::Closed.is_retryable());
        assert!(!PoolError::EmptyServerList.is_retryable());
    }
}
