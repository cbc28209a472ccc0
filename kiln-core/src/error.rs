//! Error types for Kiln operations.

use crate::types::BatchResult;

/// The main error type for generation operations.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    /// Provider-specific errors
    #[error("Provider error: {0}")]
    Provider(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stream errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// Unsupported operation errors
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Lifecycle reporter misbehaved
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Cache lookup failed. Never fatal: the orchestration treats it as a miss.
    #[error("Cache read error: {0}")]
    CacheRead(String),

    /// One or more cache writes failed after generation succeeded
    #[error(transparent)]
    CacheWrite(#[from] CacheWriteError),

    /// A streaming call completed without producing any chunk
    #[error("Received empty response from chat model call")]
    EmptyStream,

    /// Structured output expected a tool call that was not in the response
    #[error("Tool call missing: {0}")]
    ToolCallMissing(String),

    /// The shared cancellation signal fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The call deadline elapsed
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl KilnError {
    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a lifecycle error
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    /// Create a cache read error
    pub fn cache_read(msg: impl Into<String>) -> Self {
        Self::CacheRead(msg.into())
    }

    /// Create a missing tool call error
    pub fn tool_call_missing(msg: impl Into<String>) -> Self {
        Self::ToolCallMissing(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error came from the cancellation signal or a deadline
    pub fn is_cancellation(&self) -> bool {
        matches!(self, KilnError::Cancelled | KilnError::Timeout(_))
    }
}

impl From<String> for KilnError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<&str> for KilnError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

/// A single failed cache write.
#[derive(Debug)]
pub struct CacheWriteFailure {
    /// Index of the conversation in the batch
    pub index: usize,
    /// Error reported by the store
    pub error: KilnError,
}

/// Cache writes failed, but every generation in the batch succeeded.
///
/// The assembled result is kept so callers can still use it.
#[derive(Debug, thiserror::Error)]
#[error("Cache write error: {} write(s) failed, first at index {}", .failures.len(), .failures.first().map(|f| f.index).unwrap_or_default())]
pub struct CacheWriteError {
    pub failures: Vec<CacheWriteFailure>,
    pub result: Box<BatchResult>,
}

impl CacheWriteError {
    /// Recover the batch result that was generated before the writes failed
    pub fn into_result(self) -> BatchResult {
        *self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_kinds() {
        assert!(KilnError::Cancelled.is_cancellation());
        assert!(KilnError::timeout("5s").is_cancellation());
        assert!(!KilnError::EmptyStream.is_cancellation());
    }

    #[test]
    fn test_cache_write_error_keeps_result() {
        let err = CacheWriteError {
            failures: vec![CacheWriteFailure {
                index: 2,
                error: KilnError::other("disk full"),
            }],
            result: Box::new(BatchResult::default()),
        };
        assert_eq!(
            err.to_string(),
            "Cache write error: 1 write(s) failed, first at index 2"
        );
        assert!(err.into_result().generations.is_empty());
    }
}
