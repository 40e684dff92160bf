//! ============================================================================
//! Memory Errors - Typed failure taxonomy for the memory subsystem
//! ============================================================================
//! Driver-level failures (HTTP, Neo4j status codes, redb, bincode) are
//! translated into these variants at the connection/backend boundary.
//! ============================================================================

use std::time::Duration;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Error types for the memory subsystem
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    #[error("Connection timeout after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Circuit breaker open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("Query rejected ({code}): {message}")]
    Query { code: String, message: String },

    #[error("Storage failed: {0}")]
    Storage(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MemoryError {
    /// Build a validation error for a named field
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        MemoryError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the failure is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MemoryError::ConnectionTimeout(_) | MemoryError::Connection(_)
        )
    }

    /// Re-tag a backend failure raised during candidate generation.
    /// Breaker rejections and caller mistakes keep their own variant.
    pub fn into_retrieval(self) -> Self {
        match self {
            e @ (MemoryError::CircuitOpen { .. }
            | MemoryError::Validation { .. }
            | MemoryError::Retrieval(_)) => e,
            other => MemoryError::Retrieval(other.to_string()),
        }
    }

    /// Re-tag a backend failure raised while persisting a record
    pub fn into_storage(self) -> Self {
        match self {
            e @ (MemoryError::CircuitOpen { .. }
            | MemoryError::Validation { .. }
            | MemoryError::Storage(_)
            | MemoryError::ConnectionTimeout(_)
            | MemoryError::Connection(_)) => e,
            other => MemoryError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MemoryError::ConnectionTimeout(Duration::from_secs(1)).is_transient());
        assert!(MemoryError::Connection("reset".into()).is_transient());
        assert!(!MemoryError::Schema("missing index".into()).is_transient());
        assert!(!MemoryError::validation("user_id", "empty").is_transient());
        assert!(!MemoryError::CircuitOpen {
            retry_in: Duration::from_secs(3)
        }
        .is_transient());
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = MemoryError::validation("user_id", "must not be empty");
        assert_eq!(err.to_string(), "Invalid user_id: must not be empty");
    }

    #[test]
    fn test_into_retrieval_keeps_breaker_rejection() {
        let open = MemoryError::CircuitOpen {
            retry_in: Duration::from_millis(10),
        };
        assert!(matches!(open.into_retrieval(), MemoryError::CircuitOpen { .. }));

        let conn = MemoryError::Connection("refused".into());
        assert!(matches!(conn.into_retrieval(), MemoryError::Retrieval(_)));
    }
}
