//! Error types for ledger access.

use thiserror::Error;

/// Errors reported by a ledger handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The backing ledger rejected or failed the operation.
    #[error("{0}")]
    Backend(String),

    /// The query iterator has already been closed.
    #[error("query iterator already closed")]
    IteratorClosed,
}

impl LedgerError {
    /// Create a backend error from any message.
    pub fn backend(message: impl Into<String>) -> Self {
        LedgerError::Backend(message.into())
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_display_is_the_message() {
        let e = LedgerError::backend("connection reset");
        assert_eq!(e.to_string(), "connection reset");
    }

    #[test]
    fn iterator_closed_display() {
        assert!(LedgerError::IteratorClosed.to_string().contains("closed"));
    }
}
