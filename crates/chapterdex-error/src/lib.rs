//! Error type shared by every chapterdex crate.
//!
//! Overflow is the only variant a caller is expected to recover from in the
//! normal course of operation: the insert is dropped and the index stays
//! searchable. Everything else is either a contract violation, damaged
//! persisted data, or an I/O failure from the stream collaborator.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, IndexError>;

/// All failures surfaced by the delta index and the volume index.
#[derive(Error, Debug)]
pub enum IndexError {
    /// A delta list or a zone ran out of room. Non-fatal.
    #[error("delta index overflow: {detail}")]
    Overflow { detail: String },

    /// Persisted data or an in-memory bit stream failed validation.
    #[error("corrupt index data: {detail}")]
    CorruptData { detail: String },

    /// The caller passed an argument outside the contract.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// The operation is not legal for the object's current state.
    #[error("bad state: {detail}")]
    BadState { detail: String },

    /// A collision entry was inserted on top of an existing collision entry.
    #[error("duplicate record name")]
    DuplicateName,

    /// Propagated unchanged from the reader/writer collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub fn overflow(detail: impl Into<String>) -> Self {
        Self::Overflow {
            detail: detail.into(),
        }
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptData {
            detail: detail.into(),
        }
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    pub fn bad_state(detail: impl Into<String>) -> Self {
        Self::BadState {
            detail: detail.into(),
        }
    }

    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }

    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptData { .. })
    }

    /// Stable short name for structured logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Overflow { .. } => "overflow",
            Self::CorruptData { .. } => "corrupt_data",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::BadState { .. } => "bad_state",
            Self::DuplicateName => "duplicate_name",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_detail() {
        let err = IndexError::corrupt("delta index file has bad magic number");
        assert_eq!(
            err.to_string(),
            "corrupt index data: delta index file has bad magic number"
        );
        assert!(err.is_corrupt());
        assert!(!err.is_overflow());
        assert_eq!(err.kind(), "corrupt_data");
    }

    #[test]
    fn test_io_error_converts_verbatim() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: IndexError = io.into();
        match err {
            IndexError::Io(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_overflow_predicate() {
        assert!(IndexError::overflow("list 3 exceeds 65535 bits").is_overflow());
        assert_eq!(IndexError::DuplicateName.kind(), "duplicate_name");
    }
}
