/// Error kinds shared by every recovery component
use thiserror::Error;

/// Failure of a codec, accessor or recovery operation.
///
/// Every failure is a value: nothing in this crate aborts the process, since a
/// forensic tool has to keep working on whatever partial data remains.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Bytes do not satisfy a structure's fixed contract (bad magic, short buffer)
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// No valid descriptor, backup, record or file
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation requested on a record of an incompatible type
    #[error("wrong record type: expected {expected}, found {found}")]
    WrongRecordType {
        expected: &'static str,
        found: &'static str,
    },

    /// Structurally valid, but needs indirect-block or internal extent-node traversal
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// Underlying storage read/write error
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
}

impl RecoveryError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RecoveryError::InvalidFormat(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        RecoveryError::NotFound(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        RecoveryError::UnsupportedLayout(msg.into())
    }

    /// True for storage failures, as opposed to decode or lookup failures
    pub fn is_io(&self) -> bool {
        matches!(self, RecoveryError::IoFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
