//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Keep this focused on deterministic data failures (malformed identifiers,
/// unparseable feed labels). I/O concerns belong to the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. empty or padded).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A feed timestamp label did not match the feed time format.
    #[error("invalid timestamp {label:?}: {reason}")]
    InvalidTimestamp { label: String, reason: String },

    /// A feed rating label was not an integer.
    #[error("invalid rating {0:?}")]
    InvalidRating(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_timestamp(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTimestamp {
            label: label.into(),
            reason: reason.into(),
        }
    }
}
