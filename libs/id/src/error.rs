//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID contains whitespace, which callers almost never intend.
    #[error("ID contains whitespace at byte {position}")]
    ContainsWhitespace { position: usize },
}
