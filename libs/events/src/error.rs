//! Errors raised while naming or rendering task events.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A string did not name any [`crate::TaskEventKind`].
    #[error("unknown task event type: {0}")]
    UnknownEventType(String),

    /// Rendering an event as JSON failed.
    #[error("failed to render task event: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
