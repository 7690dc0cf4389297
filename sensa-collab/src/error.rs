//! Error types surfaced to the editor.

use thiserror::Error;

use crate::model::OperationId;
use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// Errors returned by [`CollabContext`](crate::CollabContext) calls.
///
/// Authorization denials carry no reason: the caller learns only that the
/// action was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not permitted")]
    Authorization,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("operation {operation_id} failed: {reason}")]
    Operation {
        operation_id: OperationId,
        reason: String,
    },

    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;

impl CollabError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Forbidden => Self::Authorization,
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<ProtocolError> for CollabError {
    fn from(err: ProtocolError) -> Self {
        Self::Channel(err.to_string())
    }
}
