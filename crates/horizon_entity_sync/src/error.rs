use crate::ids::{LocalEntityId, NetworkEntityId};
use horizon_rpc::{ErrorKind, HandlerError, RpcError};
use thiserror::Error;

/// Errors raised by the entity sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A `create_entity` arrived for a network id that is already bound, or a
    /// local entity was bound twice.
    #[error("entity already synchronized: {network} (local {local:?})")]
    DuplicateEntity {
        network: NetworkEntityId,
        local: Option<LocalEntityId>,
    },

    #[error("unknown entity {0}")]
    UnknownEntity(LocalEntityId),

    #[error("invalid sync params: {0}")]
    InvalidParams(String),

    #[error("entity store error: {0}")]
    Store(String),

    /// The peer answered a sync call with an error response.
    #[error("peer rejected sync call ({kind}): {detail}")]
    Rejected {
        kind: ErrorKind,
        reason: Option<String>,
        detail: String,
    },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl SyncError {
    /// Machine-readable reason forwarded to the peer in error responses.
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::DuplicateEntity { .. } => "duplicate_entity",
            SyncError::UnknownEntity(_) => "unknown_entity",
            SyncError::InvalidParams(_) => "invalid_params",
            SyncError::Store(_) => "store_error",
            SyncError::Rejected { .. } => "rejected",
            SyncError::Rpc(_) => "rpc_error",
        }
    }
}

impl From<SyncError> for HandlerError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::InvalidParams(detail) => HandlerError::InvalidParams(detail),
            other => HandlerError::with_reason(other.reason(), other.to_string()),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
