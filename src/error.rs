use thiserror::Error as ThisError;

use crate::stack::StackError;
use crate::storage::StorageError;

/// Errors surfaced to API callers.
///
/// Background loops never propagate these; they log and continue. Command
/// handlers map them to stable wire error codes via [`ControllerError::error_code`].
#[derive(ThisError, Debug)]
pub enum ControllerError {
    #[error("Node {0} does not exist or is not yet interviewed")]
    NodeNotExists(u64),

    #[error("Node {0} is not (yet) available")]
    NodeNotReady(u64),

    #[error("Commissioning failed for node {0}")]
    NodeCommissionFailed(u64),

    #[error("Failed to interview node {0}")]
    NodeInterviewFailed(u64),

    #[error("Node {0} could not be resolved on the fabric")]
    NodeNotResolving(u64),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Matter stack error: {0}")]
    Stack(StackError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ControllerError {
    /// Stable error code used by the command API.
    pub fn error_code(&self) -> u16 {
        match self {
            ControllerError::NodeCommissionFailed(_) => 1,
            ControllerError::NodeInterviewFailed(_) => 2,
            ControllerError::NodeNotResolving(_) => 3,
            ControllerError::NodeNotExists(_) => 4,
            ControllerError::NodeNotReady(_) => 5,
            ControllerError::InvalidArguments(_) => 6,
            ControllerError::Stack(_) | ControllerError::Storage(_) => 0,
        }
    }
}

impl From<StackError> for ControllerError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::NotResolving(node_id) => ControllerError::NodeNotResolving(node_id),
            other => ControllerError::Stack(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
