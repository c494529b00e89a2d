use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Remote rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Remote resource not found: {0}")]
    NotFound(String),

    #[error("Remote endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure came from the transport rather than the remote's answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::Unreachable(_) | BridgeError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
