//! Error types for the OpenHome adapter

use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenHomeError {
    #[error("Invalid device address '{0}'")]
    InvalidAddress(String),

    /// The device answered with a SOAP fault
    #[error("{service}.{action} failed ({code}): {description}")]
    Fault {
        service: String,
        action: String,
        code: String,
        description: String,
    },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, OpenHomeError>;

impl From<OpenHomeError> for BridgeError {
    fn from(error: OpenHomeError) -> Self {
        match error {
            OpenHomeError::InvalidAddress(address) => {
                BridgeError::Unreachable(format!("invalid device address '{}'", address))
            }
            OpenHomeError::BridgeError(e) => e,
            other => BridgeError::OperationFailed(other.to_string()),
        }
    }
}
