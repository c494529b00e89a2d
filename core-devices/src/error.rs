use bridge_traits::{BridgeError, DeviceRole};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device {identifier} unreachable: {reason}")]
    DeviceUnreachable { identifier: String, reason: String },

    #[error("Device {device} rejected {command}: {reason}")]
    CommandFailed {
        device: String,
        command: &'static str,
        reason: String,
    },

    #[error("No device resolver for identifier '{0}'")]
    UnsupportedIdentifier(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("{role} device {device} has already been released")]
    Released { device: String, role: DeviceRole },
}

impl DeviceError {
    /// Whether the device may answer again if asked later.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::DeviceUnreachable { .. })
    }

    pub(crate) fn from_bridge(device: &str, command: &'static str, error: BridgeError) -> Self {
        if error.is_transport() {
            DeviceError::DeviceUnreachable {
                identifier: device.to_string(),
                reason: error.to_string(),
            }
        } else {
            DeviceError::CommandFailed {
                device: device.to_string(),
                command,
                reason: error.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
