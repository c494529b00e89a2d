//! Error types for the TIDAL provider

use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TidalError {
    #[error("Invalid TIDAL configuration: {0}")]
    InvalidConfig(String),

    /// Status the bridge taxonomy does not cover
    #[error("TIDAL API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Track {track_id} cannot be streamed")]
    NotStreamable { track_id: String },

    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, TidalError>;

impl From<TidalError> for BridgeError {
    fn from(error: TidalError) -> Self {
        match error {
            TidalError::InvalidConfig(msg) => BridgeError::NotAvailable(msg),
            TidalError::ApiError {
                status_code,
                message,
            } => BridgeError::OperationFailed(format!(
                "API error (status {}): {}",
                status_code, message
            )),
            TidalError::NotStreamable { track_id } => {
                BridgeError::NotFound(format!("track {} is not streamable", track_id))
            }
            TidalError::ParseError(msg) => {
                BridgeError::OperationFailed(format!("Parse error: {}", msg))
            }
            TidalError::BridgeError(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TidalError::ApiError {
            status_code: 429,
            message: "slow down".to_string(),
        };
        assert_eq!(error.to_string(), "TIDAL API error (status 429): slow down");
    }

    #[test]
    fn test_not_streamable_maps_to_not_found() {
        let bridge: BridgeError = TidalError::NotStreamable {
            track_id: "42".to_string(),
        }
        .into();
        assert!(matches!(bridge, BridgeError::NotFound(_)));
    }

    #[test]
    fn test_bridge_error_passes_through() {
        let bridge: BridgeError =
            TidalError::BridgeError(BridgeError::Unauthorized("bad password".into())).into();
        assert!(matches!(bridge, BridgeError::Unauthorized(_)));
    }
}
