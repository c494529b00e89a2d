use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Service {service} rejected the credentials: {reason}")]
    AuthenticationFailed { service: String, reason: String },

    #[error("Service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Track {track_id} unavailable: {reason}")]
    TrackUnavailable { track_id: String, reason: String },

    #[error("Operation timed out: {operation}")]
    OperationTimeout { operation: String },

    #[error("Session {0} has been released")]
    Released(String),
}

impl SessionError {
    /// Everything except a single unavailable track ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::TrackUnavailable { .. })
    }

    /// Translate a bridge failure raised during account-level calls.
    pub(crate) fn from_service(service: &str, error: BridgeError) -> Self {
        match error {
            BridgeError::Unauthorized(reason) => SessionError::AuthenticationFailed {
                service: service.to_string(),
                reason,
            },
            other => SessionError::ServiceUnavailable {
                service: service.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Translate a bridge failure raised while resolving one track.
    pub(crate) fn from_track(service: &str, track_id: &str, error: BridgeError) -> Self {
        match error {
            BridgeError::NotFound(reason) => SessionError::TrackUnavailable {
                track_id: track_id.to_string(),
                reason,
            },
            other => Self::from_service(service, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_mapping() {
        let err = SessionError::from_service("tidal", BridgeError::Unauthorized("401".into()));
        assert!(matches!(err, SessionError::AuthenticationFailed { .. }));
        assert!(err.is_fatal());

        let err = SessionError::from_service("tidal", BridgeError::Unreachable("dns".into()));
        assert!(matches!(err, SessionError::ServiceUnavailable { .. }));

        let err = SessionError::from_track("tidal", "77", BridgeError::NotFound("404".into()));
        assert!(matches!(err, SessionError::TrackUnavailable { ref track_id, .. } if track_id == "77"));
        assert!(!err.is_fatal());

        let err = SessionError::from_track("tidal", "77", BridgeError::Unauthorized("401".into()));
        assert!(matches!(err, SessionError::AuthenticationFailed { .. }));
    }
}
