use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Local identifier of an authenticated session.
///
/// Never derived from the service token, so it is safe to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Login state of the service account, as shown in run reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail")]
pub enum CredentialStatus {
    /// No login attempted yet
    NotConfigured,
    LoggingIn,
    LoggedIn,
    /// Last login or renewal failed
    Failed(String),
    LoggedOut,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialStatus::NotConfigured => write!(f, "not configured"),
            CredentialStatus::LoggingIn => write!(f, "logging in"),
            CredentialStatus::LoggedIn => write!(f, "logged in"),
            CredentialStatus::Failed(reason) => write!(f, "login failed: {}", reason),
            CredentialStatus::LoggedOut => write!(f, "logged out"),
        }
    }
}

/// Playable location of one track.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StreamUri(String);

impl StreamUri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

// Signed URLs carry credentials in the query string
impl fmt::Debug for StreamUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamUri({})", core_runtime::logging::redact_uri(&self.0))
    }
}

impl fmt::Display for StreamUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", core_runtime::logging::redact_uri(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_uri_hides_query() {
        let uri = StreamUri::new("https://cdn.example.com/t.flac?token=abc");
        assert_eq!(uri.as_str(), "https://cdn.example.com/t.flac?token=abc");
        assert!(!uri.to_string().contains("abc"));
        assert!(!format!("{:?}", uri).contains("abc"));
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_credential_status_display() {
        assert_eq!(CredentialStatus::LoggedIn.to_string(), "logged in");
        assert_eq!(
            CredentialStatus::Failed("bad password".to_string()).to_string(),
            "login failed: bad password"
        );
    }
}
