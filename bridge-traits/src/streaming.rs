//! Streaming Service Abstraction
//!
//! Contract for the cloud music services a run can pull tracks from. The
//! session manager owns token lifetime; implementations only translate each
//! call into the service's API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Account details used to open a service session.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    /// Service-issued application or account identifier
    pub service_id: String,
    pub username: String,
    pub password: String,
}

impl ServiceCredentials {
    pub fn new(
        service_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("service_id", &self.service_id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Opaque session token returned by a successful login.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceToken {
    pub access_token: String,
    pub user_id: String,
    /// Catalog region the account is bound to
    pub country_code: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ServiceToken {
    /// `true` when the token expires within `buffer` of `now`. Tokens without
    /// an expiry never need renewal.
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let buffer = chrono::Duration::from_std(buffer)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                now + buffer >= expires_at
            }
            None => false,
        }
    }
}

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceToken")
            .field("access_token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("country_code", &self.country_code)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A track as listed by the service catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTrack {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration: Duration,
    /// Service quality tier, e.g. `LOSSLESS` or `HIGH`
    pub quality: String,
}

/// One cloud music service.
///
/// Errors follow the bridge taxonomy: rejected credentials are
/// `Unauthorized`, unknown or unlicensed tracks are `NotFound`, transport
/// problems are `Unreachable`.
#[async_trait]
pub trait StreamingService: Send + Sync {
    /// Short service name used in logs, e.g. `tidal`
    fn service_name(&self) -> &str;

    async fn login(&self, credentials: &ServiceCredentials) -> Result<ServiceToken>;

    /// Obtain a fresh token before `current` lapses. Services without a
    /// refresh grant log in again.
    async fn renew(
        &self,
        credentials: &ServiceCredentials,
        current: &ServiceToken,
    ) -> Result<ServiceToken> {
        let _ = current;
        self.login(credentials).await
    }

    async fn logout(&self, token: &ServiceToken) -> Result<()>;

    /// Page through the tracks the service offers for testing.
    async fn list_catalog(
        &self,
        token: &ServiceToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CatalogTrack>>;

    async fn lookup_track(&self, token: &ServiceToken, track_id: &str) -> Result<CatalogTrack>;

    /// Playable URI for a track, valid for at least the track's duration.
    async fn stream_url(&self, token: &ServiceToken, track_id: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = ServiceCredentials::new("app-id", "listener", "hunter2");
        let rendered = format!("{:?}", credentials);

        assert!(rendered.contains("listener"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_token_expiry_window() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let token = ServiceToken {
            access_token: "secret".to_string(),
            user_id: "1".to_string(),
            country_code: None,
            expires_at: Some(now + chrono::Duration::seconds(60)),
        };

        assert!(!token.expires_within(now, Duration::from_secs(30)));
        assert!(token.expires_within(now, Duration::from_secs(60)));
        assert!(!format!("{:?}", token).contains("secret"));

        let forever = ServiceToken {
            expires_at: None,
            ..token
        };
        assert!(!forever.expires_within(now, Duration::from_secs(3600)));
    }
}
