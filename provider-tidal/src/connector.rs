//! TIDAL API connector
//!
//! Implements [`StreamingService`] against the TIDAL v1 REST API.

use async_trait::async_trait;
use bridge_traits::error::Result;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
use bridge_traits::streaming::{CatalogTrack, ServiceCredentials, ServiceToken, StreamingService};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::TidalError;
use crate::types::{LoginResponse, StreamUrlResponse, TidalTrack, TrackPage};

/// TIDAL API base URL
pub const TIDAL_API_BASE: &str = "https://api.tidal.com/v1/";

/// Playlist whose tracks make up the test catalog
pub const DEFAULT_CATALOG_PLAYLIST: &str = "1b418bb8-90a7-4f87-901d-707993838346";

const TOKEN_HEADER: &str = "X-Tidal-Token";
const SESSION_HEADER: &str = "X-Tidal-SessionId";

/// Connection settings for [`TidalConnector`].
#[derive(Debug, Clone)]
pub struct TidalConfig {
    pub api_base: Url,
    /// Application token sent at login. Falls back to the credentials'
    /// service id.
    pub app_token: Option<String>,
    pub catalog_playlist: String,
    /// `soundQuality` requested for stream URLs
    pub sound_quality: String,
    pub request_timeout: Duration,
}

impl TidalConfig {
    /// # Errors
    ///
    /// [`TidalError::InvalidConfig`] when `api_base` is not an http(s) URL.
    pub fn new(api_base: &str) -> crate::Result<Self> {
        let mut api_base = Url::parse(api_base)
            .map_err(|e| TidalError::InvalidConfig(format!("API base '{}': {}", api_base, e)))?;
        if !matches!(api_base.scheme(), "http" | "https") || api_base.cannot_be_a_base() {
            return Err(TidalError::InvalidConfig(format!(
                "API base '{}' must be an http(s) URL",
                api_base
            )));
        }
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }

        Ok(Self {
            api_base,
            app_token: None,
            catalog_playlist: DEFAULT_CATALOG_PLAYLIST.to_string(),
            sound_quality: "LOSSLESS".to_string(),
            request_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_app_token(mut self, token: impl Into<String>) -> Self {
        self.app_token = Some(token.into());
        self
    }

    pub fn with_catalog_playlist(mut self, playlist: impl Into<String>) -> Self {
        self.catalog_playlist = playlist.into();
        self
    }

    pub fn with_sound_quality(mut self, quality: impl Into<String>) -> Self {
        self.sound_quality = quality.into();
        self
    }
}

impl Default for TidalConfig {
    fn default() -> Self {
        Self {
            api_base: Url::parse(TIDAL_API_BASE).unwrap_or_else(|_| unreachable!("constant URL")),
            app_token: None,
            catalog_playlist: DEFAULT_CATALOG_PLAYLIST.to_string(),
            sound_quality: "LOSSLESS".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// TIDAL API connector
///
/// Sessions from `/login/username` do not carry an expiry, so renewal falls
/// back to logging in again when the session manager asks for it.
///
/// # Example
///
/// ```ignore
/// use provider_tidal::{TidalConfig, TidalConnector};
///
/// let connector = TidalConnector::new(http_client, TidalConfig::default());
/// let token = connector.login(&credentials).await?;
/// let url = connector.stream_url(&token, "58990486").await?;
/// ```
pub struct TidalConnector {
    http_client: Arc<dyn HttpClient>,
    config: TidalConfig,
}

impl TidalConnector {
    pub fn new(http_client: Arc<dyn HttpClient>, config: TidalConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    pub fn config(&self) -> &TidalConfig {
        &self.config
    }

    /// API URL for the given path segments. Segments are percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> std::result::Result<String, TidalError> {
        let mut url = self.config.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| TidalError::InvalidConfig("API base cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    /// Endpoint URL with extra query parameters.
    fn endpoint_with(
        &self,
        segments: &[&str],
        params: &[(&str, &str)],
    ) -> std::result::Result<String, TidalError> {
        let mut url = Url::parse(&self.endpoint(segments)?)
            .map_err(|e| TidalError::InvalidConfig(e.to_string()))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.to_string())
    }

    /// Authenticated GET, retried on transient failures.
    async fn get(&self, token: &ServiceToken, url: String) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(HttpMethod::Get, url)
            .header(SESSION_HEADER, token.access_token.as_str())
            .header("Accept", "application/json")
            .timeout(self.config.request_timeout);
        if let Some(country) = &token.country_code {
            request = request.query("countryCode", country);
        }

        self.http_client
            .execute_with_retry(request, RetryPolicy::default())
            .await?
            .error_for_status()
    }

    fn parse<T: serde::de::DeserializeOwned>(response: &HttpResponse, what: &str) -> Result<T> {
        serde_json::from_slice(&response.body)
            .map_err(|e| TidalError::ParseError(format!("{}: {}", what, e)).into())
    }
}

#[async_trait]
impl StreamingService for TidalConnector {
    fn service_name(&self) -> &str {
        "tidal"
    }

    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    async fn login(&self, credentials: &ServiceCredentials) -> Result<ServiceToken> {
        let app_token = self
            .config
            .app_token
            .as_deref()
            .unwrap_or(&credentials.service_id);

        let request = HttpRequest::new(HttpMethod::Post, self.endpoint(&["login", "username"])?)
            .header(TOKEN_HEADER, app_token)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .timeout(self.config.request_timeout);

        let response = self.http_client.execute(request).await?.error_for_status()?;
        let login: LoginResponse = Self::parse(&response, "login response")?;
        info!(user_id = login.user_id, country = ?login.country_code, "Logged in to TIDAL");

        Ok(ServiceToken {
            access_token: login.session_id,
            user_id: login.user_id.to_string(),
            country_code: login.country_code,
            expires_at: None,
        })
    }

    #[instrument(skip_all, fields(user_id = %token.user_id))]
    async fn logout(&self, token: &ServiceToken) -> Result<()> {
        let request = HttpRequest::new(HttpMethod::Post, self.endpoint(&["logout"])?)
            .header(SESSION_HEADER, token.access_token.as_str())
            .timeout(self.config.request_timeout);
        self.http_client.execute(request).await?.error_for_status()?;
        debug!("Logged out of TIDAL");
        Ok(())
    }

    /// Unstreamable entries are kept so page offsets stay aligned; they
    /// surface as missing tracks when their stream URL is requested.
    #[instrument(skip(self, token))]
    async fn list_catalog(
        &self,
        token: &ServiceToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CatalogTrack>> {
        let (limit, offset) = (limit.to_string(), offset.to_string());
        let url = self.endpoint_with(
            &["playlists", self.config.catalog_playlist.as_str(), "tracks"],
            &[("limit", limit.as_str()), ("offset", offset.as_str())],
        )?;
        let response = self.get(token, url).await?;

        let page: TrackPage = Self::parse(&response, "playlist tracks")?;
        debug!(
            received = page.items.len(),
            total = page.total_number_of_items,
            "Catalog page received"
        );
        Ok(page.items.into_iter().map(CatalogTrack::from).collect())
    }

    #[instrument(skip(self, token))]
    async fn lookup_track(&self, token: &ServiceToken, track_id: &str) -> Result<CatalogTrack> {
        let response = self.get(token, self.endpoint(&["tracks", track_id])?).await?;
        let track: TidalTrack = Self::parse(&response, "track")?;
        if !track.is_streamable() {
            return Err(TidalError::NotStreamable {
                track_id: track_id.to_string(),
            }
            .into());
        }
        Ok(track.into())
    }

    #[instrument(skip(self, token))]
    async fn stream_url(&self, token: &ServiceToken, track_id: &str) -> Result<String> {
        let url = self.endpoint_with(
            &["tracks", track_id, "streamUrl"],
            &[("soundQuality", self.config.sound_quality.as_str())],
        )?;
        let response = self.get(token, url).await?;

        let stream: StreamUrlResponse = Self::parse(&response, "stream URL")?;
        debug!(quality = ?stream.sound_quality, "Stream URL resolved");
        Ok(stream.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::BridgeError;
    use bytes::Bytes;
    use mockall::mock;
    use std::collections::HashMap;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
        }
    }

    fn respond(status: u16, body: &str) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        })
    }

    fn token() -> ServiceToken {
        ServiceToken {
            access_token: "session-123".to_string(),
            user_id: "42".to_string(),
            country_code: Some("NO".to_string()),
            expires_at: None,
        }
    }

    fn connector(http: MockHttpClient) -> TidalConnector {
        TidalConnector::new(
            Arc::new(http),
            TidalConfig::new("https://tidal.test/v1").unwrap(),
        )
    }

    #[test]
    fn test_config_rejects_bad_base() {
        assert!(TidalConfig::new("not a url").is_err());
        assert!(TidalConfig::new("ftp://tidal.test/").is_err());
        let config = TidalConfig::new("https://tidal.test/v1").unwrap();
        assert_eq!(config.api_base.as_str(), "https://tidal.test/v1/");
    }

    #[tokio::test]
    async fn test_login_success() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.method, HttpMethod::Post);
            assert_eq!(req.url, "https://tidal.test/v1/login/username");
            assert_eq!(req.headers.get(TOKEN_HEADER).map(String::as_str), Some("app-id"));
            assert_eq!(
                req.body.as_deref(),
                Some(&b"username=listener&password=p%40ss"[..])
            );
            respond(
                200,
                r#"{"userId": 42, "sessionId": "session-123", "countryCode": "NO"}"#,
            )
        });

        let credentials = ServiceCredentials::new("app-id", "listener", "p@ss");
        let token = connector(http).login(&credentials).await.unwrap();

        assert_eq!(token.access_token, "session-123");
        assert_eq!(token.user_id, "42");
        assert_eq!(token.country_code.as_deref(), Some("NO"));
        assert!(token.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_configured_app_token_wins() {
        let mut http = MockHttpClient::new();
        http.expect_execute().returning(|req| {
            assert_eq!(req.headers.get(TOKEN_HEADER).map(String::as_str), Some("configured"));
            respond(200, r#"{"userId": 1, "sessionId": "s"}"#)
        });

        let connector = TidalConnector::new(
            Arc::new(http),
            TidalConfig::new("https://tidal.test/v1")
                .unwrap()
                .with_app_token("configured"),
        );
        let credentials = ServiceCredentials::new("ignored", "u", "p");
        assert!(connector.login(&credentials).await.is_ok());
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .returning(|_| respond(401, r#"{"status":401,"userMessage":"Invalid credentials"}"#));

        let credentials = ServiceCredentials::new("app-id", "listener", "wrong");
        let err = connector(http).login(&credentials).await.unwrap_err();
        assert!(matches!(err, BridgeError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_list_catalog_page() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|req| {
            assert!(req.url.starts_with(&format!(
                "https://tidal.test/v1/playlists/{}/tracks?",
                DEFAULT_CATALOG_PLAYLIST
            )));
            assert!(req.url.contains("limit=2"));
            assert!(req.url.contains("offset=10"));
            assert!(req.query.contains(&("countryCode".to_string(), "NO".to_string())));
            assert_eq!(req.headers.get(SESSION_HEADER).map(String::as_str), Some("session-123"));
            respond(
                200,
                r#"{"items": [
                    {"id": 1, "title": "One", "duration": 200, "audioQuality": "LOSSLESS"},
                    {"id": 2, "title": "Two", "duration": 180, "audioQuality": "HIGH",
                     "artist": {"name": "Band"}}
                ], "totalNumberOfItems": 40}"#,
            )
        });

        let tracks = connector(http).list_catalog(&token(), 2, 10).await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id, "1");
        assert_eq!(tracks[1].quality, "HIGH");
        assert_eq!(tracks[1].artist.as_deref(), Some("Band"));
    }

    #[tokio::test]
    async fn test_lookup_unstreamable_track() {
        let mut http = MockHttpClient::new();
        http.expect_execute().returning(|req| {
            assert_eq!(req.url, "https://tidal.test/v1/tracks/77");
            respond(
                200,
                r#"{"id": 77, "title": "Locked", "duration": 100, "streamReady": false}"#,
            )
        });

        let err = connector(http).lookup_track(&token(), "77").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stream_url() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|req| {
            assert!(req
                .url
                .starts_with("https://tidal.test/v1/tracks/58990486/streamUrl?soundQuality=LOSSLESS"));
            respond(
                200,
                r#"{"url": "https://cdn.tidal.test/58990486.flac?token=abc", "soundQuality": "LOSSLESS"}"#,
            )
        });

        let url = connector(http).stream_url(&token(), "58990486").await.unwrap();
        assert_eq!(url, "https://cdn.tidal.test/58990486.flac?token=abc");
    }

    #[tokio::test]
    async fn test_missing_track_is_not_found() {
        let mut http = MockHttpClient::new();
        http.expect_execute().returning(|_| respond(404, "not found"));

        let err = connector(http).stream_url(&token(), "1").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_garbage_body_is_parse_error() {
        let mut http = MockHttpClient::new();
        http.expect_execute().returning(|_| respond(200, "<html>"));

        let err = connector(http).stream_url(&token(), "1").await.unwrap_err();
        assert!(matches!(err, BridgeError::OperationFailed(_)));
    }

    #[tokio::test]
    async fn test_logout() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.url, "https://tidal.test/v1/logout");
            respond(204, "")
        });

        assert!(connector(http).logout(&token()).await.is_ok());
    }
}
