//! OpenHome device control
//!
//! An [`OpenHomeDevice`] drives one renderer through its `Playlist`, `Time`,
//! `Sender`, `Receiver` and `Config` services. Every call is a SOAP POST to
//! the service's control URL, derived from the device base URL and a path
//! template (`/{service}/control` unless the resolver says otherwise).
//!
//! The playlist hands out numeric ids for inserted items. The device keeps a
//! map from those ids back to catalog track ids, so `stream_position` can say
//! which track is playing.

use async_trait::async_trait;
use bridge_traits::{
    DeviceControl, HttpClient, HttpMethod, HttpRequest, PlaybackState, RetryPolicy, SenderInfo,
    StreamItem, StreamPosition, TransmissionMode,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::error::{OpenHomeError, Result};
use crate::soap::{self, SoapAction};

/// Default control URL layout, relative to the device base URL.
pub const DEFAULT_PATH_TEMPLATE: &str = "/{service}/control";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const PLAYLIST: &str = "Playlist";
const TIME: &str = "Time";
const SENDER: &str = "Sender";
const RECEIVER: &str = "Receiver";
const CONFIG: &str = "Config";

#[derive(Debug, Default)]
struct PlaylistState {
    /// Playlist id -> catalog track id
    ids: HashMap<u32, String>,
    queued: Option<u32>,
    /// Listening to another device through `Receiver`
    following: bool,
}

pub struct OpenHomeDevice {
    name: String,
    base: Url,
    path_template: String,
    timeout: Duration,
    http: Arc<dyn HttpClient>,
    state: Mutex<PlaylistState>,
}

impl OpenHomeDevice {
    pub fn new(name: impl Into<String>, base: Url, http: Arc<dyn HttpClient>) -> Self {
        Self {
            name: name.into(),
            base,
            path_template: DEFAULT_PATH_TEMPLATE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            http,
            state: Mutex::new(PlaylistState::default()),
        }
    }

    pub fn with_path_template(mut self, template: impl Into<String>) -> Self {
        self.path_template = template.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn control_url(&self, service: &str) -> Result<Url> {
        let path = self.path_template.replace("{service}", service);
        self.base
            .join(&path)
            .map_err(|e| OpenHomeError::InvalidAddress(format!("{}{}: {}", self.base, path, e)))
    }

    fn is_following(&self) -> bool {
        self.state.lock().following
    }

    // ------------------------------------------------------------------------
    // SOAP plumbing
    // ------------------------------------------------------------------------

    async fn invoke(
        &self,
        service: &str,
        action: &str,
        args: &[(&str, &str)],
        policy: RetryPolicy,
    ) -> Result<HashMap<String, String>> {
        let call = SoapAction::new(service, action, args);
        let request = HttpRequest::new(HttpMethod::Post, self.control_url(service)?.as_str())
            .header("SOAPACTION", call.header())
            .xml(call.envelope())
            .timeout(self.timeout);

        trace!(device = %self.name, service, action, "SOAP call");
        let response = self.http.execute_with_retry(request, policy).await?;

        // UPnP faults come back as HTTP 500 with a SOAP body
        if !response.is_success() {
            let body = String::from_utf8_lossy(&response.body).into_owned();
            if let Some((code, description)) = soap::parse_fault(&body) {
                return Err(OpenHomeError::Fault {
                    service: service.to_string(),
                    action: action.to_string(),
                    code,
                    description,
                });
            }
            response.error_for_status()?;
            return Err(OpenHomeError::MalformedResponse(format!(
                "{}.{} returned no body",
                service, action
            )));
        }

        soap::parse_response(&response.text()?, action)
    }

    /// Commands are retried, polls are not.
    async fn command(
        &self,
        service: &str,
        action: &str,
        args: &[(&str, &str)],
    ) -> Result<HashMap<String, String>> {
        self.invoke(service, action, args, RetryPolicy::default())
            .await
    }

    async fn query(&self, service: &str, action: &str) -> Result<HashMap<String, String>> {
        self.invoke(service, action, &[], RetryPolicy::no_retry())
            .await
    }

    async fn query_value(&self, service: &str, action: &str, field: &str) -> Result<String> {
        let mut out = self.query(service, action).await?;
        out.remove(field).ok_or_else(|| {
            OpenHomeError::MalformedResponse(format!("{}.{} has no {}", service, action, field))
        })
    }

    async fn current_id(&self) -> Result<u32> {
        let value = self.query_value(PLAYLIST, "Id", "Value").await?;
        parse_number(PLAYLIST, "Id", &value)
    }

    /// Insert `item` after playlist id `after` and remember its id.
    async fn insert(&self, after: u32, item: &StreamItem) -> Result<u32> {
        let after = after.to_string();
        let metadata = soap::didl_lite(item);
        let out = self
            .command(
                PLAYLIST,
                "Insert",
                &[
                    ("AfterId", after.as_str()),
                    ("Uri", item.uri.as_str()),
                    ("Metadata", metadata.as_str()),
                ],
            )
            .await?;

        let new_id = out
            .get("NewId")
            .ok_or_else(|| OpenHomeError::MalformedResponse("Insert returned no NewId".into()))
            .and_then(|id| parse_number(PLAYLIST, "Insert", id))?;

        self.state.lock().ids.insert(new_id, item.track_id.clone());
        Ok(new_id)
    }
}

fn parse_number(service: &str, action: &str, value: &str) -> Result<u32> {
    value.trim().parse().map_err(|_| {
        OpenHomeError::MalformedResponse(format!(
            "{}.{} returned non-numeric '{}'",
            service, action, value
        ))
    })
}

fn parse_transport_state(value: &str) -> PlaybackState {
    match value.trim() {
        "Playing" => PlaybackState::Playing,
        "Paused" | "Stopped" => PlaybackState::Stopped,
        "Buffering" | "Waiting" => PlaybackState::Buffering,
        _ => PlaybackState::Error,
    }
}

#[async_trait]
impl DeviceControl for OpenHomeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        self.base.as_str()
    }

    async fn playback_state(&self) -> bridge_traits::Result<PlaybackState> {
        let service = if self.is_following() { RECEIVER } else { PLAYLIST };
        let value = self.query_value(service, "TransportState", "Value").await?;
        Ok(parse_transport_state(&value))
    }

    async fn stream_position(&self) -> bridge_traits::Result<StreamPosition> {
        let seconds = self.query_value(TIME, "Time", "Seconds").await?;
        let offset = Duration::from_secs(u64::from(parse_number(TIME, "Time", &seconds)?));

        if self.is_following() {
            return Ok(StreamPosition::new(None, offset));
        }

        let id = self.current_id().await?;
        let track_id = self.state.lock().ids.get(&id).cloned();
        Ok(StreamPosition::new(track_id, offset))
    }

    #[instrument(skip(self, item), fields(device = %self.name, track = %item.track_id))]
    async fn play(&self, item: &StreamItem) -> bridge_traits::Result<()> {
        self.command(PLAYLIST, "DeleteAll", &[]).await?;
        {
            let mut state = self.state.lock();
            state.ids.clear();
            state.queued = None;
            state.following = false;
        }

        let id = self.insert(0, item).await?;
        let id = id.to_string();
        self.command(PLAYLIST, "SeekId", &[("Value", id.as_str())])
            .await?;
        self.command(PLAYLIST, "Play", &[]).await?;
        debug!(playlist_id = %id, "Playback started");
        Ok(())
    }

    #[instrument(skip(self, item), fields(device = %self.name, track = %item.track_id))]
    async fn queue_next(&self, item: &StreamItem) -> bridge_traits::Result<()> {
        let current = self.current_id().await?;

        let stale = self.state.lock().queued.filter(|queued| *queued != current);
        if let Some(stale) = stale {
            let stale = stale.to_string();
            self.command(PLAYLIST, "DeleteId", &[("Value", stale.as_str())])
                .await?;
        }

        let id = self.insert(current, item).await?;
        let mut state = self.state.lock();
        // Keep only what can still be reported as playing
        state.ids.retain(|known, _| *known == current || *known == id);
        state.queued = Some(id);
        Ok(())
    }

    async fn stop(&self) -> bridge_traits::Result<()> {
        let service = if self.is_following() { RECEIVER } else { PLAYLIST };
        self.command(service, "Stop", &[]).await?;
        Ok(())
    }

    async fn configure_sender(&self, mode: TransmissionMode) -> bridge_traits::Result<()> {
        let value = match mode {
            TransmissionMode::Unicast => "Unicast",
            TransmissionMode::Multicast => "Multicast",
        };
        self.command(CONFIG, "SetValue", &[("Key", "Sender.Mode"), ("Value", value)])
            .await?;
        debug!(device = %self.name, %mode, "Sender mode configured");
        Ok(())
    }

    async fn sender_info(&self) -> bridge_traits::Result<SenderInfo> {
        let metadata = self.query_value(SENDER, "Metadata", "Value").await?;
        let uri = soap::didl_resource(&metadata).ok_or_else(|| {
            OpenHomeError::MalformedResponse(format!("{} publishes no sender uri", self.name))
        })?;
        Ok(SenderInfo { uri, metadata })
    }

    #[instrument(skip(self, sender), fields(device = %self.name, sender = %sender.uri))]
    async fn join_sender(&self, sender: &SenderInfo) -> bridge_traits::Result<()> {
        self.command(
            RECEIVER,
            "SetSender",
            &[("Uri", sender.uri.as_str()), ("Metadata", sender.metadata.as_str())],
        )
        .await?;
        self.command(RECEIVER, "Play", &[]).await?;
        self.state.lock().following = true;
        Ok(())
    }

    async fn release(&self) -> bridge_traits::Result<()> {
        if self.is_following() {
            self.command(RECEIVER, "Stop", &[]).await?;
            self.state.lock().following = false;
        } else {
            self.command(PLAYLIST, "Stop", &[]).await?;
            self.command(PLAYLIST, "DeleteAll", &[]).await?;
        }
        let mut state = self.state.lock();
        state.ids.clear();
        state.queued = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_states() {
        assert_eq!(parse_transport_state("Playing"), PlaybackState::Playing);
        assert_eq!(parse_transport_state("Paused"), PlaybackState::Stopped);
        assert_eq!(parse_transport_state("Waiting"), PlaybackState::Buffering);
        assert_eq!(parse_transport_state("Buffering"), PlaybackState::Buffering);
        assert_eq!(parse_transport_state("Exploded"), PlaybackState::Error);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(TIME, "Time", " 42 ").unwrap(), 42);
        assert!(matches!(
            parse_number(TIME, "Time", "soon"),
            Err(OpenHomeError::MalformedResponse(_))
        ));
    }
}
