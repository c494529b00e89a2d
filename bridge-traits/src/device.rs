//! Device Control Abstraction
//!
//! Contract for the networked audio devices taking part in a run. A device
//! can originate a stream (Sender), relay one (Repeater) or only render one
//! (Slave); all of them are driven and observed through [`DeviceControl`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Position of a device in the distribution topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Sender,
    Repeater,
    Slave,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Sender => write!(f, "sender"),
            DeviceRole::Repeater => write!(f, "repeater"),
            DeviceRole::Slave => write!(f, "slave"),
        }
    }
}

/// Transport state as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackState {
    Playing,
    Stopped,
    Buffering,
    Error,
}

impl PlaybackState {
    /// States that count as an interruption while a track is supposed to play.
    pub fn is_impaired(&self) -> bool {
        matches!(self, PlaybackState::Buffering | PlaybackState::Error)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Playing => write!(f, "Playing"),
            PlaybackState::Stopped => write!(f, "Stopped"),
            PlaybackState::Buffering => write!(f, "Buffering"),
            PlaybackState::Error => write!(f, "Error"),
        }
    }
}

/// How a distributing device fans its stream out to receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    /// One point-to-point stream per receiver
    Unicast,
    /// One group-addressed stream shared by all receivers
    Multicast,
}

impl fmt::Display for TransmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmissionMode::Unicast => write!(f, "unicast"),
            TransmissionMode::Multicast => write!(f, "multicast"),
        }
    }
}

impl FromStr for TransmissionMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unicast" => Ok(TransmissionMode::Unicast),
            "multicast" => Ok(TransmissionMode::Multicast),
            other => Err(BridgeError::OperationFailed(format!(
                "unknown transmission mode '{}', expected 'unicast' or 'multicast'",
                other
            ))),
        }
    }
}

/// A resolved, playable stream handed to a Sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamItem {
    pub track_id: String,
    pub uri: String,
    pub title: String,
    pub duration: Duration,
}

/// Where the device is within the stream it is rendering.
///
/// `track_id` is only known to devices that were handed the item themselves;
/// receivers following a sender usually report `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamPosition {
    pub track_id: Option<String>,
    pub offset: Duration,
}

impl StreamPosition {
    pub fn new(track_id: Option<String>, offset: Duration) -> Self {
        Self { track_id, offset }
    }
}

/// Address a receiver subscribes to in order to follow a distributing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub uri: String,
    pub metadata: String,
}

/// Control surface of one device.
///
/// Queries (`playback_state`, `stream_position`) are issued concurrently by
/// the monitor; commands are only ever issued by the playback driver.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Human readable name, used in logs and reports
    fn name(&self) -> &str;

    /// Network address (or a synthetic one for in-process devices)
    fn address(&self) -> &str;

    /// `false` for the stand-in used when a role is not populated
    fn is_present(&self) -> bool {
        true
    }

    async fn playback_state(&self) -> Result<PlaybackState>;

    async fn stream_position(&self) -> Result<StreamPosition>;

    /// Replace whatever is playing with `item` and start playback.
    async fn play(&self, item: &StreamItem) -> Result<()>;

    /// Queue `item` to start when the current item ends, without a gap.
    async fn queue_next(&self, item: &StreamItem) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Select the fan-out mode used when this device distributes audio.
    async fn configure_sender(&self, mode: TransmissionMode) -> Result<()>;

    /// Address receivers use to follow this device.
    async fn sender_info(&self) -> Result<SenderInfo>;

    /// Start following the given distributing device.
    async fn join_sender(&self, sender: &SenderInfo) -> Result<()>;

    /// Return the device to an idle state at teardown.
    async fn release(&self) -> Result<()>;
}

/// Maps a DUT identifier onto a live device connection.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    /// # Errors
    ///
    /// [`BridgeError::Unreachable`] when the identifier does not resolve or the
    /// device does not answer.
    async fn resolve(&self, identifier: &str, role: DeviceRole) -> Result<Arc<dyn DeviceControl>>;
}
