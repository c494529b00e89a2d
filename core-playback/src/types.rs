//! # Playback Domain Types
//!
//! Tracks, playback sessions and the records a run produces.

use bridge_traits::{CatalogTrack, DeviceRole, StreamItem, TransmissionMode};
use chrono::{DateTime, Utc};
use core_devices::DroppedDevice;
use core_session::StreamUri;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PlaybackError, Result};

/// Serialize `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

// ============================================================================
// Tracks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Service quality tier
    pub quality: String,
}

impl Track {
    /// Bind the track to a resolved URI for the sender.
    pub fn stream_item(&self, uri: &StreamUri) -> StreamItem {
        StreamItem {
            track_id: self.id.clone(),
            uri: uri.as_str().to_string(),
            title: self.display_title(),
            duration: self.duration,
        }
    }

    pub fn display_title(&self) -> String {
        match &self.artist {
            Some(artist) => format!("{} - {}", artist, self.title),
            None => self.title.clone(),
        }
    }
}

impl From<CatalogTrack> for Track {
    fn from(track: CatalogTrack) -> Self {
        Self {
            id: track.id,
            title: track.title,
            artist: track.artist,
            duration: track.duration,
            quality: track.quality,
        }
    }
}

/// Non-empty, ordered list of tracks for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackList {
    /// Revision of the canonical list, `None` for queried lists
    version: Option<String>,
    tracks: Vec<Track>,
}

impl TrackList {
    pub fn new(tracks: Vec<Track>, version: Option<String>) -> Result<Self> {
        if tracks.is_empty() {
            return Err(PlaybackError::EmptyTrackList);
        }
        Ok(Self { version, tracks })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    // Never empty, but clippy expects the pair
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|t| t.id.as_str()).collect()
    }
}

// ============================================================================
// Run clock
// ============================================================================

/// Shared time base of a run: offsets from the run start and the global
/// sequence numbers that order records.
#[derive(Clone)]
pub struct RunClock {
    started: Instant,
    wall_start: DateTime<Utc>,
    seq: Arc<AtomicU64>,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            wall_start: Utc::now(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn offset(&self) -> Duration {
        self.offset_at(Instant::now())
    }

    pub fn offset_at(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.started)
    }

    /// Wall time matching an offset.
    pub fn timestamp(&self, offset: Duration) -> DateTime<Utc> {
        self.wall_start + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl fmt::Debug for RunClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunClock")
            .field("elapsed", &self.offset())
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// Playback sessions
// ============================================================================

/// One track bound to the sender, shared read-only with the monitors.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub id: u64,
    pub track: Track,
    /// Track queued behind this one, if any
    pub next_track: Option<Track>,
    pub mode: TransmissionMode,
    /// Ids of the devices taking part
    pub participants: Vec<String>,
    pub started_at: Instant,
    pub start_offset: Duration,
}

impl PlaybackSession {
    pub fn is_participant(&self, device_id: &str) -> bool {
        self.participants.iter().any(|p| p == device_id)
    }

    /// Expected duration of a track this session may be rendering.
    pub fn duration_of(&self, track_id: &str) -> Option<Duration> {
        if self.track.id == track_id {
            return Some(self.track.duration);
        }
        self.next_track
            .as_ref()
            .filter(|next| next.id == track_id)
            .map(|next| next.duration)
    }
}

/// Closed-or-open session as kept in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: u64,
    pub track_id: String,
    pub mode: TransmissionMode,
    pub participants: Vec<String>,
    #[serde(with = "duration_ms")]
    pub start_offset: Duration,
    #[serde(with = "option_duration_ms")]
    pub end_offset: Option<Duration>,
    pub outcome: Option<String>,
}

impl SessionRecord {
    pub fn opened(session: &PlaybackSession) -> Self {
        Self {
            id: session.id,
            track_id: session.track.id.clone(),
            mode: session.mode,
            participants: session.participants.clone(),
            start_offset: session.start_offset,
            end_offset: None,
            outcome: None,
        }
    }

    pub fn is_participant(&self, device_id: &str) -> bool {
        self.participants.iter().any(|p| p == device_id)
    }
}

// ============================================================================
// Dropouts and faults
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Short gap, reported as a warning
    Glitch,
    /// Gap at or above the stall threshold; fails the run
    Stall,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Glitch => write!(f, "Glitch"),
            Severity::Stall => write!(f, "Stall"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropoutCause {
    /// Position advanced less than wall time
    PositionDeficit,
    Buffering,
    ErrorState,
    /// Control queries failed
    Unreachable,
}

impl fmt::Display for DropoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropoutCause::PositionDeficit => write!(f, "position deficit"),
            DropoutCause::Buffering => write!(f, "buffering"),
            DropoutCause::ErrorState => write!(f, "error state"),
            DropoutCause::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropoutEvent {
    pub seq: u64,
    pub device_id: String,
    pub device_label: String,
    pub role: DeviceRole,
    pub session: u64,
    pub track_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub offset: Duration,
    #[serde(with = "duration_ms")]
    pub gap: Duration,
    pub severity: Severity,
    pub cause: DropoutCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFaultKind {
    /// Error state outlasted the recovery window
    PersistentError,
    Unreachable,
}

impl fmt::Display for DeviceFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFaultKind::PersistentError => write!(f, "persistent error"),
            DeviceFaultKind::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFault {
    pub seq: u64,
    pub device_id: String,
    pub role: DeviceRole,
    pub kind: DeviceFaultKind,
    pub session: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub offset: Duration,
    /// How long the condition had lasted when reported
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

// ============================================================================
// Track outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum TrackOutcome {
    Completed {
        session: u64,
        track_id: String,
        #[serde(with = "duration_ms")]
        played: Duration,
    },
    /// Not offered by the service; never reached the sender
    Skipped { track_id: String, reason: String },
    Aborted {
        session: u64,
        track_id: String,
        reason: String,
    },
    Cancelled { session: u64, track_id: String },
}

impl TrackOutcome {
    pub fn track_id(&self) -> &str {
        match self {
            TrackOutcome::Completed { track_id, .. }
            | TrackOutcome::Skipped { track_id, .. }
            | TrackOutcome::Aborted { track_id, .. }
            | TrackOutcome::Cancelled { track_id, .. } => track_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TrackOutcome::Completed { .. })
    }

    /// Short label stored on the closed session.
    pub fn label(&self) -> &'static str {
        match self {
            TrackOutcome::Completed { .. } => "completed",
            TrackOutcome::Skipped { .. } => "skipped",
            TrackOutcome::Aborted { .. } => "aborted",
            TrackOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

// ============================================================================
// Record queue
// ============================================================================

/// Everything the aggregator learns while the run is in progress.
#[derive(Debug, Clone)]
pub enum RunRecord {
    Dropout(DropoutEvent),
    Fault(DeviceFault),
    SessionOpened(SessionRecord),
    SessionClosed {
        id: u64,
        end_offset: Duration,
        outcome: String,
    },
}

/// Producer side of the run's record queue.
#[derive(Clone)]
pub struct RecordSink {
    tx: tokio::sync::mpsc::UnboundedSender<RunRecord>,
    clock: RunClock,
}

impl RecordSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<RunRecord>, clock: RunClock) -> Self {
        Self { tx, clock }
    }

    pub fn clock(&self) -> &RunClock {
        &self.clock
    }

    /// Queue a record. Returns `false` once the aggregator has finalized.
    pub fn send(&self, record: RunRecord) -> bool {
        self.tx.send(record).is_ok()
    }

    /// Record a device that left the run before the first track as an
    /// unreachable fault.
    pub fn device_dropped(&self, device: &DroppedDevice) -> bool {
        let offset = self.clock.offset();
        self.send(RunRecord::Fault(DeviceFault {
            seq: self.clock.next_seq(),
            device_id: device.identifier.clone(),
            role: device.role,
            kind: DeviceFaultKind::Unreachable,
            session: None,
            timestamp: self.clock.timestamp(offset),
            offset,
            elapsed: Duration::ZERO,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, secs: u64) -> Track {
        Track {
            id: id.to_string(),
            title: format!("Song {}", id),
            artist: Some("Band".to_string()),
            duration: Duration::from_secs(secs),
            quality: "LOSSLESS".to_string(),
        }
    }

    #[test]
    fn test_track_list_rejects_empty() {
        assert!(matches!(
            TrackList::new(Vec::new(), None),
            Err(PlaybackError::EmptyTrackList)
        ));
        let list = TrackList::new(vec![track("1", 10)], Some("v1".into())).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.version(), Some("v1"));
    }

    #[test]
    fn test_session_duration_lookup() {
        let session = PlaybackSession {
            id: 1,
            track: track("a", 30),
            next_track: Some(track("b", 45)),
            mode: TransmissionMode::Unicast,
            participants: vec!["sender".to_string()],
            started_at: Instant::now(),
            start_offset: Duration::ZERO,
        };

        assert_eq!(session.duration_of("a"), Some(Duration::from_secs(30)));
        assert_eq!(session.duration_of("b"), Some(Duration::from_secs(45)));
        assert_eq!(session.duration_of("c"), None);
        assert!(session.is_participant("sender"));
        assert!(!session.is_participant("slave"));
    }

    #[test]
    fn test_stream_item_carries_display_title() {
        let item = track("7", 200).stream_item(&StreamUri::new("https://cdn/7.flac"));
        assert_eq!(item.title, "Band - Song 7");
        assert_eq!(item.uri, "https://cdn/7.flac");
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let outcome = TrackOutcome::Completed {
            session: 3,
            track_id: "9".to_string(),
            played: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "Completed");
        assert_eq!(json["played"], 1500);
    }

    #[tokio::test]
    async fn test_dropped_device_becomes_unreachable_fault() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = RecordSink::new(tx, RunClock::start());
        assert!(sink.device_dropped(&DroppedDevice {
            identifier: "10.0.0.9".to_string(),
            role: DeviceRole::Repeater,
            reason: "connection refused".to_string(),
        }));

        match rx.try_recv().unwrap() {
            RunRecord::Fault(fault) => {
                assert_eq!(fault.device_id, "10.0.0.9");
                assert_eq!(fault.role, DeviceRole::Repeater);
                assert_eq!(fault.kind, DeviceFaultKind::Unreachable);
                assert_eq!(fault.session, None);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_clock_sequence_is_monotonic() {
        let clock = RunClock::start();
        let a = clock.next_seq();
        let b = clock.clone().next_seq();
        assert!(b > a);
    }
}
