//! # Event Bus System
//!
//! Typed broadcast of what happens during a soak run, built on
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: one enum per domain (session, playback, device, run)
//! - **EventBus**: cloneable broadcast handle for publishing
//!
//! Events on the bus are notifications. The authoritative dropout record is
//! the monitor's ordered queue; a subscriber that lags here loses nothing
//! from the report.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   emit   ┌───────────┐
//! │ SessionManager ├─────────>│           │
//! └────────────────┘          │           │  subscribe  ┌──────────────────┐
//! ┌────────────────┐   emit   │ EventBus  ├────────────>│ embedding host   │
//! │ PlaybackDriver ├─────────>│           │             │ (progress, UI)   │
//! └────────────────┘          │           │             └──────────────────┘
//! ┌────────────────┐   emit   │           │
//! │ DropoutMonitor ├─────────>│           │
//! └────────────────┘          └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, DeviceEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(64);
//! let mut events = bus.subscribe();
//!
//! bus.emit(CoreEvent::Device(DeviceEvent::Unreachable {
//!     device: "repeater".to_string(),
//!     role: "repeater".to_string(),
//! }))
//! .ok();
//!
//! assert!(matches!(
//!     events.recv().await,
//!     Ok(CoreEvent::Device(DeviceEvent::Unreachable { .. }))
//! ));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; keep going.
//! - **`RecvError::Closed`**: every sender is gone; the run is over.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// A monitor emits at most one event per device per poll, so a few hundred
/// slots cover several seconds of a stalled subscriber.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Streaming service session lifecycle
    Session(SessionEvent),
    /// Track sequencing by the playback driver
    Playback(PlaybackEvent),
    /// Device connectivity and health
    Device(DeviceEvent),
    /// Run-level state changes
    Run(RunEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Session(e) => e.description(),
            CoreEvent::Playback(e) => e.description(),
            CoreEvent::Device(e) => e.description(),
            CoreEvent::Run(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Session(SessionEvent::AuthError { .. }) => EventSeverity::Error,
            CoreEvent::Device(DeviceEvent::Unreachable { .. }) => EventSeverity::Error,
            CoreEvent::Device(DeviceEvent::PersistentError { .. }) => EventSeverity::Error,
            CoreEvent::Device(DeviceEvent::Dropout { stall: true, .. }) => EventSeverity::Warning,
            CoreEvent::Playback(PlaybackEvent::TrackAborted { .. }) => EventSeverity::Warning,
            CoreEvent::Playback(PlaybackEvent::TrackSkipped { .. }) => EventSeverity::Warning,
            CoreEvent::Device(DeviceEvent::Dropout { stall: false, .. }) => EventSeverity::Info,
            CoreEvent::Session(SessionEvent::Authenticated { .. }) => EventSeverity::Info,
            CoreEvent::Run(RunEvent::Finished { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Session Events
// ============================================================================

/// Events related to the streaming service session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    /// Login in progress.
    Authenticating {
        /// Service name (e.g. "tidal").
        service: String,
    },
    /// Login succeeded.
    Authenticated {
        service: String,
        /// Local identifier of the session, not the service token.
        session_id: String,
    },
    /// Token renewal started.
    TokenRenewing { session_id: String },
    /// Token renewal completed.
    TokenRenewed {
        session_id: String,
        /// New expiry (Unix epoch seconds), if the service reports one.
        expires_at: Option<i64>,
    },
    /// Login or renewal failed.
    AuthError {
        service: String,
        message: String,
        /// Whether a retry could succeed (transport problem vs. bad credentials).
        recoverable: bool,
    },
    /// Session logged out and released.
    Released { session_id: String },
}

impl SessionEvent {
    fn description(&self) -> &str {
        match self {
            SessionEvent::Authenticating { .. } => "Authenticating with streaming service",
            SessionEvent::Authenticated { .. } => "Streaming session established",
            SessionEvent::TokenRenewing { .. } => "Renewing session token",
            SessionEvent::TokenRenewed { .. } => "Session token renewed",
            SessionEvent::AuthError { .. } => "Streaming service authentication error",
            SessionEvent::Released { .. } => "Streaming session released",
        }
    }
}

// ============================================================================
// Playback Events
// ============================================================================

/// Events emitted by the playback driver as it walks the track list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaybackEvent {
    /// A playback session opened on the sender.
    TrackStarted {
        session: u64,
        track_id: String,
        title: String,
        /// Transmission mode in effect ("unicast" / "multicast").
        mode: String,
    },
    /// The sender finished the track.
    TrackCompleted {
        session: u64,
        track_id: String,
        /// Wall time the session was open (milliseconds).
        played_ms: u64,
    },
    /// The track could not be resolved and was not played.
    TrackSkipped { track_id: String, reason: String },
    /// The track was cut short by a device or command failure.
    TrackAborted {
        session: u64,
        track_id: String,
        reason: String,
    },
    /// The track was interrupted by cancellation of the run.
    TrackCancelled { session: u64, track_id: String },
}

impl PlaybackEvent {
    fn description(&self) -> &str {
        match self {
            PlaybackEvent::TrackStarted { .. } => "Track started",
            PlaybackEvent::TrackCompleted { .. } => "Track completed",
            PlaybackEvent::TrackSkipped { .. } => "Track skipped",
            PlaybackEvent::TrackAborted { .. } => "Track aborted",
            PlaybackEvent::TrackCancelled { .. } => "Track cancelled",
        }
    }
}

// ============================================================================
// Device Events
// ============================================================================

/// Events about individual devices in the topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DeviceEvent {
    /// Device resolved and answering.
    Connected {
        device: String,
        role: String,
        address: String,
    },
    /// Audible discontinuity detected.
    Dropout {
        device: String,
        session: u64,
        /// Estimated silence (milliseconds).
        gap_ms: u64,
        /// Whether the gap crossed the stall threshold.
        stall: bool,
    },
    /// Device sat in the error state longer than the recovery window.
    PersistentError {
        device: String,
        role: String,
        /// How long the error had lasted when reported (milliseconds).
        elapsed_ms: u64,
    },
    /// Device stopped answering control queries.
    Unreachable { device: String, role: String },
    /// Device returned to idle at teardown.
    Released { device: String },
}

impl DeviceEvent {
    fn description(&self) -> &str {
        match self {
            DeviceEvent::Connected { .. } => "Device connected",
            DeviceEvent::Dropout { stall: true, .. } => "Playback stall detected",
            DeviceEvent::Dropout { stall: false, .. } => "Playback glitch detected",
            DeviceEvent::PersistentError { .. } => "Device error persisted",
            DeviceEvent::Unreachable { .. } => "Device unreachable",
            DeviceEvent::Released { .. } => "Device released",
        }
    }

    /// Name of the device the event is about.
    pub fn device(&self) -> &str {
        match self {
            DeviceEvent::Connected { device, .. }
            | DeviceEvent::Dropout { device, .. }
            | DeviceEvent::PersistentError { device, .. }
            | DeviceEvent::Unreachable { device, .. }
            | DeviceEvent::Released { device } => device,
        }
    }
}

// ============================================================================
// Run Events
// ============================================================================

/// Run-level lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum RunEvent {
    /// Duration controller changed state ("Running", "Stopping", "Stopped").
    StateChanged { state: String, reason: Option<String> },
    /// Final verdict computed.
    Finished {
        verdict: String,
        dropouts: usize,
        tracks_played: usize,
    },
}

impl RunEvent {
    fn description(&self) -> &str {
        match self {
            RunEvent::StateChanged { .. } => "Run state changed",
            RunEvent::Finished { .. } => "Run finished",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// when nobody is listening. Publishers treat the latter as normal.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dropout(device: &str, stall: bool) -> CoreEvent {
        CoreEvent::Device(DeviceEvent::Dropout {
            device: device.to_string(),
            session: 1,
            gap_ms: if stall { 2000 } else { 300 },
            stall,
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        let event = CoreEvent::Session(SessionEvent::Released {
            session_id: "s-1".to_string(),
        });

        assert!(bus.emit(event).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = CoreEvent::Playback(PlaybackEvent::TrackStarted {
            session: 3,
            track_id: "58990486".to_string(),
            title: "Opening".to_string(),
            mode: "multicast".to_string(),
        });

        assert_eq!(bus.emit(event.clone()).unwrap(), 2);
        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(CoreEvent::Session(SessionEvent::TokenRenewed {
                session_id: "s-1".to_string(),
                expires_at: Some(1_700_000_000 + i),
            }))
            .ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let auth_error = CoreEvent::Session(SessionEvent::AuthError {
            service: "tidal".to_string(),
            message: "bad password".to_string(),
            recoverable: false,
        });
        assert_eq!(auth_error.severity(), EventSeverity::Error);
        assert_eq!(dropout("repeater", true).severity(), EventSeverity::Warning);
        assert_eq!(dropout("repeater", false).severity(), EventSeverity::Info);

        let state = CoreEvent::Run(RunEvent::StateChanged {
            state: "Stopping".to_string(),
            reason: Some("elapsed".to_string()),
        });
        assert_eq!(state.severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_description() {
        assert_eq!(dropout("sender", true).description(), "Playback stall detected");
        assert_eq!(dropout("sender", false).description(), "Playback glitch detected");
    }

    #[test]
    fn test_device_event_names_device() {
        let event = DeviceEvent::PersistentError {
            device: "slave(10.0.0.7)".to_string(),
            role: "slave".to_string(),
            elapsed_ms: 5_000,
        };
        assert_eq!(event.device(), "slave(10.0.0.7)");
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();

        let handles: Vec<_> = ["sender", "repeater"]
            .into_iter()
            .map(|device| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        bus.emit(dropout(device, false)).ok();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.ok();
        }

        let mut count = 0;
        while sub.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Run(RunEvent::Finished {
            verdict: "Fail".to_string(),
            dropouts: 1,
            tracks_played: 5,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Run\""));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_try_recv_empty() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe();

        assert!(matches!(
            sub.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
