//! # Playback & Dropout Monitoring
//!
//! Drives a track list through the device topology and watches every
//! participating device for interruptions.
//!
//! ## Overview
//!
//! This crate handles:
//! - Track selection (canonical list or diversified catalog query)
//! - The playback driver: one session per track, gapless queueing
//! - Per-device dropout monitors polling on a fixed interval
//! - Run duration control and cancellation
//! - Result aggregation into a verdict and report
//!
//! ## Data flow
//!
//! ```text
//! PlaybackDriver ──watch<PlaybackSession>──▶ DropoutMonitor (one task per device)
//!       │                                          │
//!       └────────── RecordSink (mpsc) ◀────────────┘
//!                         │
//!                         ▼
//!                 ResultAggregator ──▶ TestRunResult
//! ```

pub mod driver;
pub mod duration;
pub mod error;
pub mod monitor;
pub mod report;
pub mod tracks;
pub mod types;

pub use driver::{PlaybackDriver, StreamResolver, TrackSequence};
pub use duration::{ControllerState, DurationController, StopReason};
pub use error::{PlaybackError, Result};
pub use monitor::{DeviceTracker, DropoutMonitor, Finding, MonitorSet, Sample};
pub use report::{ResultAggregator, TestRunResult, Verdict, Warning};
pub use tracks::{canonical_tracks, CatalogSource, TrackSelector, CANONICAL_VERSION};
pub use types::{
    DeviceFault, DeviceFaultKind, DropoutCause, DropoutEvent, PlaybackSession, RecordSink,
    RunClock, RunRecord, SessionRecord, Severity, Track, TrackList, TrackOutcome,
};
