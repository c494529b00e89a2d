//! # Soak Run Configuration
//!
//! Everything a dropout soak run needs to know before it starts.
//!
//! ## Overview
//!
//! [`SoakConfig`] is assembled with [`SoakConfigBuilder`] and validated
//! fail-fast: a run that would be meaningless (no sender, a stall threshold
//! below the position tolerance, the same DUT in two roles) is rejected
//! before any device or service is contacted.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::config::{DeviceSpec, RunDuration, SoakConfig};
//! use bridge_traits::{ServiceCredentials, TransmissionMode};
//!
//! let config = SoakConfig::builder()
//!     .sender(DeviceSpec::Local)
//!     .repeater("none".parse().unwrap())
//!     .duration(RunDuration::Forever)
//!     .mode(TransmissionMode::Multicast)
//!     .track_count(0)
//!     .credentials(ServiceCredentials::new("app-id", "listener", "secret"))
//!     .build()
//!     .unwrap();
//!
//! assert!(config.loops_tracks());
//! ```
//!
//! ## Defaults
//!
//! | Setting | Default |
//! |---------|---------|
//! | poll interval | 250 ms |
//! | position tolerance | 500 ms |
//! | stall threshold | 1 s |
//! | recovery window | 5 s |
//! | unreachable after | 3 s |
//! | completion grace | 10 s |
//! | max consecutive failures | 5 |

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{ServiceCredentials, TransmissionMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Sentinel accepted for an unpopulated Repeater or Slave role.
pub const ABSENT_DEVICE: &str = "None";

/// Identifier selecting the in-process loopback SoftPlayer.
pub const LOCAL_DEVICE: &str = "local";

/// Largest catalog-queried track list a run accepts.
pub const MAX_TRACK_COUNT: usize = 10_000;

// ============================================================================
// Device and duration specifications
// ============================================================================

/// How a topology role is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSpec {
    /// Role not populated
    Absent,
    /// In-process SoftPlayer on loopback
    Local,
    /// A networked DUT, by name or address
    Remote(String),
}

impl DeviceSpec {
    pub fn is_absent(&self) -> bool {
        matches!(self, DeviceSpec::Absent)
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Config(format!(
                "Device identifier cannot be empty. Use '{}' for an absent device or '{}' for the loopback SoftPlayer.",
                ABSENT_DEVICE, LOCAL_DEVICE
            )));
        }
        if trimmed.eq_ignore_ascii_case(ABSENT_DEVICE) {
            Ok(DeviceSpec::Absent)
        } else if trimmed.eq_ignore_ascii_case(LOCAL_DEVICE) {
            Ok(DeviceSpec::Local)
        } else {
            Ok(DeviceSpec::Remote(trimmed.to_string()))
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Absent => write!(f, "{}", ABSENT_DEVICE),
            DeviceSpec::Local => write!(f, "{}", LOCAL_DEVICE),
            DeviceSpec::Remote(id) => write!(f, "{}", id),
        }
    }
}

/// How long the run lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunDuration {
    /// Stop once this much wall time has elapsed
    Bounded(Duration),
    /// Run until cancelled
    Forever,
}

impl RunDuration {
    pub fn seconds(secs: u64) -> Self {
        RunDuration::Bounded(Duration::from_secs(secs))
    }

    pub fn is_forever(&self) -> bool {
        matches!(self, RunDuration::Forever)
    }

    /// Bounded runs of zero length play nothing.
    pub fn is_zero(&self) -> bool {
        matches!(self, RunDuration::Bounded(d) if d.is_zero())
    }

    pub fn limit(&self) -> Option<Duration> {
        match self {
            RunDuration::Bounded(d) => Some(*d),
            RunDuration::Forever => None,
        }
    }
}

impl FromStr for RunDuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("forever") {
            return Ok(RunDuration::Forever);
        }
        trimmed
            .parse::<u64>()
            .map(RunDuration::seconds)
            .map_err(|_| {
                Error::Config(format!(
                    "Invalid duration '{}'. Use a whole number of seconds or 'forever'.",
                    trimmed
                ))
            })
    }
}

impl fmt::Display for RunDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunDuration::Bounded(d) => write!(f, "{}s", d.as_secs()),
            RunDuration::Forever => write!(f, "forever"),
        }
    }
}

// ============================================================================
// Dropout detection policy
// ============================================================================

/// Thresholds used by the dropout monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropoutPolicy {
    /// Interval between health samples on each device.
    ///
    /// Default: 250 ms.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Position may lag wall time by this much between samples without
    /// counting as a dropout. Covers device clock granularity.
    ///
    /// Default: 500 ms.
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: Duration,

    /// Gaps at or above this are stalls; shorter ones are glitches.
    ///
    /// Default: 1 s.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: Duration,

    /// An error state lasting longer than this fails the run.
    ///
    /// Default: 5 s.
    #[serde(default = "default_recovery_window")]
    pub recovery_window: Duration,

    /// Control queries failing for this long mark the device unreachable.
    ///
    /// Default: 3 s.
    #[serde(default = "default_unreachable_after")]
    pub unreachable_after: Duration,
}

impl Default for DropoutPolicy {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            position_tolerance: default_position_tolerance(),
            stall_threshold: default_stall_threshold(),
            recovery_window: default_recovery_window(),
            unreachable_after: default_unreachable_after(),
        }
    }
}

impl DropoutPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "Poll interval must be greater than 0ms".to_string(),
            ));
        }
        if self.poll_interval > Duration::from_secs(10) {
            return Err(Error::Config(
                "Poll interval exceeds 10s; dropouts shorter than the interval would go unseen"
                    .to_string(),
            ));
        }
        if self.stall_threshold <= self.position_tolerance {
            return Err(Error::Config(format!(
                "Stall threshold ({}ms) must be greater than position tolerance ({}ms), \
                 otherwise no gap could ever be classified as a glitch",
                self.stall_threshold.as_millis(),
                self.position_tolerance.as_millis()
            )));
        }
        if self.recovery_window < self.poll_interval {
            return Err(Error::Config(
                "Recovery window must be at least one poll interval".to_string(),
            ));
        }
        if self.unreachable_after < self.poll_interval {
            return Err(Error::Config(
                "Unreachable threshold must be at least one poll interval".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_position_tolerance() -> Duration {
    Duration::from_millis(500)
}

fn default_stall_threshold() -> Duration {
    Duration::from_secs(1)
}

fn default_recovery_window() -> Duration {
    Duration::from_secs(5)
}

fn default_unreachable_after() -> Duration {
    Duration::from_secs(3)
}

// ============================================================================
// Playback driver policy
// ============================================================================

/// Knobs for the playback driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverPolicy {
    /// How far past its expected duration a track may run before it is
    /// aborted as overrun.
    ///
    /// Default: 10 s.
    #[serde(default = "default_completion_grace")]
    pub completion_grace: Duration,

    /// Aborted tracks in a row before the run gives up.
    ///
    /// Default: 5.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Loop the track list. `None` loops only `forever` runs.
    #[serde(default)]
    pub loop_tracks: Option<bool>,
}

impl Default for DriverPolicy {
    fn default() -> Self {
        Self {
            completion_grace: default_completion_grace(),
            max_consecutive_failures: default_max_consecutive_failures(),
            loop_tracks: None,
        }
    }
}

fn default_completion_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_max_consecutive_failures() -> u32 {
    5
}

// ============================================================================
// Soak configuration
// ============================================================================

/// Complete configuration of one soak run.
#[derive(Clone)]
pub struct SoakConfig {
    pub sender: DeviceSpec,
    pub repeater: DeviceSpec,
    pub slave: DeviceSpec,
    pub duration: RunDuration,
    pub mode: TransmissionMode,
    /// Number of tracks to query; 0 selects the canonical list
    pub track_count: usize,
    pub credentials: ServiceCredentials,
    pub dropout: DropoutPolicy,
    pub driver: DriverPolicy,
    /// Per-subscriber buffer of the event bus
    pub event_buffer: usize,
}

impl fmt::Debug for SoakConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoakConfig")
            .field("sender", &self.sender)
            .field("repeater", &self.repeater)
            .field("slave", &self.slave)
            .field("duration", &self.duration)
            .field("mode", &self.mode)
            .field("track_count", &self.track_count)
            .field("credentials", &self.credentials)
            .field("dropout", &self.dropout)
            .field("driver", &self.driver)
            .finish()
    }
}

impl SoakConfig {
    pub fn builder() -> SoakConfigBuilder {
        SoakConfigBuilder::default()
    }

    /// Whether the driver restarts the track list after the last track.
    pub fn loops_tracks(&self) -> bool {
        self.driver
            .loop_tracks
            .unwrap_or_else(|| self.duration.is_forever())
    }

    /// Validates the configuration and returns an actionable error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sender.is_absent() {
            return Err(Error::Config(format!(
                "A sender is required; '{}' is only valid for the repeater and slave roles",
                ABSENT_DEVICE
            )));
        }

        let remotes: Vec<&str> = [&self.sender, &self.repeater, &self.slave]
            .into_iter()
            .filter_map(|spec| match spec {
                DeviceSpec::Remote(id) => Some(id.as_str()),
                _ => None,
            })
            .collect();
        for (i, id) in remotes.iter().enumerate() {
            if remotes[i + 1..]
                .iter()
                .any(|other| other.eq_ignore_ascii_case(id))
            {
                return Err(Error::Config(format!(
                    "Device '{}' is assigned to more than one role",
                    id
                )));
            }
        }

        if self.credentials.service_id.trim().is_empty() {
            return Err(Error::Config(
                "Streaming service id cannot be empty".to_string(),
            ));
        }
        if self.credentials.username.trim().is_empty() {
            return Err(Error::Config(
                "Streaming service username cannot be empty".to_string(),
            ));
        }

        if self.track_count > MAX_TRACK_COUNT {
            return Err(Error::Config(format!(
                "Track count {} exceeds the limit of {}",
                self.track_count, MAX_TRACK_COUNT
            )));
        }

        self.dropout.validate()?;

        if self.driver.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(Error::Config(
                "Event buffer must hold at least one event".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`SoakConfig`].
#[derive(Default)]
pub struct SoakConfigBuilder {
    sender: Option<DeviceSpec>,
    repeater: Option<DeviceSpec>,
    slave: Option<DeviceSpec>,
    duration: Option<RunDuration>,
    mode: Option<TransmissionMode>,
    track_count: Option<usize>,
    credentials: Option<ServiceCredentials>,
    dropout: Option<DropoutPolicy>,
    driver: Option<DriverPolicy>,
    event_buffer: Option<usize>,
}

impl SoakConfigBuilder {
    pub fn sender(mut self, spec: DeviceSpec) -> Self {
        self.sender = Some(spec);
        self
    }

    /// Defaults to absent.
    pub fn repeater(mut self, spec: DeviceSpec) -> Self {
        self.repeater = Some(spec);
        self
    }

    /// Defaults to absent.
    pub fn slave(mut self, spec: DeviceSpec) -> Self {
        self.slave = Some(spec);
        self
    }

    pub fn duration(mut self, duration: RunDuration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Defaults to unicast.
    pub fn mode(mut self, mode: TransmissionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Defaults to 0 (canonical list).
    pub fn track_count(mut self, count: usize) -> Self {
        self.track_count = Some(count);
        self
    }

    pub fn credentials(mut self, credentials: ServiceCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn dropout_policy(mut self, policy: DropoutPolicy) -> Self {
        self.dropout = Some(policy);
        self
    }

    pub fn driver_policy(mut self, policy: DriverPolicy) -> Self {
        self.driver = Some(policy);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = Some(capacity);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a required field is missing or the
    /// combination of settings is invalid.
    pub fn build(self) -> Result<SoakConfig> {
        let sender = self.sender.ok_or_else(|| {
            Error::Config("Sender device is required. Use .sender() to set it.".to_string())
        })?;
        let duration = self.duration.ok_or_else(|| {
            Error::Config(
                "Run duration is required. Use .duration() with seconds or RunDuration::Forever."
                    .to_string(),
            )
        })?;
        let credentials = self.credentials.ok_or_else(|| {
            Error::Config(
                "Streaming service credentials are required. Use .credentials() to set them."
                    .to_string(),
            )
        })?;

        let config = SoakConfig {
            sender,
            repeater: self.repeater.unwrap_or(DeviceSpec::Absent),
            slave: self.slave.unwrap_or(DeviceSpec::Absent),
            duration,
            mode: self.mode.unwrap_or(TransmissionMode::Unicast),
            track_count: self.track_count.unwrap_or(0),
            credentials,
            dropout: self.dropout.unwrap_or_default(),
            driver: self.driver.unwrap_or_default(),
            event_buffer: self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}
