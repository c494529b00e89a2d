//! Command line of `test-tidal-dropout`
//!
//! Nine positionals in the order the lab scripts have always passed them,
//! plus flags for everything the engine lets you tune.

use bridge_traits::{ServiceCredentials, TransmissionMode};
use clap::Parser;
use core_runtime::config::{DeviceSpec, DriverPolicy, DropoutPolicy, RunDuration, SoakConfig};
use core_runtime::logging::{parse_level, LogFormat, LoggingConfig};
use core_runtime::{Error, Result};
use device_openhome::DEFAULT_PATH_TEMPLATE;
use provider_tidal::{TidalConfig, DEFAULT_CATALOG_PLAYLIST, TIDAL_API_BASE};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Clone)]
#[command(name = "test-tidal-dropout")]
#[command(about = "Soak test for dropout-free TIDAL playback across a device topology")]
#[command(version)]
pub struct SoakArgs {
    /// Sender DUT (`local` selects the loopback SoftPlayer)
    pub sender: String,

    /// Repeater DUT, or `None`
    pub repeater: String,

    /// Slave DUT, or `None`
    pub slave: String,

    /// Run length in seconds, or `forever`
    pub duration: String,

    /// `unicast` or `multicast`
    pub mode: String,

    /// Tracks to query from the catalog; 0 plays the canonical list
    pub track_count: usize,

    /// Service account id
    pub service_id: String,

    pub username: String,

    pub password: String,

    /// pretty, json or compact
    #[arg(long, default_value = "compact", env = "SOAK_LOG_FORMAT")]
    pub log_format: String,

    #[arg(long, default_value = "info", env = "SOAK_LOG_LEVEL")]
    pub log_level: String,

    /// Full filter directive, replaces --log-level
    #[arg(long, env = "SOAK_LOG_FILTER")]
    pub log_filter: Option<String>,

    #[arg(long, default_value_t = 250)]
    pub poll_interval_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub position_tolerance_ms: u64,

    #[arg(long, default_value_t = 1000)]
    pub stall_threshold_ms: u64,

    #[arg(long, default_value_t = 5000)]
    pub recovery_window_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub unreachable_after_ms: u64,

    /// Seconds a track may overrun its expected duration
    #[arg(long, default_value_t = 10)]
    pub completion_grace_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub max_consecutive_failures: u32,

    /// Restart the track list in bounded runs too
    #[arg(long)]
    pub loop_tracks: bool,

    /// Write the result as JSON to this file
    #[arg(long)]
    pub report_json: Option<PathBuf>,

    #[arg(long, default_value = TIDAL_API_BASE, env = "TIDAL_API_BASE")]
    pub tidal_api_base: String,

    /// Application token; the service account id is used when unset
    #[arg(long, env = "TIDAL_APP_TOKEN", hide_env_values = true)]
    pub tidal_app_token: Option<String>,

    /// Playlist queried for catalog tracks
    #[arg(long, default_value = DEFAULT_CATALOG_PLAYLIST)]
    pub tidal_catalog_playlist: String,

    /// OpenHome control URL layout; `{service}` is replaced by the service name
    #[arg(long, default_value = DEFAULT_PATH_TEMPLATE)]
    pub openhome_path_template: String,
}

impl fmt::Debug for SoakArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoakArgs")
            .field("sender", &self.sender)
            .field("repeater", &self.repeater)
            .field("slave", &self.slave)
            .field("duration", &self.duration)
            .field("mode", &self.mode)
            .field("track_count", &self.track_count)
            .field("service_id", &self.service_id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("log_format", &self.log_format)
            .field("log_level", &self.log_level)
            .field("log_filter", &self.log_filter)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("position_tolerance_ms", &self.position_tolerance_ms)
            .field("stall_threshold_ms", &self.stall_threshold_ms)
            .field("recovery_window_ms", &self.recovery_window_ms)
            .field("unreachable_after_ms", &self.unreachable_after_ms)
            .field("completion_grace_secs", &self.completion_grace_secs)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("loop_tracks", &self.loop_tracks)
            .field("report_json", &self.report_json)
            .field("tidal_api_base", &self.tidal_api_base)
            .field(
                "tidal_app_token",
                &self.tidal_app_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("tidal_catalog_playlist", &self.tidal_catalog_playlist)
            .field("openhome_path_template", &self.openhome_path_template)
            .finish()
    }
}

impl SoakArgs {
    /// Build and validate the run configuration.
    pub fn soak_config(&self) -> Result<SoakConfig> {
        let mode: TransmissionMode = self
            .mode
            .parse()
            .map_err(|e: bridge_traits::BridgeError| Error::Config(e.to_string()))?;

        let dropout = DropoutPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            position_tolerance: Duration::from_millis(self.position_tolerance_ms),
            stall_threshold: Duration::from_millis(self.stall_threshold_ms),
            recovery_window: Duration::from_millis(self.recovery_window_ms),
            unreachable_after: Duration::from_millis(self.unreachable_after_ms),
        };
        let driver = DriverPolicy {
            completion_grace: Duration::from_secs(self.completion_grace_secs),
            max_consecutive_failures: self.max_consecutive_failures,
            loop_tracks: self.loop_tracks.then_some(true),
        };

        SoakConfig::builder()
            .sender(self.sender.parse::<DeviceSpec>()?)
            .repeater(self.repeater.parse::<DeviceSpec>()?)
            .slave(self.slave.parse::<DeviceSpec>()?)
            .duration(self.duration.parse::<RunDuration>()?)
            .mode(mode)
            .track_count(self.track_count)
            .credentials(ServiceCredentials::new(
                self.service_id.clone(),
                self.username.clone(),
                self.password.clone(),
            ))
            .dropout_policy(dropout)
            .driver_policy(driver)
            .build()
    }

    pub fn logging_config(&self) -> Result<LoggingConfig> {
        let config = LoggingConfig::default()
            .with_format(self.log_format.parse::<LogFormat>()?)
            .with_level(parse_level(&self.log_level)?);
        Ok(match &self.log_filter {
            Some(filter) => config.with_filter(filter.clone()),
            None => config,
        })
    }

    pub fn tidal_config(&self) -> Result<TidalConfig> {
        let config = TidalConfig::new(&self.tidal_api_base)
            .map_err(|e| Error::Config(e.to_string()))?
            .with_catalog_playlist(self.tidal_catalog_playlist.clone());
        Ok(match &self.tidal_app_token {
            Some(token) => config.with_app_token(token.clone()),
            None => config,
        })
    }
}
