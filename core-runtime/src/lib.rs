//! # Core Runtime Module
//!
//! Foundational infrastructure shared by every crate of the dropout soak
//! harness:
//! - Logging and tracing setup
//! - Run configuration with fail-fast validation
//! - Event bus for session, playback, device and run notifications

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{DeviceSpec, DriverPolicy, DropoutPolicy, RunDuration, SoakConfig};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus};
