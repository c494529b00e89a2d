//! # OpenHome Device Adapter
//!
//! Implements `DeviceControl` and `DeviceResolver` for networked renderers
//! that speak the OpenHome UPnP services.
//!
//! ## Overview
//!
//! - [`OpenHomeResolver`] turns a DUT identifier into a device connection
//! - [`OpenHomeDevice`] drives playback through `Playlist`, observes it
//!   through `Time`, and builds the distribution topology with `Sender`,
//!   `Receiver` and `Config`
//! - [`soap`] holds the envelope and DIDL-Lite helpers
//!
//! All traffic goes through the host's `HttpClient`, so the adapter runs
//! wherever the engine does.

pub mod device;
pub mod error;
pub mod resolver;
pub mod soap;

pub use device::{OpenHomeDevice, DEFAULT_PATH_TEMPLATE};
pub use error::{OpenHomeError, Result};
pub use resolver::{parse_address, OpenHomeResolver};
