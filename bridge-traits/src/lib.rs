//! # Host Bridge Traits
//!
//! Contracts between the dropout engine and everything outside the process.
//!
//! ## Overview
//!
//! The engine never talks to a device, a music service or the network
//! directly. Each external capability is a trait defined here and
//! implemented in an adapter crate:
//!
//! | Trait | Purpose | Implementations |
//! |-------|---------|-----------------|
//! | [`DeviceControl`](device::DeviceControl) | Drive and observe one audio device | `device-openhome`, loopback SoftPlayer in `core-devices` |
//! | [`DeviceResolver`](device::DeviceResolver) | Turn a DUT identifier into a connection | `device-openhome`, `core-devices` |
//! | [`StreamingService`](streaming::StreamingService) | Cloud catalog, login and stream URLs | `provider-tidal` |
//! | [`HttpClient`](http::HttpClient) | Async HTTP with retry | `bridge-desktop` |
//! | [`Clock`](time::Clock) | Wall-clock timestamps | [`SystemClock`](time::SystemClock), [`ManualClock`](time::ManualClock) |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Adapters map
//! their native failures onto it so the engine can tell rejected credentials
//! (`Unauthorized`) from missing tracks (`NotFound`) and dead endpoints
//! (`Unreachable`).
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`; the monitor queries devices from
//! several tasks at once.

pub mod device;
pub mod error;
pub mod http;
pub mod streaming;
pub mod time;

pub use error::{BridgeError, Result};

pub use device::{
    DeviceControl, DeviceResolver, DeviceRole, PlaybackState, SenderInfo, StreamItem,
    StreamPosition, TransmissionMode,
};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use streaming::{CatalogTrack, ServiceCredentials, ServiceToken, StreamingService};
pub use time::{Clock, LogLevel, ManualClock, SystemClock};
