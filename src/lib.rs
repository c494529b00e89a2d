//! Workspace umbrella crate.
//!
//! Exposes feature flags that map to the individual workspace crates, so a
//! host can depend on `soak-workspace` and pick what it needs:
//!
//! - `desktop-shims` (default): the full harness, `core-service` with the
//!   reqwest, TIDAL and OpenHome bridges
//! - `engine`: only the playback and dropout-monitoring engine

#[cfg(feature = "desktop-shims")]
pub use core_service;

#[cfg(feature = "engine")]
pub use core_playback;
