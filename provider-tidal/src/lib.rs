//! # TIDAL Provider
//!
//! Implements `StreamingService` for the TIDAL v1 API.
//!
//! ## Overview
//!
//! This module provides:
//! - Username/password login with an application token
//! - Catalog listing from a configurable playlist
//! - Track lookup and stream URL resolution
//! - Logout

pub mod connector;
pub mod error;
pub mod types;

pub use connector::{TidalConfig, TidalConnector, DEFAULT_CATALOG_PLAYLIST, TIDAL_API_BASE};
pub use error::{Result, TidalError};
