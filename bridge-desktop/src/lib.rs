//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for hosts running the soak
//! harness from a lab machine (macOS, Windows, Linux).
//!
//! - `HttpClient` using `reqwest`, shared by the TIDAL client and the
//!   OpenHome SOAP adapter
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::ReqwestHttpClient;
//! use std::sync::Arc;
//!
//! let http = Arc::new(ReqwestHttpClient::new()?);
//! let tidal = provider_tidal::TidalConnector::new(http.clone(), TidalConfig::default());
//! ```

mod http;

pub use http::ReqwestHttpClient;
