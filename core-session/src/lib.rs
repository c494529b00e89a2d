//! # Streaming Service Session
//!
//! Authenticates against a cloud music service and keeps the session usable
//! for the whole run.
//!
//! - [`SessionManager`] logs in and tracks the account's [`CredentialStatus`]
//! - [`Session`] resolves streams and pages the catalog, renewing its token
//!   transparently
//! - [`SessionGuard`] logs out when the run ends, however it ends

pub mod error;
pub mod manager;
pub mod types;

pub use error::{Result, SessionError};
pub use manager::{Session, SessionGuard, SessionManager};
pub use types::{CredentialStatus, SessionId, StreamUri};
