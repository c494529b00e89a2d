//! # Session Manager
//!
//! Owns the lifetime of the streaming service account used by a run.
//!
//! ## Overview
//!
//! [`SessionManager::authenticate`] logs in once and hands back a
//! [`SessionGuard`]. Every service call made through the resulting
//! [`Session`] first obtains a valid token; when the token is about to lapse
//! it is renewed exactly once, even if many tasks ask at the same moment.
//!
//! Releasing the session logs out. Release is idempotent and also happens
//! when the guard is dropped, so a run that ends on an error path still
//! leaves the account clean.
//!
//! ## Usage
//!
//! ```no_run
//! # use bridge_traits::{ServiceCredentials, StreamingService};
//! # use core_runtime::EventBus;
//! # use core_session::SessionManager;
//! # use std::sync::Arc;
//! # async fn demo(service: Arc<dyn StreamingService>) -> core_session::Result<()> {
//! let manager = SessionManager::new(service, EventBus::default());
//! let session = manager
//!     .authenticate(ServiceCredentials::new("app-id", "listener", "secret"))
//!     .await?;
//!
//! let uri = session.resolve_stream("58990486").await?;
//! println!("streaming from {}", uri);
//!
//! session.release().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SessionError};
use crate::types::{CredentialStatus, SessionId, StreamUri};
use bridge_traits::{
    BridgeError, CatalogTrack, Clock, ServiceCredentials, ServiceToken, StreamingService,
    SystemClock,
};
use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
use core_runtime::logging::redact_if_sensitive;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument, warn};

/// Default timeout for a single service round trip
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Renew tokens this long before they expire
const TOKEN_RENEW_BUFFER: Duration = Duration::from_secs(300);

// ============================================================================
// SessionManager
// ============================================================================

/// Opens sessions against one streaming service.
pub struct SessionManager {
    service: Arc<dyn StreamingService>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    renew_buffer: Duration,
    status: Arc<RwLock<CredentialStatus>>,
}

impl SessionManager {
    pub fn new(service: Arc<dyn StreamingService>, event_bus: EventBus) -> Self {
        Self {
            service,
            event_bus,
            clock: Arc::new(SystemClock),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            renew_buffer: TOKEN_RENEW_BUFFER,
            status: Arc::new(RwLock::new(CredentialStatus::NotConfigured)),
        }
    }

    /// Use a custom clock for token expiry checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_renew_buffer(mut self, renew_buffer: Duration) -> Self {
        self.renew_buffer = renew_buffer;
        self
    }

    /// Current login state of the account.
    pub async fn status(&self) -> CredentialStatus {
        self.status.read().await.clone()
    }

    /// Log in and open a session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AuthenticationFailed`] when the service rejects the
    ///   credentials
    /// - [`SessionError::ServiceUnavailable`] when the service cannot be reached
    /// - [`SessionError::OperationTimeout`] when login does not answer in time
    #[instrument(skip(self, credentials), fields(service = %self.service.service_name(), user = %redact_if_sensitive("username", &credentials.username)))]
    pub async fn authenticate(&self, credentials: ServiceCredentials) -> Result<SessionGuard> {
        let service_name = self.service.service_name().to_string();
        info!("Authenticating with streaming service");

        *self.status.write().await = CredentialStatus::LoggingIn;
        let _ = self
            .event_bus
            .emit(CoreEvent::Session(SessionEvent::Authenticating {
                service: service_name.clone(),
            }));

        let outcome = timeout(self.request_timeout, self.service.login(&credentials)).await;
        let token = match outcome {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                let recoverable = !matches!(e, BridgeError::Unauthorized(_));
                let err = SessionError::from_service(&service_name, e);
                self.fail_login(&service_name, &err, recoverable).await;
                return Err(err);
            }
            Err(_) => {
                let err = SessionError::OperationTimeout {
                    operation: format!("{} login", service_name),
                };
                self.fail_login(&service_name, &err, true).await;
                return Err(err);
            }
        };

        let session = Session {
            inner: Arc::new(SessionInner {
                id: SessionId::new(),
                service: self.service.clone(),
                credentials,
                token: RwLock::new(token),
                renew_lock: Mutex::new(()),
                released: AtomicBool::new(false),
                event_bus: self.event_bus.clone(),
                clock: self.clock.clone(),
                request_timeout: self.request_timeout,
                renew_buffer: self.renew_buffer,
                status: self.status.clone(),
            }),
        };

        *self.status.write().await = CredentialStatus::LoggedIn;
        info!(session_id = %session.id(), "Streaming session established");
        let _ = self
            .event_bus
            .emit(CoreEvent::Session(SessionEvent::Authenticated {
                service: service_name,
                session_id: session.id().to_string(),
            }));

        Ok(SessionGuard {
            session: Some(session),
        })
    }

    async fn fail_login(&self, service: &str, err: &SessionError, recoverable: bool) {
        error!(error = %err, "Authentication failed");
        *self.status.write().await = CredentialStatus::Failed(err.to_string());
        let _ = self
            .event_bus
            .emit(CoreEvent::Session(SessionEvent::AuthError {
                service: service.to_string(),
                message: err.to_string(),
                recoverable,
            }));
    }
}

// ============================================================================
// Session
// ============================================================================

struct SessionInner {
    id: SessionId,
    service: Arc<dyn StreamingService>,
    credentials: ServiceCredentials,
    token: RwLock<ServiceToken>,
    /// Serializes renewal so concurrent callers trigger one round trip
    renew_lock: Mutex<()>,
    released: AtomicBool,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    renew_buffer: Duration,
    status: Arc<RwLock<CredentialStatus>>,
}

/// An authenticated, cheaply cloneable handle to the service account.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn service_name(&self) -> &str {
        self.inner.service.service_name()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_released() {
            return Err(SessionError::Released(self.inner.id.to_string()));
        }
        Ok(())
    }

    /// Return a token that stays valid for at least the renew buffer,
    /// renewing it first if needed.
    pub async fn valid_token(&self) -> Result<ServiceToken> {
        self.ensure_active()?;
        let now = self.inner.clock.now();

        {
            let token = self.inner.token.read().await;
            if !token.expires_within(now, self.inner.renew_buffer) {
                return Ok(token.clone());
            }
        }

        let _guard = self.inner.renew_lock.lock().await;

        // Another caller may have renewed while we waited
        let current = self.inner.token.read().await.clone();
        if !current.expires_within(self.inner.clock.now(), self.inner.renew_buffer) {
            debug!(session_id = %self.inner.id, "Token already renewed by another task");
            return Ok(current);
        }

        self.renew(&current).await
    }

    /// Renew unconditionally. Caller must hold `renew_lock`.
    #[instrument(skip(self, current), fields(session_id = %self.inner.id))]
    async fn renew(&self, current: &ServiceToken) -> Result<ServiceToken> {
        let service_name = self.service_name().to_string();
        info!("Renewing session token");
        let _ = self
            .inner
            .event_bus
            .emit(CoreEvent::Session(SessionEvent::TokenRenewing {
                session_id: self.inner.id.to_string(),
            }));

        let outcome = timeout(
            self.inner.request_timeout,
            self.inner.service.renew(&self.inner.credentials, current),
        )
        .await;

        let renewed = match outcome {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                let recoverable = !matches!(e, BridgeError::Unauthorized(_));
                let err = SessionError::from_service(&service_name, e);
                self.renew_failed(&service_name, &err, recoverable).await;
                return Err(err);
            }
            Err(_) => {
                let err = SessionError::OperationTimeout {
                    operation: format!("{} token renewal", service_name),
                };
                self.renew_failed(&service_name, &err, true).await;
                return Err(err);
            }
        };

        *self.inner.token.write().await = renewed.clone();
        info!("Session token renewed");
        let _ = self
            .inner
            .event_bus
            .emit(CoreEvent::Session(SessionEvent::TokenRenewed {
                session_id: self.inner.id.to_string(),
                expires_at: renewed.expires_at.map(|at| at.timestamp()),
            }));

        Ok(renewed)
    }

    async fn renew_failed(&self, service: &str, err: &SessionError, recoverable: bool) {
        warn!(error = %err, "Token renewal failed");
        *self.inner.status.write().await = CredentialStatus::Failed(err.to_string());
        let _ = self
            .inner
            .event_bus
            .emit(CoreEvent::Session(SessionEvent::AuthError {
                service: service.to_string(),
                message: err.to_string(),
                recoverable,
            }));
    }

    /// Resolve a playable URI for one track.
    ///
    /// A token rejected mid-run is renewed once and the lookup retried.
    ///
    /// # Errors
    ///
    /// [`SessionError::TrackUnavailable`] when the service does not offer the
    /// track; other variants are fatal for the run.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn resolve_stream(&self, track_id: &str) -> Result<StreamUri> {
        let token = self.valid_token().await?;
        match self.stream_url_with(&token, track_id).await {
            Err(SessionError::AuthenticationFailed { .. }) => {
                debug!("Token rejected, renewing before retry");
                let token = {
                    let _guard = self.inner.renew_lock.lock().await;
                    let current = self.inner.token.read().await.clone();
                    if current == token {
                        self.renew(&current).await?
                    } else {
                        current
                    }
                };
                self.stream_url_with(&token, track_id).await
            }
            other => other,
        }
    }

    async fn stream_url_with(&self, token: &ServiceToken, track_id: &str) -> Result<StreamUri> {
        let service_name = self.service_name();
        let outcome = timeout(
            self.inner.request_timeout,
            self.inner.service.stream_url(token, track_id),
        )
        .await
        .map_err(|_| SessionError::OperationTimeout {
            operation: format!("resolve stream for track {}", track_id),
        })?;

        outcome
            .map(StreamUri::new)
            .map_err(|e| SessionError::from_track(service_name, track_id, e))
    }

    /// One page of the service catalog.
    pub async fn list_catalog(&self, limit: usize, offset: usize) -> Result<Vec<CatalogTrack>> {
        let token = self.valid_token().await?;
        let service_name = self.service_name();

        timeout(
            self.inner.request_timeout,
            self.inner.service.list_catalog(&token, limit, offset),
        )
        .await
        .map_err(|_| SessionError::OperationTimeout {
            operation: "list catalog".to_string(),
        })?
        .map_err(|e| SessionError::from_service(service_name, e))
    }

    pub async fn lookup_track(&self, track_id: &str) -> Result<CatalogTrack> {
        let token = self.valid_token().await?;
        let service_name = self.service_name();

        timeout(
            self.inner.request_timeout,
            self.inner.service.lookup_track(&token, track_id),
        )
        .await
        .map_err(|_| SessionError::OperationTimeout {
            operation: format!("lookup track {}", track_id),
        })?
        .map_err(|e| SessionError::from_track(service_name, track_id, e))
    }

    /// Log out. Only the first call reaches the service; later calls are
    /// no-ops.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn release(&self) -> Result<()> {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let token = self.inner.token.read().await.clone();
        let service_name = self.service_name();
        let outcome = timeout(self.inner.request_timeout, self.inner.service.logout(&token)).await;

        *self.inner.status.write().await = CredentialStatus::LoggedOut;
        let _ = self
            .inner
            .event_bus
            .emit(CoreEvent::Session(SessionEvent::Released {
                session_id: self.inner.id.to_string(),
            }));

        match outcome {
            Ok(Ok(())) => {
                info!("Streaming session released");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Logout failed, session dropped locally");
                Err(SessionError::from_service(service_name, e))
            }
            Err(_) => {
                warn!("Logout timed out, session dropped locally");
                Err(SessionError::OperationTimeout {
                    operation: format!("{} logout", service_name),
                })
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("service", &self.service_name())
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// SessionGuard
// ============================================================================

/// Owns a [`Session`] and releases it when dropped.
///
/// Dropping outside a tokio runtime cannot log out; call
/// [`SessionGuard::release`] explicitly on orderly shutdown.
pub struct SessionGuard {
    session: Option<Session>,
}

impl SessionGuard {
    /// A cloneable handle for tasks spawned during the run.
    pub fn session(&self) -> Session {
        Session::clone(self)
    }

    /// Release now and surface the logout result.
    pub async fn release(mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.release().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session_id", &self.session.as_ref().map(|s| s.id()))
            .finish()
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
            .as_ref()
            .unwrap_or_else(|| unreachable!("session taken"))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.is_released() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.release().await {
                        warn!(error = %e, "Release on drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(session_id = %session.id(), "Session dropped outside a runtime, logout skipped");
            }
        }
    }
}
