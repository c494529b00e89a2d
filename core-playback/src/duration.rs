//! # Duration Controller
//!
//! Bounds a run by wall-clock time or lets it run until cancelled.
//!
//! ```text
//! Running ──(elapsed / cancel / exhausted / fatal / failures)──▶ Stopping ──(teardown done)──▶ Stopped
//! ```
//!
//! Expiry is checked between tracks, so the track playing at the deadline is
//! allowed to finish. Cancellation is immediate: the driver and the monitors
//! select on [`DurationController::cancelled`].

use core_runtime::config::RunDuration;
use core_runtime::events::{CoreEvent, EventBus, RunEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    /// Configured duration ran out
    Elapsed,
    Cancelled,
    /// Bounded list played through, or a full pass found nothing playable
    TracksExhausted,
    /// Streaming session failed
    Fatal,
    TooManyFailures,
    /// The sender stopped answering
    SenderUnreachable,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Elapsed => write!(f, "duration elapsed"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::TracksExhausted => write!(f, "tracks exhausted"),
            StopReason::Fatal => write!(f, "fatal session error"),
            StopReason::TooManyFailures => write!(f, "too many consecutive failures"),
            StopReason::SenderUnreachable => write!(f, "sender unreachable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Stopping(StopReason),
    Stopped(StopReason),
}

impl ControllerState {
    fn name(&self) -> &'static str {
        match self {
            ControllerState::Running => "Running",
            ControllerState::Stopping(_) => "Stopping",
            ControllerState::Stopped(_) => "Stopped",
        }
    }
}

struct Inner {
    duration: RunDuration,
    started: Instant,
    state: Mutex<ControllerState>,
    cancel: CancellationToken,
    event_bus: Option<EventBus>,
}

/// Cloneable handle; every clone observes the same run.
#[derive(Clone)]
pub struct DurationController {
    inner: Arc<Inner>,
}

impl DurationController {
    /// Start the clock now.
    pub fn new(duration: RunDuration, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                duration,
                started: Instant::now(),
                state: Mutex::new(ControllerState::Running),
                cancel,
                event_bus: None,
            }),
        }
    }

    pub fn with_event_bus(duration: RunDuration, cancel: CancellationToken, event_bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                duration,
                started: Instant::now(),
                state: Mutex::new(ControllerState::Running),
                cancel,
                event_bus: Some(event_bus),
            }),
        }
    }

    pub fn duration(&self) -> RunDuration {
        self.inner.duration
    }

    pub fn state(&self) -> ControllerState {
        *self.inner.state.lock()
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Time left, `None` when running forever.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .duration
            .limit()
            .map(|limit| limit.saturating_sub(self.elapsed()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Whether another track may start. Moves to `Stopping` when the answer
    /// turns to no.
    pub fn may_start_track(&self) -> bool {
        if self.is_cancelled() {
            self.request_stop(StopReason::Cancelled);
        } else if self.is_expired() {
            self.request_stop(StopReason::Elapsed);
        }
        self.state() == ControllerState::Running
    }

    /// Ask the run to wind down. The first reason sticks.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        let mut state = self.inner.state.lock();
        if *state != ControllerState::Running {
            return false;
        }
        *state = ControllerState::Stopping(reason);
        drop(state);

        info!(%reason, elapsed_ms = self.elapsed().as_millis() as u64, "Run stopping");
        self.emit(ControllerState::Stopping(reason), reason);
        true
    }

    /// Cancel the run: stop immediately, wherever it is.
    pub fn cancel(&self) {
        self.request_stop(StopReason::Cancelled);
        self.inner.cancel.cancel();
    }

    /// Mark teardown complete.
    pub fn finish(&self) -> StopReason {
        let mut state = self.inner.state.lock();
        let reason = match *state {
            ControllerState::Stopped(reason) => return reason,
            ControllerState::Stopping(reason) => reason,
            // The sequence ended on its own
            ControllerState::Running => StopReason::TracksExhausted,
        };
        *state = ControllerState::Stopped(reason);
        drop(state);

        info!(%reason, "Run stopped");
        self.emit(ControllerState::Stopped(reason), reason);
        reason
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state() {
            ControllerState::Running => None,
            ControllerState::Stopping(reason) | ControllerState::Stopped(reason) => Some(reason),
        }
    }

    fn emit(&self, state: ControllerState, reason: StopReason) {
        if let Some(bus) = &self.inner.event_bus {
            let _ = bus.emit(CoreEvent::Run(RunEvent::StateChanged {
                state: state.name().to_string(),
                reason: Some(reason.to_string()),
            }));
        }
    }
}

impl fmt::Debug for DurationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurationController")
            .field("duration", &self.inner.duration)
            .field("state", &self.state())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
