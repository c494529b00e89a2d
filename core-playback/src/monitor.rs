//! # Dropout Monitor
//!
//! One polling task per participating device. Each task samples playback
//! state and stream position every `poll_interval` and feeds the samples to a
//! [`DeviceTracker`], which decides what counts as a dropout.
//!
//! ## Detection
//!
//! - **Position**: between two `Playing` samples the stream must advance by
//!   the wall time elapsed, within `position_tolerance`. Across a track
//!   boundary the expected advance is the rest of the previous track plus the
//!   new offset.
//! - **State**: `Buffering`, `Error` or failing control queries while a
//!   session is active open an impairment; when it ends, one dropout is
//!   reported. Its gap is the larger of the impaired span and the position
//!   deficit.
//!
//! An `Error` state outlasting `recovery_window` is a device fault. Queries
//! failing for `unreachable_after` make the device unreachable: a fault is
//! recorded, the open impairment is flushed as a stall and the task ends.
//!
//! The monitor only observes. It never sends commands to a device.

use crate::types::{
    DeviceFault, DeviceFaultKind, DropoutCause, DropoutEvent, PlaybackSession, RecordSink,
    RunRecord, Severity,
};
use bridge_traits::{DeviceRole, PlaybackState, StreamPosition};
use core_devices::DeviceHandle;
use core_runtime::config::DropoutPolicy;
use core_runtime::events::{CoreEvent, DeviceEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One health sample. `reading` is `None` when the control queries failed.
#[derive(Debug, Clone)]
pub struct Sample {
    pub at: Instant,
    pub reading: Option<(PlaybackState, StreamPosition)>,
}

/// What the tracker concluded from a sample.
#[derive(Debug, Clone)]
pub enum Finding {
    Dropout {
        session: Arc<PlaybackSession>,
        /// When the interruption began; the event is stamped with this
        at: Instant,
        gap: Duration,
        severity: Severity,
        cause: DropoutCause,
    },
    Fault {
        kind: DeviceFaultKind,
        session: Option<u64>,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone)]
struct Anchor {
    at: Instant,
    position: StreamPosition,
    /// Expected length of the track the anchor sits in
    track_duration: Duration,
}

#[derive(Debug, Clone)]
struct Impairment {
    /// Session active at `first_bad`
    session: Arc<PlaybackSession>,
    first_bad: Instant,
    last_bad: Instant,
    cause: DropoutCause,
    error_since: Option<Instant>,
    fault_reported: bool,
}

// ============================================================================
// DeviceTracker
// ============================================================================

/// Per-device detection state. Pure: time comes in with the samples.
#[derive(Debug)]
pub struct DeviceTracker {
    device_id: String,
    policy: DropoutPolicy,
    /// Last good `Playing` sample
    anchor: Option<Anchor>,
    impairment: Option<Impairment>,
    failing_since: Option<Instant>,
    /// Most recent session this device took part in
    last_session: Option<Arc<PlaybackSession>>,
    unreachable: bool,
}

impl DeviceTracker {
    pub fn new(device_id: impl Into<String>, policy: DropoutPolicy) -> Self {
        Self {
            device_id: device_id.into(),
            policy,
            anchor: None,
            impairment: None,
            failing_since: None,
            last_session: None,
            unreachable: false,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    pub fn is_impaired(&self) -> bool {
        self.impairment.is_some()
    }

    /// Feed one sample taken while `current` was the published session.
    pub fn observe(&mut self, sample: Sample, current: Option<&Arc<PlaybackSession>>) -> Vec<Finding> {
        let mut findings = Vec::new();
        if self.unreachable {
            return findings;
        }

        // Sessions this device is not part of do not concern it
        let current = current.filter(|session| session.is_participant(&self.device_id));
        if let Some(session) = current {
            self.last_session = Some(session.clone());
        }

        let Some((state, position)) = sample.reading else {
            self.on_query_failure(sample.at, current, &mut findings);
            return findings;
        };
        self.failing_since = None;

        let Some(session) = current else {
            findings.extend(self.close_impairment(None, false));
            self.anchor = None;
            return findings;
        };

        match state {
            PlaybackState::Playing => {
                let deficit = self
                    .anchor
                    .as_ref()
                    .map(|anchor| position_deficit(anchor, &position, sample.at))
                    .unwrap_or_default();

                if self.impairment.is_some() {
                    findings.extend(self.close_impairment(Some(deficit), false));
                } else if deficit > self.policy.position_tolerance {
                    findings.push(self.dropout(
                        session.clone(),
                        sample.at,
                        deficit,
                        DropoutCause::PositionDeficit,
                        false,
                    ));
                }

                self.anchor = Some(Anchor {
                    at: sample.at,
                    track_duration: expected_duration(session, &position),
                    position,
                });
            }
            PlaybackState::Buffering => {
                let impairment = self.mark_impaired(session, sample.at, DropoutCause::Buffering);
                impairment.error_since = None;
            }
            PlaybackState::Error => {
                let recovery_window = self.policy.recovery_window;
                let impairment = self.mark_impaired(session, sample.at, DropoutCause::ErrorState);
                let since = *impairment.error_since.get_or_insert(sample.at);
                let elapsed = sample.at.saturating_duration_since(since);

                if elapsed >= recovery_window && !impairment.fault_reported {
                    impairment.fault_reported = true;
                    findings.push(Finding::Fault {
                        kind: DeviceFaultKind::PersistentError,
                        session: Some(session.id),
                        elapsed,
                    });
                }
            }
            PlaybackState::Stopped => {
                findings.extend(self.close_impairment(None, false));
                self.anchor = None;
            }
        }

        findings
    }

    /// Close whatever is open, e.g. when the run is cancelled mid-impairment.
    pub fn flush(&mut self) -> Option<Finding> {
        self.anchor = None;
        self.close_impairment(None, false)
    }

    fn on_query_failure(
        &mut self,
        at: Instant,
        current: Option<&Arc<PlaybackSession>>,
        findings: &mut Vec<Finding>,
    ) {
        let since = *self.failing_since.get_or_insert(at);
        if let Some(session) = current {
            self.mark_impaired(session, at, DropoutCause::Unreachable);
        }

        let elapsed = at.saturating_duration_since(since);
        if elapsed >= self.policy.unreachable_after {
            self.unreachable = true;
            findings.push(Finding::Fault {
                kind: DeviceFaultKind::Unreachable,
                session: self.last_session.as_ref().map(|s| s.id),
                elapsed,
            });
            findings.extend(self.close_impairment(None, true));
            self.anchor = None;
        }
    }

    fn mark_impaired(
        &mut self,
        session: &Arc<PlaybackSession>,
        at: Instant,
        cause: DropoutCause,
    ) -> &mut Impairment {
        let impairment = self.impairment.get_or_insert_with(|| Impairment {
            session: session.clone(),
            first_bad: at,
            last_bad: at,
            cause,
            error_since: None,
            fault_reported: false,
        });
        impairment.last_bad = at;
        if cause_rank(cause) > cause_rank(impairment.cause) {
            impairment.cause = cause;
        }
        impairment
    }

    fn close_impairment(&mut self, position_gap: Option<Duration>, force_stall: bool) -> Option<Finding> {
        let impairment = self.impairment.take()?;

        let state_gap = impairment
            .last_bad
            .saturating_duration_since(impairment.first_bad)
            + self.policy.poll_interval;
        let gap = state_gap.max(position_gap.unwrap_or_default());

        Some(self.dropout(
            impairment.session,
            impairment.first_bad,
            gap,
            impairment.cause,
            force_stall,
        ))
    }

    fn dropout(
        &self,
        session: Arc<PlaybackSession>,
        at: Instant,
        gap: Duration,
        cause: DropoutCause,
        force_stall: bool,
    ) -> Finding {
        let severity = if force_stall || gap >= self.policy.stall_threshold {
            Severity::Stall
        } else {
            Severity::Glitch
        };
        Finding::Dropout {
            session,
            at,
            gap,
            severity,
            cause,
        }
    }
}

fn cause_rank(cause: DropoutCause) -> u8 {
    match cause {
        DropoutCause::PositionDeficit => 0,
        DropoutCause::Buffering => 1,
        DropoutCause::Unreachable => 2,
        DropoutCause::ErrorState => 3,
    }
}

fn expected_duration(session: &PlaybackSession, position: &StreamPosition) -> Duration {
    position
        .track_id
        .as_deref()
        .and_then(|id| session.duration_of(id))
        .unwrap_or(session.track.duration)
}

/// Wall time elapsed since the anchor that the stream did not cover.
fn position_deficit(anchor: &Anchor, position: &StreamPosition, at: Instant) -> Duration {
    let elapsed = at.saturating_duration_since(anchor.at);

    // Receivers do not report track ids; a backwards jump is a new track
    let boundary = match (&anchor.position.track_id, &position.track_id) {
        (Some(previous), Some(current)) => previous != current,
        _ => position.offset < anchor.position.offset,
    };

    let advanced = if boundary {
        anchor.track_duration.saturating_sub(anchor.position.offset) + position.offset
    } else {
        position.offset.saturating_sub(anchor.position.offset)
    };

    elapsed.saturating_sub(advanced)
}

// ============================================================================
// Monitor tasks
// ============================================================================

/// Spawns and owns the per-device polling tasks.
pub struct DropoutMonitor {
    policy: DropoutPolicy,
    sessions: watch::Receiver<Option<Arc<PlaybackSession>>>,
    sink: RecordSink,
    event_bus: EventBus,
    cancel: CancellationToken,
}

impl DropoutMonitor {
    pub fn new(
        policy: DropoutPolicy,
        sessions: watch::Receiver<Option<Arc<PlaybackSession>>>,
        sink: RecordSink,
        event_bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            policy,
            sessions,
            sink,
            event_bus,
            cancel,
        }
    }

    /// Start watching `handles`. Absent devices are skipped.
    pub fn spawn(&self, handles: Vec<Arc<DeviceHandle>>) -> MonitorSet {
        let mut tasks = JoinSet::new();
        for handle in handles.into_iter().filter(|h| h.is_present()) {
            let task = DeviceTask {
                tracker: DeviceTracker::new(handle.id(), self.policy.clone()),
                handle,
                policy: self.policy.clone(),
                sessions: self.sessions.clone(),
                sink: self.sink.clone(),
                event_bus: self.event_bus.clone(),
                cancel: self.cancel.clone(),
            };
            tasks.spawn(task.run());
        }
        info!(devices = tasks.len(), "Dropout monitor started");
        MonitorSet { tasks }
    }
}

/// Running monitor tasks.
pub struct MonitorSet {
    tasks: JoinSet<()>,
}

impl MonitorSet {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task to end. Tasks end on cancellation or when their
    /// device becomes unreachable.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Monitor task failed");
            }
        }
    }
}

struct DeviceTask {
    handle: Arc<DeviceHandle>,
    tracker: DeviceTracker,
    policy: DropoutPolicy,
    sessions: watch::Receiver<Option<Arc<PlaybackSession>>>,
    sink: RecordSink,
    event_bus: EventBus,
    cancel: CancellationToken,
}

impl DeviceTask {
    #[instrument(skip_all, fields(device = %self.handle.id(), role = %self.handle.role()))]
    async fn run(mut self) {
        let mut ticker = interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reading = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                reading = self.sample() => reading,
            };

            let at = Instant::now();
            let session = self.sessions.borrow().clone();
            for finding in self.tracker.observe(Sample { at, reading }, session.as_ref()) {
                self.publish(finding, at);
            }

            if self.tracker.is_unreachable() {
                warn!("Device unreachable, monitoring stopped");
                return;
            }
        }

        if let Some(finding) = self.tracker.flush() {
            self.publish(finding, Instant::now());
        }
        debug!("Monitor task finished");
    }

    async fn sample(&self) -> Option<(PlaybackState, StreamPosition)> {
        let handle = &self.handle;
        let query = async {
            let state = handle.playback_state().await?;
            let position = handle.stream_position().await?;
            Ok::<_, core_devices::DeviceError>((state, position))
        };

        match timeout(self.policy.unreachable_after, query).await {
            Ok(Ok((state, position))) => {
                handle.record_observation(state, position.clone());
                Some((state, position))
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Health query failed");
                None
            }
            Err(_) => {
                debug!("Health query timed out");
                None
            }
        }
    }

    fn publish(&self, finding: Finding, observed_at: Instant) {
        let clock = self.sink.clock();
        let device_id = self.handle.id().to_string();
        let role: DeviceRole = self.handle.role();

        match finding {
            Finding::Dropout {
                session,
                at,
                gap,
                severity,
                cause,
            } => {
                let offset = clock.offset_at(at);
                if !session.is_participant(&device_id) {
                    warn!(session = session.id, "Dropout outside a session of this device discarded");
                    return;
                }
                self.handle.record_dropout();
                let event = DropoutEvent {
                    seq: clock.next_seq(),
                    device_id: device_id.clone(),
                    device_label: self.handle.label(),
                    role,
                    session: session.id,
                    track_id: session.track.id.clone(),
                    timestamp: clock.timestamp(offset),
                    offset,
                    gap,
                    severity,
                    cause,
                };
                warn!(
                    session = session.id,
                    gap_ms = gap.as_millis() as u64,
                    %severity,
                    %cause,
                    "Dropout detected"
                );
                self.sink.send(RunRecord::Dropout(event));
                let _ = self.event_bus.emit(CoreEvent::Device(DeviceEvent::Dropout {
                    device: device_id,
                    session: session.id,
                    gap_ms: gap.as_millis() as u64,
                    stall: severity == Severity::Stall,
                }));
            }
            Finding::Fault {
                kind,
                session,
                elapsed,
            } => {
                let offset = clock.offset_at(observed_at);
                let fault = DeviceFault {
                    seq: clock.next_seq(),
                    device_id: device_id.clone(),
                    role,
                    kind,
                    session,
                    timestamp: clock.timestamp(offset),
                    offset,
                    elapsed,
                };
                warn!(%kind, elapsed_ms = elapsed.as_millis() as u64, "Device fault");
                self.sink.send(RunRecord::Fault(fault));

                let event = match kind {
                    DeviceFaultKind::PersistentError => DeviceEvent::PersistentError {
                        device: device_id,
                        role: role.to_string(),
                        elapsed_ms: elapsed.as_millis() as u64,
                    },
                    DeviceFaultKind::Unreachable => DeviceEvent::Unreachable {
                        device: device_id,
                        role: role.to_string(),
                    },
                };
                let _ = self.event_bus.emit(CoreEvent::Device(event));
            }
        }
    }
}
