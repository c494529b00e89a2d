//! # Playback Driver
//!
//! Walks the track list on the sender, one playback session per track.
//!
//! ## Per track
//!
//! 1. Resolve the stream. An unavailable track is skipped; a session-level
//!    failure ends the sequence and is kept for [`TrackSequence::take_error`].
//! 2. Play it on the sender, unless the sender already moved onto it from the
//!    queue. Publish the new [`PlaybackSession`].
//! 3. Queue the following track so the sender can move on without a gap. If
//!    queueing fails the next track is played explicitly instead.
//! 4. Wait until the sender moves to the queued track or stops at the end,
//!    a participant is reported unreachable, the track overruns, or the run
//!    is cancelled.
//!
//! Every service and device call is raced against cancellation, so a slow
//! request never holds up the stop.
//!
//! The driver is the only component that sends transport commands.

use crate::duration::{DurationController, StopReason};
use crate::error::PlaybackError;
use crate::types::{PlaybackSession, RecordSink, RunRecord, SessionRecord, Track, TrackList, TrackOutcome};
use async_trait::async_trait;
use bridge_traits::{PlaybackState, StreamItem, TransmissionMode};
use core_devices::Topology;
use core_runtime::config::DriverPolicy;
use core_runtime::events::{CoreEvent, DeviceEvent, EventBus, PlaybackEvent, RecvError};
use core_session::{Session, SessionError, StreamUri};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Resolves playable URIs for tracks.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve_stream(&self, track: &Track) -> Result<StreamUri, SessionError>;
}

#[async_trait]
impl StreamResolver for Session {
    async fn resolve_stream(&self, track: &Track) -> Result<StreamUri, SessionError> {
        Session::resolve_stream(self, &track.id).await
    }
}

pub struct PlaybackDriver {
    resolver: Arc<dyn StreamResolver>,
    topology: Arc<Topology>,
    mode: TransmissionMode,
    policy: DriverPolicy,
    poll_interval: Duration,
    sessions: watch::Sender<Option<Arc<PlaybackSession>>>,
    sink: RecordSink,
    event_bus: EventBus,
}

impl PlaybackDriver {
    pub fn new(
        resolver: Arc<dyn StreamResolver>,
        topology: Arc<Topology>,
        mode: TransmissionMode,
        policy: DriverPolicy,
        poll_interval: Duration,
        sink: RecordSink,
        event_bus: EventBus,
    ) -> Self {
        let (sessions, _) = watch::channel(None);
        Self {
            resolver,
            topology,
            mode,
            policy,
            poll_interval,
            sessions,
            sink,
            event_bus,
        }
    }

    /// Follow the active playback session. `None` between sessions.
    pub fn sessions(&self) -> watch::Receiver<Option<Arc<PlaybackSession>>> {
        self.sessions.subscribe()
    }

    /// Start walking `tracks`. Nothing happens until the first
    /// [`TrackSequence::next`].
    pub fn play_sequence(&self, tracks: TrackList, controller: DurationController) -> TrackSequence<'_> {
        let looping = self
            .policy
            .loop_tracks
            .unwrap_or_else(|| controller.duration().is_forever());

        TrackSequence {
            driver: self,
            tracks,
            controller,
            looping,
            cursor: 0,
            played_this_pass: 0,
            consecutive_failures: 0,
            session_counter: 0,
            prepared: None,
            advanced: None,
            device_events: self.event_bus.subscribe(),
            bus_open: true,
            error: None,
            done: false,
        }
    }

    fn publish(&self, session: Option<Arc<PlaybackSession>>) {
        self.sessions.send_replace(session);
    }
}

/// Next track, resolved ahead of time.
struct Prepared {
    index: usize,
    item: StreamItem,
    /// Handed to the sender with `queue_next`
    queued: bool,
}

/// Track the sender moved onto by itself.
struct Advanced {
    index: usize,
    item: StreamItem,
    at: Instant,
}

enum WaitEnd {
    Advanced { at: Instant },
    Finished,
    DeviceLost { device: String },
    SenderLost,
    Overrun,
    Cancelled,
}

/// Async iterator over track outcomes.
pub struct TrackSequence<'a> {
    driver: &'a PlaybackDriver,
    tracks: TrackList,
    controller: DurationController,
    looping: bool,
    cursor: usize,
    played_this_pass: usize,
    consecutive_failures: u32,
    session_counter: u64,
    prepared: Option<Prepared>,
    advanced: Option<Advanced>,
    device_events: broadcast::Receiver<CoreEvent>,
    bus_open: bool,
    error: Option<PlaybackError>,
    done: bool,
}

impl<'a> TrackSequence<'a> {
    pub fn controller(&self) -> &DurationController {
        &self.controller
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// The fatal error that ended the sequence, if any.
    pub fn take_error(&mut self) -> Option<PlaybackError> {
        self.error.take()
    }

    /// Play the next track and report how it ended. `None` once the run is
    /// stopping or the list is used up.
    pub async fn next(&mut self) -> Option<TrackOutcome> {
        if self.done {
            return None;
        }
        if !self.controller.may_start_track() {
            return self.finish().await;
        }
        let Some(index) = self.next_index() else {
            self.controller.request_stop(StopReason::TracksExhausted);
            return self.finish().await;
        };
        let track = self.tracks.get(index)?.clone();

        let driver = self.driver;
        let (item, playing_since) = match self.take_ready(index) {
            Some(ready) => ready,
            None => match self.unless_cancelled(driver.resolver.resolve_stream(&track)).await {
                None => return self.finish().await,
                Some(Ok(uri)) => (track.stream_item(&uri), None),
                Some(Err(e)) if !e.is_fatal() => return Some(self.skip(&track, e)),
                Some(Err(e)) => {
                    error!(track_id = %track.id, error = %e, "Stream resolution failed");
                    self.controller.request_stop(StopReason::Fatal);
                    self.error = Some(e.into());
                    return self.finish().await;
                }
            },
        };

        self.played_this_pass += 1;
        self.session_counter += 1;
        let session_id = self.session_counter;

        let started_at = match playing_since {
            Some(at) => at,
            None => match self.unless_cancelled(driver.topology.sender().play(&item)).await {
                None => return self.finish().await,
                Some(Err(e)) => return Some(self.abort_unstarted(session_id, track, e.to_string())),
                Some(Ok(())) => Instant::now(),
            },
        };

        let session = Arc::new(self.open_session(session_id, track, started_at));
        self.prequeue(&session).await;

        let end = self.wait_for_completion(&session).await;
        Some(self.close_session(&session, end))
    }

    /// `None` when the run is cancelled before `fut` completes.
    async fn unless_cancelled<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.controller.cancelled() => None,
            value = fut => Some(value),
        }
    }

    fn next_index(&mut self) -> Option<usize> {
        if self.cursor >= self.tracks.len() {
            // A full pass with nothing playable would spin forever
            if !self.looping || self.played_this_pass == 0 {
                return None;
            }
            self.cursor = 0;
            self.played_this_pass = 0;
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(index)
    }

    fn peek_index(&self) -> Option<usize> {
        if self.cursor < self.tracks.len() {
            Some(self.cursor)
        } else if self.looping {
            Some(0)
        } else {
            None
        }
    }

    /// A stream already resolved (and possibly playing) for `index`.
    fn take_ready(&mut self, index: usize) -> Option<(StreamItem, Option<Instant>)> {
        if let Some(advanced) = self.advanced.take() {
            if advanced.index == index {
                return Some((advanced.item, Some(advanced.at)));
            }
        }
        match self.prepared.take() {
            Some(prepared) if prepared.index == index => Some((prepared.item, None)),
            _ => None,
        }
    }

    fn skip(&mut self, track: &Track, error: SessionError) -> TrackOutcome {
        warn!(track_id = %track.id, error = %error, "Track unavailable, skipping");
        let reason = error.to_string();
        let _ = self
            .driver
            .event_bus
            .emit(CoreEvent::Playback(PlaybackEvent::TrackSkipped {
                track_id: track.id.clone(),
                reason: reason.clone(),
            }));
        TrackOutcome::Skipped {
            track_id: track.id.clone(),
            reason,
        }
    }

    fn open_session(&self, id: u64, track: Track, started_at: Instant) -> PlaybackSession {
        let next_track = self
            .peek_index()
            .and_then(|index| self.tracks.get(index))
            .cloned();
        let participants = self
            .driver
            .topology
            .active()
            .iter()
            .map(|handle| handle.id().to_string())
            .collect();

        let session = PlaybackSession {
            id,
            track,
            next_track,
            mode: self.driver.mode,
            participants,
            started_at,
            start_offset: self.driver.sink.clock().offset_at(started_at),
        };

        info!(
            session = id,
            track_id = %session.track.id,
            participants = ?session.participants,
            "Playback session opened"
        );
        self.driver.sink.send(RunRecord::SessionOpened(SessionRecord::opened(&session)));
        let _ = self
            .driver
            .event_bus
            .emit(CoreEvent::Playback(PlaybackEvent::TrackStarted {
                session: id,
                track_id: session.track.id.clone(),
                title: session.track.display_title(),
                mode: session.mode.to_string(),
            }));
        session
    }

    /// Resolve and queue the following track on the sender.
    async fn prequeue(&mut self, session: &Arc<PlaybackSession>) {
        self.driver.publish(Some(session.clone()));

        if !self.controller.may_start_track() {
            return;
        }
        // The run ends with this track; nothing should follow it
        if matches!(self.controller.remaining(), Some(left) if left <= session.track.duration) {
            return;
        }
        let Some(index) = self.peek_index() else {
            return;
        };
        let Some(next) = self.tracks.get(index) else {
            return;
        };
        // A repeat of the same id could not be told apart from the current track
        if next.id == session.track.id {
            return;
        }

        let driver = self.driver;
        let item = match self.unless_cancelled(driver.resolver.resolve_stream(next)).await {
            None => return,
            Some(Ok(uri)) => next.stream_item(&uri),
            Some(Err(e)) => {
                // Dealt with when the track's turn comes
                debug!(track_id = %next.id, error = %e, "Next track not prepared");
                return;
            }
        };

        let queued = match self.unless_cancelled(driver.topology.sender().queue_next(&item)).await {
            None => return,
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(track_id = %item.track_id, error = %e, "Queueing failed, next track will be played explicitly");
                false
            }
        };
        self.prepared = Some(Prepared {
            index,
            item,
            queued,
        });
    }

    #[instrument(skip_all, fields(session = session.id, track_id = %session.track.id))]
    async fn wait_for_completion(&mut self, session: &Arc<PlaybackSession>) -> WaitEnd {
        let deadline = session.started_at + session.track.duration + self.driver.policy.completion_grace;
        let queued_id = self
            .prepared
            .as_ref()
            .filter(|prepared| prepared.queued)
            .map(|prepared| prepared.item.track_id.clone());

        let mut ticker = interval(self.driver.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seen_playing = false;

        loop {
            tokio::select! {
                biased;
                _ = self.controller.cancelled() => return WaitEnd::Cancelled,
                event = self.device_events.recv(), if self.bus_open => match event {
                    Ok(CoreEvent::Device(DeviceEvent::Unreachable { device, .. }))
                        if session.is_participant(&device) =>
                    {
                        return self.device_lost(device);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Driver lagged behind device events");
                    }
                    Err(RecvError::Closed) => self.bus_open = false,
                },
                _ = sleep_until(deadline) => return WaitEnd::Overrun,
                _ = ticker.tick() => {
                    let sender = self.driver.topology.sender();
                    let sample = async { (sender.playback_state().await, sender.stream_position().await) };
                    let (state, position) = match self.unless_cancelled(sample).await {
                        None => return WaitEnd::Cancelled,
                        Some((Ok(state), Ok(position))) => (state, position),
                        Some(_) => continue,
                    };

                    if queued_id.is_some() && position.track_id == queued_id {
                        let now = Instant::now();
                        let at = now.checked_sub(position.offset).unwrap_or(now);
                        return WaitEnd::Advanced { at };
                    }
                    match state {
                        PlaybackState::Playing => seen_playing = true,
                        PlaybackState::Stopped if seen_playing => return WaitEnd::Finished,
                        _ => {}
                    }
                }
            }
        }
    }

    fn device_lost(&mut self, device: String) -> WaitEnd {
        let topology = &self.driver.topology;
        if let Some(handle) = topology.find(&device) {
            handle.deactivate();
        }
        if topology.sender().id() == device {
            self.controller.request_stop(StopReason::SenderUnreachable);
            WaitEnd::SenderLost
        } else {
            WaitEnd::DeviceLost { device }
        }
    }

    fn close_session(&mut self, session: &Arc<PlaybackSession>, end: WaitEnd) -> TrackOutcome {
        let track_id = session.track.id.clone();
        let now = Instant::now();

        let outcome = match end {
            WaitEnd::Advanced { at } => {
                if let Some(prepared) = self.prepared.take() {
                    self.advanced = Some(Advanced {
                        index: prepared.index,
                        item: prepared.item,
                        at,
                    });
                }
                TrackOutcome::Completed {
                    session: session.id,
                    track_id,
                    played: at.saturating_duration_since(session.started_at),
                }
            }
            WaitEnd::Finished => TrackOutcome::Completed {
                session: session.id,
                track_id,
                played: now.saturating_duration_since(session.started_at),
            },
            WaitEnd::DeviceLost { device } => TrackOutcome::Aborted {
                session: session.id,
                track_id,
                reason: format!("device {} unreachable", device),
            },
            WaitEnd::SenderLost => TrackOutcome::Aborted {
                session: session.id,
                track_id,
                reason: "sender unreachable".to_string(),
            },
            WaitEnd::Overrun => TrackOutcome::Aborted {
                session: session.id,
                track_id,
                reason: format!(
                    "no completion within {}s",
                    (session.track.duration + self.driver.policy.completion_grace).as_secs()
                ),
            },
            WaitEnd::Cancelled => TrackOutcome::Cancelled {
                session: session.id,
                track_id,
            },
        };

        // Anything queued behind an unfinished track is played explicitly
        if !outcome.is_completed() || self.advanced.is_none() {
            if let Some(prepared) = self.prepared.as_mut() {
                prepared.queued = false;
            }
        }
        if self.advanced.is_none() {
            self.driver.publish(None);
        }

        // Read after unpublishing: no sample of this session is stamped later
        let end_offset = self.driver.sink.clock().offset();
        self.driver.sink.send(RunRecord::SessionClosed {
            id: session.id,
            end_offset,
            outcome: outcome.label().to_string(),
        });
        self.record_outcome(&outcome);
        outcome
    }

    /// The sender refused the track; no session was published.
    fn abort_unstarted(&mut self, session_id: u64, track: Track, reason: String) -> TrackOutcome {
        warn!(track_id = %track.id, %reason, "Sender rejected track");
        let offset = self.driver.sink.clock().offset();
        let mut record = SessionRecord::opened(&PlaybackSession {
            id: session_id,
            next_track: None,
            mode: self.driver.mode,
            participants: Vec::new(),
            started_at: Instant::now(),
            start_offset: offset,
            track,
        });
        record.end_offset = Some(offset);
        record.outcome = Some("aborted".to_string());
        let track_id = record.track_id.clone();
        self.driver.sink.send(RunRecord::SessionOpened(record));

        let outcome = TrackOutcome::Aborted {
            session: session_id,
            track_id,
            reason,
        };
        self.record_outcome(&outcome);
        outcome
    }

    fn record_outcome(&mut self, outcome: &TrackOutcome) {
        let event = match outcome {
            TrackOutcome::Completed {
                session,
                track_id,
                played,
            } => {
                self.consecutive_failures = 0;
                info!(session, %track_id, played_ms = played.as_millis() as u64, "Track completed");
                PlaybackEvent::TrackCompleted {
                    session: *session,
                    track_id: track_id.clone(),
                    played_ms: played.as_millis() as u64,
                }
            }
            TrackOutcome::Aborted {
                session,
                track_id,
                reason,
            } => {
                self.consecutive_failures += 1;
                warn!(session, %track_id, %reason, failures = self.consecutive_failures, "Track aborted");
                if self.consecutive_failures >= self.driver.policy.max_consecutive_failures {
                    self.controller.request_stop(StopReason::TooManyFailures);
                }
                PlaybackEvent::TrackAborted {
                    session: *session,
                    track_id: track_id.clone(),
                    reason: reason.clone(),
                }
            }
            TrackOutcome::Cancelled { session, track_id } => PlaybackEvent::TrackCancelled {
                session: *session,
                track_id: track_id.clone(),
            },
            TrackOutcome::Skipped { .. } => return,
        };
        let _ = self.driver.event_bus.emit(CoreEvent::Playback(event));
    }

    async fn finish(&mut self) -> Option<TrackOutcome> {
        self.done = true;
        self.driver.publish(None);
        self.prepared = None;
        self.advanced = None;

        let sender = self.driver.topology.sender();
        if sender.is_active() {
            if let Err(e) = sender.stop().await {
                warn!(error = %e, "Stopping sender failed");
            }
        }
        info!(reason = ?self.controller.stop_reason(), "Track sequence finished");
        None
    }
}
