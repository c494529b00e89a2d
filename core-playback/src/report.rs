//! # Result Aggregation
//!
//! Collects everything the driver and the monitors queued during a run and
//! turns it into a [`TestRunResult`].
//!
//! Dropouts are checked against the session they claim: the session must be
//! known, the device must be one of its participants, and the event must fall
//! between the session's start and its end. Violators are dropped with a
//! warning log.
//!
//! ## Verdict
//!
//! - `Fail` when any dropout is a `Stall` or any device fault was recorded
//! - `Pass` otherwise; glitches, skipped and aborted tracks become warnings

use crate::duration::StopReason;
use crate::types::{
    duration_ms, DeviceFault, DropoutEvent, RunRecord, SessionRecord, Severity, TrackOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        *self == Verdict::Pass
    }

    /// Process exit status for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Findings that do not fail a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Warning {
    NoTracksPlayed,
    Glitch {
        device_id: String,
        session: u64,
        #[serde(with = "duration_ms")]
        gap: Duration,
    },
    TrackSkipped { track_id: String, reason: String },
    TrackAborted { track_id: String, reason: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::NoTracksPlayed => write!(f, "no track was played"),
            Warning::Glitch {
                device_id,
                session,
                gap,
            } => write!(
                f,
                "glitch of {}ms on {} in session {}",
                gap.as_millis(),
                device_id,
                session
            ),
            Warning::TrackSkipped { track_id, reason } => {
                write!(f, "track {} skipped: {}", track_id, reason)
            }
            Warning::TrackAborted { track_id, reason } => {
                write!(f, "track {} aborted: {}", track_id, reason)
            }
        }
    }
}

/// Outcome of one soak run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub verdict: Verdict,
    pub stop_reason: StopReason,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Set when the canonical list was played
    pub track_list_version: Option<String>,
    pub tracks: Vec<TrackOutcome>,
    /// Ordered by run offset, then sequence number
    pub dropouts: Vec<DropoutEvent>,
    pub faults: Vec<DeviceFault>,
    pub sessions: Vec<SessionRecord>,
    pub warnings: Vec<Warning>,
    /// Dropouts rejected as orphaned
    pub discarded: usize,
}

impl TestRunResult {
    pub fn stalls(&self) -> impl Iterator<Item = &DropoutEvent> {
        self.dropouts
            .iter()
            .filter(|event| event.severity == Severity::Stall)
    }

    pub fn glitches(&self) -> impl Iterator<Item = &DropoutEvent> {
        self.dropouts
            .iter()
            .filter(|event| event.severity == Severity::Glitch)
    }

    pub fn dropouts_for<'a>(&'a self, device_id: &'a str) -> impl Iterator<Item = &'a DropoutEvent> + 'a {
        self.dropouts
            .iter()
            .filter(move |event| event.device_id == device_id)
    }

    /// Tracks that played to the end.
    pub fn tracks_completed(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_completed()).count()
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for TestRunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = |label: &str| self.tracks.iter().filter(|t| t.label() == label).count();

        writeln!(f, "Dropout soak result: {}", self.verdict)?;
        writeln!(f, "  stop reason : {}", self.stop_reason)?;
        writeln!(f, "  elapsed     : {:.1}s", self.elapsed.as_secs_f64())?;
        if let Some(version) = &self.track_list_version {
            writeln!(f, "  track list  : canonical {}", version)?;
        }
        writeln!(
            f,
            "  tracks      : {} completed, {} skipped, {} aborted, {} cancelled",
            count("completed"),
            count("skipped"),
            count("aborted"),
            count("cancelled")
        )?;
        writeln!(
            f,
            "  dropouts    : {} stalls, {} glitches",
            self.stalls().count(),
            self.glitches().count()
        )?;
        writeln!(f, "  faults      : {}", self.faults.len())?;

        if !self.dropouts.is_empty() {
            writeln!(f, "Dropouts:")?;
            for event in &self.dropouts {
                writeln!(
                    f,
                    "  [{:>9.3}s] #{} {} session {} track {}: {} {}ms ({})",
                    event.offset.as_secs_f64(),
                    event.seq,
                    event.device_label,
                    event.session,
                    event.track_id,
                    event.severity,
                    event.gap.as_millis(),
                    event.cause
                )?;
            }
        }

        if !self.faults.is_empty() {
            writeln!(f, "Faults:")?;
            for fault in &self.faults {
                writeln!(
                    f,
                    "  [{:>9.3}s] #{} {} ({}): {} after {}ms",
                    fault.offset.as_secs_f64(),
                    fault.seq,
                    fault.device_id,
                    fault.role,
                    fault.kind,
                    fault.elapsed.as_millis()
                )?;
            }
        }

        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {}", warning)?;
            }
        }
        Ok(())
    }
}

/// Consumer side of the run's record queue.
pub struct ResultAggregator {
    records: mpsc::UnboundedReceiver<RunRecord>,
    sessions: BTreeMap<u64, SessionRecord>,
    dropouts: Vec<DropoutEvent>,
    faults: Vec<DeviceFault>,
    tracks: Vec<TrackOutcome>,
    track_list_version: Option<String>,
}

impl ResultAggregator {
    pub fn new(records: mpsc::UnboundedReceiver<RunRecord>) -> Self {
        Self {
            records,
            sessions: BTreeMap::new(),
            dropouts: Vec::new(),
            faults: Vec::new(),
            tracks: Vec::new(),
            track_list_version: None,
        }
    }

    pub fn set_track_list_version(&mut self, version: Option<String>) {
        self.track_list_version = version;
    }

    pub fn record_outcome(&mut self, outcome: TrackOutcome) {
        self.tracks.push(outcome);
    }

    /// Take whatever is queued right now.
    pub fn drain(&mut self) -> usize {
        let mut taken = 0;
        while let Ok(record) = self.records.try_recv() {
            self.apply(record);
            taken += 1;
        }
        taken
    }

    fn apply(&mut self, record: RunRecord) {
        match record {
            RunRecord::Dropout(event) => self.dropouts.push(event),
            RunRecord::Fault(fault) => self.faults.push(fault),
            RunRecord::SessionOpened(session) => {
                self.sessions.insert(session.id, session);
            }
            RunRecord::SessionClosed {
                id,
                end_offset,
                outcome,
            } => match self.sessions.get_mut(&id) {
                Some(session) => {
                    session.end_offset = Some(end_offset);
                    session.outcome = Some(outcome);
                }
                None => warn!(session = id, "Close for unknown session"),
            },
        }
    }

    /// Close the queue, take the remaining records and build the result.
    ///
    /// Every producer must have stopped; later records are refused.
    pub fn finalize(mut self, stop_reason: StopReason, elapsed: Duration) -> TestRunResult {
        self.records.close();
        self.drain();

        let (mut dropouts, rejected): (Vec<_>, Vec<_>) = std::mem::take(&mut self.dropouts)
            .into_iter()
            .partition(|event| self.is_attributed(event));
        for event in &rejected {
            warn!(
                seq = event.seq,
                device = %event.device_id,
                session = event.session,
                "Discarding dropout outside its session"
            );
        }
        dropouts.sort_by_key(|event| (event.offset, event.seq));

        let mut faults = self.faults;
        faults.sort_by_key(|fault| (fault.offset, fault.seq));

        let mut warnings = Vec::new();
        if !self.tracks.iter().any(TrackOutcome::is_completed) {
            warnings.push(Warning::NoTracksPlayed);
        }
        for event in dropouts.iter().filter(|e| e.severity == Severity::Glitch) {
            warnings.push(Warning::Glitch {
                device_id: event.device_id.clone(),
                session: event.session,
                gap: event.gap,
            });
        }
        for outcome in &self.tracks {
            match outcome {
                TrackOutcome::Skipped { track_id, reason } => warnings.push(Warning::TrackSkipped {
                    track_id: track_id.clone(),
                    reason: reason.clone(),
                }),
                TrackOutcome::Aborted {
                    track_id, reason, ..
                } => warnings.push(Warning::TrackAborted {
                    track_id: track_id.clone(),
                    reason: reason.clone(),
                }),
                _ => {}
            }
        }

        let failed = !faults.is_empty() || dropouts.iter().any(|e| e.severity == Severity::Stall);
        let verdict = if failed { Verdict::Fail } else { Verdict::Pass };

        info!(
            %verdict,
            %stop_reason,
            dropouts = dropouts.len(),
            faults = faults.len(),
            discarded = rejected.len(),
            "Run result finalized"
        );
        debug!(sessions = self.sessions.len(), tracks = self.tracks.len(), "Aggregated records");

        TestRunResult {
            verdict,
            stop_reason,
            elapsed,
            track_list_version: self.track_list_version,
            tracks: self.tracks,
            dropouts,
            faults,
            sessions: self.sessions.into_values().collect(),
            warnings,
            discarded: rejected.len(),
        }
    }

    fn is_attributed(&self, event: &DropoutEvent) -> bool {
        self.sessions.get(&event.session).is_some_and(|session| {
            session.is_participant(&event.device_id)
                && event.offset >= session.start_offset
                && session.end_offset.map_or(true, |end| event.offset <= end)
        })
    }
}
