//! End-to-end runs of driver, monitors and aggregator against loopback
//! devices on virtual time.

use async_trait::async_trait;
use bridge_traits::TransmissionMode;
use core_devices::{FaultKind, LoopbackNetwork, Topology, TopologyResolver};
use core_playback::{
    canonical_tracks, DropoutCause, DropoutMonitor, DurationController, PlaybackDriver,
    ResultAggregator, RecordSink, RunClock, Severity, StopReason, StreamResolver, TestRunResult,
    Track, TrackList, TrackOutcome, Verdict, Warning,
};
use core_runtime::config::{DeviceSpec, DriverPolicy, DropoutPolicy, RunDuration};
use core_runtime::events::EventBus;
use core_session::{SessionError, StreamUri};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct FakeResolver {
    missing: HashSet<String>,
}

impl FakeResolver {
    fn all() -> Arc<Self> {
        Arc::new(Self {
            missing: HashSet::new(),
        })
    }

    fn without(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            missing: ids.iter().map(|id| id.to_string()).collect(),
        })
    }
}

#[async_trait]
impl StreamResolver for FakeResolver {
    async fn resolve_stream(&self, track: &Track) -> Result<StreamUri, SessionError> {
        if self.missing.contains(&track.id) {
            return Err(SessionError::TrackUnavailable {
                track_id: track.id.clone(),
                reason: "not available in region".to_string(),
            });
        }
        Ok(StreamUri::new(format!(
            "https://cdn.test/{}.flac?token=secret",
            track.id
        )))
    }
}

/// Stream service that takes `delay` to answer every request.
struct SlowResolver {
    delay: Duration,
}

#[async_trait]
impl StreamResolver for SlowResolver {
    async fn resolve_stream(&self, track: &Track) -> Result<StreamUri, SessionError> {
        tokio::time::sleep(self.delay).await;
        Ok(StreamUri::new(format!("https://cdn.test/{}.flac", track.id)))
    }
}

fn tracks(ids: &[&str], secs: u64) -> TrackList {
    let tracks = ids
        .iter()
        .map(|id| Track {
            id: id.to_string(),
            title: format!("Track {}", id),
            artist: None,
            duration: Duration::from_secs(secs),
            quality: "LOSSLESS".to_string(),
        })
        .collect();
    TrackList::new(tracks, None).unwrap()
}

struct Rig {
    network: LoopbackNetwork,
    topology: Arc<Topology>,
    bus: EventBus,
}

async fn rig(repeater: bool) -> Rig {
    let network = LoopbackNetwork::new();
    let resolver = TopologyResolver::new(network.clone());
    let bus = EventBus::new(1024);
    let repeater = if repeater {
        DeviceSpec::Local
    } else {
        DeviceSpec::Absent
    };

    let topology = Topology::connect(
        &resolver,
        &DeviceSpec::Local,
        &repeater,
        &DeviceSpec::Absent,
        bus.clone(),
    )
    .await
    .unwrap();
    topology.link(TransmissionMode::Unicast).await.unwrap();

    Rig {
        network,
        topology: Arc::new(topology),
        bus,
    }
}

impl Rig {
    fn device(&self, role: &str) -> Arc<core_devices::LoopbackDevice> {
        self.network
            .lookup(&format!("loopback://softplayer-{}", role))
            .unwrap()
    }

    fn controller(&self, duration: RunDuration) -> DurationController {
        DurationController::with_event_bus(duration, CancellationToken::new(), self.bus.clone())
    }

    async fn run(
        &self,
        resolver: Arc<dyn StreamResolver>,
        list: TrackList,
        controller: DurationController,
    ) -> TestRunResult {
        let policy = DropoutPolicy::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = RecordSink::new(tx, RunClock::start());
        let mut aggregator = ResultAggregator::new(rx);
        aggregator.set_track_list_version(list.version().map(str::to_string));

        let driver = PlaybackDriver::new(
            resolver,
            self.topology.clone(),
            TransmissionMode::Unicast,
            DriverPolicy::default(),
            policy.poll_interval,
            sink.clone(),
            self.bus.clone(),
        );
        let monitor_cancel = controller.cancel_token().child_token();
        let monitors = DropoutMonitor::new(
            policy,
            driver.sessions(),
            sink,
            self.bus.clone(),
            monitor_cancel.clone(),
        )
        .spawn(self.topology.active());

        let mut sequence = driver.play_sequence(list, controller.clone());
        while let Some(outcome) = sequence.next().await {
            aggregator.record_outcome(outcome);
        }
        assert!(sequence.take_error().is_none());

        monitor_cancel.cancel();
        monitors.join().await;
        let reason = controller.finish();
        aggregator.finalize(reason, controller.elapsed())
    }
}

fn track_ids(result: &TestRunResult) -> Vec<&str> {
    result.tracks.iter().map(|t| t.track_id()).collect()
}

#[tokio::test(start_paused = true)]
async fn sender_only_plays_every_track_without_dropouts() {
    let rig = rig(false).await;
    let list = tracks(&["a", "b", "c", "d", "e"], 30);

    let result = rig
        .run(FakeResolver::all(), list, rig.controller(RunDuration::seconds(300)))
        .await;

    assert_eq!(result.tracks_completed(), 5);
    assert_eq!(track_ids(&result), vec!["a", "b", "c", "d", "e"]);
    assert!(result.dropouts.is_empty());
    assert!(result.faults.is_empty());
    assert_eq!(result.verdict, Verdict::Pass);
    assert_eq!(result.stop_reason, StopReason::TracksExhausted);
    assert_eq!(result.sessions.len(), 5);

    // Gapless: only the first track needed an explicit play
    let commands = rig.device("sender").commands();
    assert_eq!(commands.iter().filter(|c| *c == "play").count(), 1);
    assert_eq!(commands.iter().filter(|c| *c == "queue_next").count(), 4);
}

#[tokio::test(start_paused = true)]
async fn repeater_interruption_is_one_stall() {
    let rig = rig(true).await;
    rig.device("repeater").inject_fault(
        FaultKind::StreamStall,
        Duration::from_secs(10),
        Duration::from_secs(2),
    );

    let result = rig
        .run(
            FakeResolver::all(),
            tracks(&["a", "b", "c"], 30),
            rig.controller(RunDuration::seconds(300)),
        )
        .await;

    assert_eq!(result.tracks_completed(), 3);
    assert_eq!(result.dropouts.len(), 1);
    let stall = &result.dropouts[0];
    assert_eq!(stall.device_id, "softplayer-repeater");
    assert_eq!(stall.severity, Severity::Stall);
    assert_eq!(stall.cause, DropoutCause::Buffering);
    assert_eq!(stall.session, 1);
    assert!(stall.gap >= Duration::from_millis(1750));
    assert_eq!(result.dropouts_for("softplayer-sender").count(), 0);
    assert_eq!(result.verdict, Verdict::Fail);
}

#[tokio::test(start_paused = true)]
async fn zero_duration_plays_nothing() {
    let rig = rig(false).await;

    let result = rig
        .run(
            FakeResolver::all(),
            tracks(&["a", "b"], 30),
            rig.controller(RunDuration::seconds(0)),
        )
        .await;

    assert!(result.tracks.is_empty());
    assert_eq!(result.verdict, Verdict::Pass);
    assert_eq!(result.warnings, vec![Warning::NoTracksPlayed]);
    assert_eq!(result.stop_reason, StopReason::Elapsed);
    assert!(rig.device("sender").commands().iter().all(|c| c != "play"));
}

#[tokio::test(start_paused = true)]
async fn forever_run_stops_promptly_on_cancel_and_keeps_events() {
    let rig = rig(true).await;
    let repeater = rig.device("repeater");
    repeater.inject_fault(FaultKind::StreamStall, Duration::from_secs(5), Duration::from_secs(2));
    // Still open when the run is cancelled
    repeater.inject_fault(FaultKind::StreamStall, Duration::from_secs(44), Duration::from_secs(10));

    let controller = rig.controller(RunDuration::Forever);
    let canceller = controller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(45)).await;
        canceller.cancel();
    });

    let result = rig
        .run(FakeResolver::all(), tracks(&["a", "b"], 10), controller.clone())
        .await;

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert!(controller.elapsed() <= Duration::from_secs(45) + DropoutPolicy::default().poll_interval);
    assert_eq!(track_ids(&result), vec!["a", "b", "a", "b", "a"]);
    assert_eq!(result.tracks_completed(), 4);
    assert!(matches!(result.tracks[4], TrackOutcome::Cancelled { .. }));

    assert_eq!(result.stalls().count(), 2);
    assert!(result.dropouts.iter().all(|e| e.device_id == "softplayer-repeater"));
    assert!(result.dropouts[0].offset < result.dropouts[1].offset);
    assert_eq!(result.verdict, Verdict::Fail);
}

#[tokio::test(start_paused = true)]
async fn canonical_list_runs_are_deterministic() {
    let first_rig = rig(false).await;
    let first = first_rig
        .run(
            FakeResolver::all(),
            canonical_tracks(),
            first_rig.controller(RunDuration::seconds(600)),
        )
        .await;

    let second_rig = rig(false).await;
    let second = second_rig
        .run(
            FakeResolver::all(),
            canonical_tracks(),
            second_rig.controller(RunDuration::seconds(600)),
        )
        .await;

    assert_eq!(track_ids(&first), vec!["58990486", "1570311"]);
    assert_eq!(track_ids(&first), track_ids(&second));
    assert_eq!(first.track_list_version.as_deref(), Some("v1"));
    assert_eq!(first.stop_reason, StopReason::Elapsed);
}

#[tokio::test(start_paused = true)]
async fn unavailable_track_is_skipped() {
    let rig = rig(false).await;

    let result = rig
        .run(
            FakeResolver::without(&["b"]),
            tracks(&["a", "b", "c"], 20),
            rig.controller(RunDuration::seconds(300)),
        )
        .await;

    assert_eq!(track_ids(&result), vec!["a", "b", "c"]);
    assert!(matches!(result.tracks[1], TrackOutcome::Skipped { .. }));
    assert_eq!(result.tracks_completed(), 2);
    assert!(result.dropouts.is_empty());
    assert!(result
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::TrackSkipped { track_id, .. } if track_id == "b")));
    assert_eq!(result.verdict, Verdict::Pass);
}

#[tokio::test(start_paused = true)]
async fn unreachable_repeater_leaves_the_run() {
    let rig = rig(true).await;
    rig.device("repeater").inject_fault(
        FaultKind::Unreachable,
        Duration::from_secs(5),
        Duration::from_secs(600),
    );

    let result = rig
        .run(
            FakeResolver::all(),
            tracks(&["a", "b"], 30),
            rig.controller(RunDuration::seconds(300)),
        )
        .await;

    assert!(matches!(result.tracks[0], TrackOutcome::Aborted { .. }));
    assert!(result.tracks[1].is_completed());
    assert_eq!(result.faults.len(), 1);
    assert_eq!(result.faults[0].device_id, "softplayer-repeater");

    // The open interruption is flushed as a stall
    assert_eq!(result.stalls().count(), 1);
    assert_eq!(result.dropouts[0].cause, DropoutCause::Unreachable);

    // Later sessions no longer include the repeater
    assert!(!result.sessions[1]
        .participants
        .contains(&"softplayer-repeater".to_string()));
    assert!(!rig.topology.repeater().is_active());
    assert_eq!(result.verdict, Verdict::Fail);
}

#[tokio::test(start_paused = true)]
async fn unreachable_sender_stops_the_run() {
    let rig = rig(false).await;
    rig.device("sender").inject_fault(
        FaultKind::Unreachable,
        Duration::from_secs(5),
        Duration::from_secs(600),
    );

    let result = rig
        .run(
            FakeResolver::all(),
            tracks(&["a", "b"], 30),
            rig.controller(RunDuration::seconds(300)),
        )
        .await;

    assert_eq!(result.stop_reason, StopReason::SenderUnreachable);
    assert_eq!(result.tracks.len(), 1);
    assert!(matches!(result.tracks[0], TrackOutcome::Aborted { .. }));
    assert_eq!(result.verdict, Verdict::Fail);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_stream_resolution_is_prompt() {
    let rig = rig(false).await;
    let controller = rig.controller(RunDuration::Forever);
    let canceller = controller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        canceller.cancel();
    });

    let resolver = Arc::new(SlowResolver {
        delay: Duration::from_secs(5),
    });
    let result = rig
        .run(resolver, tracks(&["a", "b"], 30), controller.clone())
        .await;

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert!(controller.elapsed() <= Duration::from_secs(2) + DropoutPolicy::default().poll_interval);
    assert!(result.tracks.is_empty());
    assert!(rig.device("sender").commands().iter().all(|c| c != "play"));
}

#[tokio::test(start_paused = true)]
async fn cancel_while_preparing_next_track_is_prompt() {
    let rig = rig(false).await;
    let controller = rig.controller(RunDuration::Forever);
    let canceller = controller.clone();
    // "a" plays from 5 s; "b" is being resolved until 10 s
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        canceller.cancel();
    });

    let resolver = Arc::new(SlowResolver {
        delay: Duration::from_secs(5),
    });
    let result = rig
        .run(resolver, tracks(&["a", "b"], 30), controller.clone())
        .await;

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert!(controller.elapsed() <= Duration::from_secs(7) + DropoutPolicy::default().poll_interval);
    assert_eq!(track_ids(&result), vec!["a"]);
    assert!(matches!(result.tracks[0], TrackOutcome::Cancelled { .. }));
    assert_eq!(result.warnings, vec![Warning::NoTracksPlayed]);
}
