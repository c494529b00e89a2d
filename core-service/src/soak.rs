//! # Soak Run Orchestration
//!
//! [`SoakTest`] wires one run together:
//!
//! 1. log in to the streaming service
//! 2. select the track list
//! 3. connect and link Sender, Repeater and Slave
//! 4. drive playback while one monitor task per device watches for dropouts
//! 5. join the monitors, drain the record queue and compute the verdict
//!
//! Devices and the service session are released on every path out of
//! [`SoakTest::run`], including fatal errors.

use bridge_traits::{DeviceResolver, StreamingService};
use core_devices::{LoopbackNetwork, Topology, TopologyResolver};
use core_playback::{
    DropoutMonitor, DurationController, PlaybackDriver, RecordSink, ResultAggregator, RunClock,
    TestRunResult, TrackList, TrackSelector,
};
use core_runtime::config::SoakConfig;
use core_runtime::events::{CoreEvent, EventBus, RunEvent};
use core_session::{Session, SessionManager};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::Result;

pub struct SoakTest {
    config: SoakConfig,
    service: Arc<dyn StreamingService>,
    remote: Option<Arc<dyn DeviceResolver>>,
    loopback: LoopbackNetwork,
    event_bus: EventBus,
    cancel: CancellationToken,
}

impl SoakTest {
    pub fn new(config: SoakConfig, service: Arc<dyn StreamingService>) -> Self {
        let event_bus = EventBus::new(config.event_buffer);
        Self {
            config,
            service,
            remote: None,
            loopback: LoopbackNetwork::new(),
            event_bus,
            cancel: CancellationToken::new(),
        }
    }

    /// Resolver for DUT identifiers other than `local` and `None`.
    pub fn with_remote_resolver(mut self, resolver: Arc<dyn DeviceResolver>) -> Self {
        self.remote = Some(resolver);
        self
    }

    /// Share a loopback network, e.g. to inject faults into `local` devices.
    pub fn with_loopback(mut self, network: LoopbackNetwork) -> Self {
        self.loopback = network;
        self
    }

    /// Stop the run when `cancel` fires.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SoakConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Carry out the run.
    ///
    /// # Errors
    ///
    /// Only for runs that could not produce a verdict: invalid
    /// configuration, rejected credentials, an unreachable service, a
    /// catalog too small for the requested count, or a sender that cannot be
    /// connected.
    #[instrument(skip(self), fields(
        sender = %self.config.sender,
        repeater = %self.config.repeater,
        slave = %self.config.slave,
        duration = %self.config.duration,
        mode = %self.config.mode,
    ))]
    pub async fn run(self) -> Result<TestRunResult> {
        self.config.validate()?;

        let manager = SessionManager::new(self.service.clone(), self.event_bus.clone());
        let guard = manager.authenticate(self.config.credentials.clone()).await?;

        let outcome = self.run_authenticated(guard.session()).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Streaming session release failed");
        }

        let result = outcome?;
        info!(
            verdict = %result.verdict,
            stop_reason = %result.stop_reason,
            dropouts = result.dropouts.len(),
            faults = result.faults.len(),
            tracks = result.tracks_completed(),
            "Soak run finished"
        );
        let _ = self.event_bus.emit(CoreEvent::Run(RunEvent::Finished {
            verdict: result.verdict.to_string(),
            dropouts: result.dropouts.len(),
            tracks_played: result.tracks_completed(),
        }));
        Ok(result)
    }

    async fn run_authenticated(&self, session: Session) -> Result<TestRunResult> {
        let tracks = TrackSelector::new(Arc::new(session.clone()))
            .select_tracks(self.config.track_count)
            .await?;

        let topology = Arc::new(self.connect_topology().await?);
        let outcome = self.play(session, tracks, topology.clone()).await;
        topology.release_all().await;
        outcome
    }

    async fn connect_topology(&self) -> Result<Topology> {
        let mut resolver = TopologyResolver::new(self.loopback.clone());
        if let Some(remote) = &self.remote {
            resolver = resolver.with_remote(remote.clone());
        }

        let topology = Topology::connect(
            &resolver,
            &self.config.sender,
            &self.config.repeater,
            &self.config.slave,
            self.event_bus.clone(),
        )
        .await?;

        if let Err(e) = topology.link(self.config.mode).await {
            topology.release_all().await;
            return Err(e.into());
        }
        Ok(topology)
    }

    async fn play(
        &self,
        session: Session,
        tracks: TrackList,
        topology: Arc<Topology>,
    ) -> Result<TestRunResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = RecordSink::new(tx, RunClock::start());
        let mut aggregator = ResultAggregator::new(rx);
        aggregator.set_track_list_version(tracks.version().map(str::to_string));
        for device in topology.dropped() {
            sink.device_dropped(&device);
        }

        let controller = DurationController::with_event_bus(
            self.config.duration,
            self.cancel.clone(),
            self.event_bus.clone(),
        );
        let driver = PlaybackDriver::new(
            Arc::new(session),
            topology.clone(),
            self.config.mode,
            self.config.driver.clone(),
            self.config.dropout.poll_interval,
            sink.clone(),
            self.event_bus.clone(),
        );

        let monitor_cancel = controller.cancel_token().child_token();
        let monitors = DropoutMonitor::new(
            self.config.dropout.clone(),
            driver.sessions(),
            sink,
            self.event_bus.clone(),
            monitor_cancel.clone(),
        )
        .spawn(topology.active());

        let mut sequence = driver.play_sequence(tracks, controller.clone());
        while let Some(outcome) = sequence.next().await {
            aggregator.record_outcome(outcome);
        }
        let fatal = sequence.take_error();
        drop(sequence);

        monitor_cancel.cancel();
        monitors.join().await;
        let stop_reason = controller.finish();
        let result = aggregator.finalize(stop_reason, controller.elapsed());

        match fatal {
            Some(e) => {
                warn!(
                    dropouts = result.dropouts.len(),
                    "Run ended by a fatal error, partial result discarded"
                );
                Err(e.into())
            }
            None => Ok(result),
        }
    }
}
