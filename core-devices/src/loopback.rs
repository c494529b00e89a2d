//! # Loopback SoftPlayer
//!
//! In-process player selected by the `local` DUT identifier.
//!
//! ## Overview
//!
//! A [`LoopbackDevice`] keeps a virtual timeline instead of decoding audio:
//! the current item started at some instant, and its offset is the wall time
//! elapsed since then minus any time the stream was stalled. Items queued with
//! `queue_next` take over exactly when the current one ends, so a sender walks
//! a track list gaplessly without anybody polling it.
//!
//! Receivers follow another loopback device found through the shared
//! [`LoopbackNetwork`] and mirror its live position (without a track id, the
//! way real receivers report).
//!
//! Faults are scheduled up front with [`LoopbackDevice::inject_fault`]:
//!
//! | Fault | Sender | Receiver |
//! |-------|--------|----------|
//! | `StreamStall` | `Buffering`, position frozen | `Buffering`, position frozen |
//! | `Error` | `Error`, position frozen | `Error`, position frozen |
//! | `Unreachable` | control calls fail, audio continues | control calls fail |
//!
//! All time comes from `tokio::time::Instant`, so tests can drive hours of
//! playback with a paused clock.

use bridge_traits::{
    BridgeError, DeviceControl, PlaybackState, SenderInfo, StreamItem, StreamPosition,
    TransmissionMode,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// URI scheme of loopback sender addresses.
pub const LOOPBACK_SCHEME: &str = "loopback://";

// ============================================================================
// Network
// ============================================================================

/// Registry that lets loopback receivers find the device they follow.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    devices: Arc<Mutex<HashMap<String, Weak<LoopbackDevice>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device reachable at `loopback://{name}`.
    pub fn spawn_device(&self, name: impl Into<String>) -> Arc<LoopbackDevice> {
        let name = name.into();
        let device = Arc::new(LoopbackDevice::new(name.clone(), self.clone()));
        self.devices
            .lock()
            .insert(device.address.clone(), Arc::downgrade(&device));
        debug!(device = %name, "Loopback device created");
        device
    }

    /// Look a device up by its address.
    pub fn lookup(&self, address: &str) -> Option<Arc<LoopbackDevice>> {
        let mut devices = self.devices.lock();
        match devices.get(address).and_then(Weak::upgrade) {
            Some(device) => Some(device),
            None => {
                devices.remove(address);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices
            .lock()
            .values()
            .filter(|device| device.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Faults
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Stream starves; the device buffers.
    StreamStall,
    /// Device enters its error state.
    Error,
    /// Control endpoint stops answering.
    Unreachable,
}

impl FaultKind {
    fn freezes_stream(&self) -> bool {
        matches!(self, FaultKind::StreamStall | FaultKind::Error)
    }
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    kind: FaultKind,
    start: Instant,
    end: Instant,
}

impl Fault {
    fn is_active(&self, now: Instant) -> bool {
        self.start <= now && now < self.end
    }

    /// Length of `[from, to)` covered by this fault.
    fn overlap(&self, from: Instant, to: Instant) -> Duration {
        let start = self.start.max(from);
        let end = self.end.min(to);
        end.saturating_duration_since(start)
    }
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug, Clone)]
struct NowPlaying {
    item: StreamItem,
    started_at: Instant,
}

#[derive(Default)]
struct Inner {
    mode: Option<TransmissionMode>,
    current: Option<NowPlaying>,
    queue: VecDeque<StreamItem>,
    upstream: Option<Arc<LoopbackDevice>>,
    /// Position last mirrored from upstream while healthy
    mirrored: StreamPosition,
    faults: Vec<Fault>,
    commands: Vec<String>,
}

impl Inner {
    fn active_fault(&self, kind: FaultKind, now: Instant) -> bool {
        self.faults.iter().any(|f| f.kind == kind && f.is_active(now))
    }

    /// Stream time elapsed over `[from, to)`, with stalled spans removed.
    fn stream_time(&self, from: Instant, to: Instant) -> Duration {
        let wall = to.saturating_duration_since(from);
        let stalled: Duration = self
            .faults
            .iter()
            .filter(|f| f.kind.freezes_stream())
            .map(|f| f.overlap(from, to))
            .sum();
        wall.saturating_sub(stalled)
    }

    /// Instant at which an item started at `start` runs out.
    fn finish_instant(&self, start: Instant, duration: Duration) -> Instant {
        let mut end = start + duration;
        loop {
            let played = self.stream_time(start, end);
            if played >= duration {
                return end;
            }
            end += duration - played;
        }
    }

    /// Move the timeline forward to `now`, promoting queued items.
    fn settle(&mut self, now: Instant) {
        while let Some(current) = &self.current {
            let end = self.finish_instant(current.started_at, current.item.duration);
            if end > now {
                break;
            }
            self.current = self.queue.pop_front().map(|item| {
                trace!(track_id = %item.track_id, "Loopback advanced to queued item");
                NowPlaying {
                    item,
                    started_at: end,
                }
            });
        }
    }

    fn local_observation(&mut self, now: Instant) -> (PlaybackState, StreamPosition) {
        self.settle(now);
        match &self.current {
            None => (PlaybackState::Stopped, StreamPosition::default()),
            Some(current) => {
                let offset = self
                    .stream_time(current.started_at, now)
                    .min(current.item.duration);
                let state = if self.active_fault(FaultKind::Error, now) {
                    PlaybackState::Error
                } else if self.active_fault(FaultKind::StreamStall, now) {
                    PlaybackState::Buffering
                } else {
                    PlaybackState::Playing
                };
                (
                    state,
                    StreamPosition::new(Some(current.item.track_id.clone()), offset),
                )
            }
        }
    }

    fn receiver_observation(
        &mut self,
        now: Instant,
        upstream: bridge_traits::Result<(PlaybackState, StreamPosition)>,
    ) -> (PlaybackState, StreamPosition) {
        if self.active_fault(FaultKind::Error, now) {
            return (PlaybackState::Error, self.mirrored.clone());
        }
        if self.active_fault(FaultKind::StreamStall, now) {
            return (PlaybackState::Buffering, self.mirrored.clone());
        }

        match upstream {
            Ok((state, _)) if state.is_impaired() => {
                (PlaybackState::Buffering, self.mirrored.clone())
            }
            Ok((state, position)) => {
                self.mirrored = StreamPosition::new(None, position.offset);
                (state, self.mirrored.clone())
            }
            Err(_) => (PlaybackState::Buffering, self.mirrored.clone()),
        }
    }
}

/// Simulated player. See the module docs.
pub struct LoopbackDevice {
    name: String,
    address: String,
    network: LoopbackNetwork,
    inner: Mutex<Inner>,
}

impl LoopbackDevice {
    fn new(name: String, network: LoopbackNetwork) -> Self {
        let address = format!("{}{}", LOOPBACK_SCHEME, name);
        Self {
            name,
            address,
            network,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Schedule a fault starting `after` from now and lasting `lasting`.
    pub fn inject_fault(&self, kind: FaultKind, after: Duration, lasting: Duration) {
        let start = Instant::now() + after;
        debug!(device = %self.name, ?kind, after_ms = after.as_millis() as u64, lasting_ms = lasting.as_millis() as u64, "Fault scheduled");
        let mut inner = self.inner.lock();
        // Freeze the timeline as it stands before the fault changes history
        inner.settle(Instant::now());
        inner.faults.push(Fault {
            kind,
            start,
            end: start + lasting,
        });
    }

    /// Commands received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().commands.clone()
    }

    pub fn transmission_mode(&self) -> Option<TransmissionMode> {
        self.inner.lock().mode
    }

    /// Address of the device this one follows, if any.
    pub fn upstream(&self) -> Option<String> {
        self.inner
            .lock()
            .upstream
            .as_ref()
            .map(|device| device.address.clone())
    }

    /// Track queued behind the current one.
    pub fn queued(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.settle(Instant::now());
        inner.queue.iter().map(|item| item.track_id.clone()).collect()
    }

    fn check_reachable(&self, inner: &Inner, now: Instant) -> bridge_traits::Result<()> {
        if inner.active_fault(FaultKind::Unreachable, now) {
            return Err(BridgeError::Unreachable(format!(
                "{} is not answering",
                self.address
            )));
        }
        Ok(())
    }

    /// Run a command against the settled timeline.
    fn command<T>(
        &self,
        name: &str,
        apply: impl FnOnce(&mut Inner, Instant) -> bridge_traits::Result<T>,
    ) -> bridge_traits::Result<T> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.check_reachable(&inner, now)?;
        inner.settle(now);
        inner.commands.push(name.to_string());
        apply(&mut inner, now)
    }

    fn observe(&self) -> bridge_traits::Result<(PlaybackState, StreamPosition)> {
        let now = Instant::now();
        let upstream = {
            let mut inner = self.inner.lock();
            self.check_reachable(&inner, now)?;
            match inner.upstream.clone() {
                Some(upstream) => upstream,
                None => return Ok(inner.local_observation(now)),
            }
        };

        // Own lock is released while the upstream chain is consulted
        let upstream_observation = upstream.observe();
        let mut inner = self.inner.lock();
        Ok(inner.receiver_observation(now, upstream_observation))
    }
}

impl std::fmt::Debug for LoopbackDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackDevice")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait::async_trait]
impl DeviceControl for LoopbackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn playback_state(&self) -> bridge_traits::Result<PlaybackState> {
        self.observe().map(|(state, _)| state)
    }

    async fn stream_position(&self) -> bridge_traits::Result<StreamPosition> {
        self.observe().map(|(_, position)| position)
    }

    async fn play(&self, item: &StreamItem) -> bridge_traits::Result<()> {
        self.command("play", |inner, now| {
            inner.queue.clear();
            inner.current = Some(NowPlaying {
                item: item.clone(),
                started_at: now,
            });
            Ok(())
        })
    }

    async fn queue_next(&self, item: &StreamItem) -> bridge_traits::Result<()> {
        self.command("queue_next", |inner, _| {
            if inner.upstream.is_some() {
                return Err(BridgeError::OperationFailed(
                    "device is following a sender".to_string(),
                ));
            }
            inner.queue.clear();
            inner.queue.push_back(item.clone());
            Ok(())
        })
    }

    async fn stop(&self) -> bridge_traits::Result<()> {
        self.command("stop", |inner, _| {
            inner.current = None;
            inner.queue.clear();
            Ok(())
        })
    }

    async fn configure_sender(&self, mode: TransmissionMode) -> bridge_traits::Result<()> {
        self.command("configure_sender", |inner, _| {
            inner.mode = Some(mode);
            Ok(())
        })
    }

    async fn sender_info(&self) -> bridge_traits::Result<SenderInfo> {
        let now = Instant::now();
        let inner = self.inner.lock();
        self.check_reachable(&inner, now)?;
        let mode = inner.mode.ok_or_else(|| {
            BridgeError::OperationFailed(format!("{} is not configured as a sender", self.name))
        })?;

        Ok(SenderInfo {
            uri: self.address.clone(),
            metadata: format!("mode={}", mode),
        })
    }

    async fn join_sender(&self, sender: &SenderInfo) -> bridge_traits::Result<()> {
        if sender.uri == self.address {
            return Err(BridgeError::OperationFailed(
                "a device cannot follow itself".to_string(),
            ));
        }
        let upstream = self
            .network
            .lookup(&sender.uri)
            .ok_or_else(|| BridgeError::NotFound(format!("no loopback sender at {}", sender.uri)))?;

        self.command("join_sender", |inner, _| {
            inner.current = None;
            inner.queue.clear();
            inner.mirrored = StreamPosition::default();
            inner.upstream = Some(upstream);
            Ok(())
        })
    }

    async fn release(&self) -> bridge_traits::Result<()> {
        self.command("release", |inner, _| {
            inner.current = None;
            inner.queue.clear();
            inner.upstream = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn item(id: &str, secs: u64) -> StreamItem {
        StreamItem {
            track_id: id.to_string(),
            uri: format!("https://cdn.example.com/{}.flac", id),
            title: format!("Track {}", id),
            duration: Duration::from_secs(secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_follows_wall_time() {
        let network = LoopbackNetwork::new();
        let device = network.spawn_device("sender");

        device.play(&item("a", 30)).await.unwrap();
        advance(Duration::from_secs(12)).await;

        let position = device.stream_position().await.unwrap();
        assert_eq!(position.track_id.as_deref(), Some("a"));
        assert_eq!(position.offset, Duration::from_secs(12));
        assert_eq!(device.playback_state().await.unwrap(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_item_takes_over_gaplessly() {
        let network = LoopbackNetwork::new();
        let device = network.spawn_device("sender");

        device.play(&item("a", 10)).await.unwrap();
        device.queue_next(&item("b", 10)).await.unwrap();
        advance(Duration::from_secs(13)).await;

        let position = device.stream_position().await.unwrap();
        assert_eq!(position.track_id.as_deref(), Some("b"));
        assert_eq!(position.offset, Duration::from_secs(3));

        advance(Duration::from_secs(10)).await;
        assert_eq!(device.playback_state().await.unwrap(), PlaybackState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_freezes_position_and_delays_end() {
        let network = LoopbackNetwork::new();
        let device = network.spawn_device("sender");

        device.play(&item("a", 10)).await.unwrap();
        device.inject_fault(FaultKind::StreamStall, Duration::from_secs(4), Duration::from_secs(2));

        advance(Duration::from_secs(5)).await;
        assert_eq!(device.playback_state().await.unwrap(), PlaybackState::Buffering);
        assert_eq!(device.stream_position().await.unwrap().offset, Duration::from_secs(4));

        advance(Duration::from_secs(2)).await;
        assert_eq!(device.playback_state().await.unwrap(), PlaybackState::Playing);
        assert_eq!(device.stream_position().await.unwrap().offset, Duration::from_secs(5));

        // 10 s of audio plus 2 s stalled
        advance(Duration::from_secs(4)).await;
        assert_eq!(device.playback_state().await.unwrap(), PlaybackState::Playing);
        advance(Duration::from_secs(1)).await;
        assert_eq!(device.playback_state().await.unwrap(), PlaybackState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_mirrors_sender() {
        let network = LoopbackNetwork::new();
        let sender = network.spawn_device("sender");
        let receiver = network.spawn_device("slave");

        sender.configure_sender(TransmissionMode::Multicast).await.unwrap();
        let info = sender.sender_info().await.unwrap();
        assert_eq!(info.metadata, "mode=multicast");
        receiver.join_sender(&info).await.unwrap();
        assert_eq!(receiver.upstream().as_deref(), Some("loopback://sender"));

        sender.play(&item("a", 30)).await.unwrap();
        advance(Duration::from_secs(7)).await;

        let position = receiver.stream_position().await.unwrap();
        assert_eq!(position.track_id, None);
        assert_eq!(position.offset, Duration::from_secs(7));
        assert_eq!(receiver.playback_state().await.unwrap(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_fault_does_not_touch_sender() {
        let network = LoopbackNetwork::new();
        let sender = network.spawn_device("sender");
        let repeater = network.spawn_device("repeater");

        sender.configure_sender(TransmissionMode::Unicast).await.unwrap();
        repeater.join_sender(&sender.sender_info().await.unwrap()).await.unwrap();
        sender.play(&item("a", 60)).await.unwrap();

        advance(Duration::from_secs(3)).await;
        assert_eq!(repeater.stream_position().await.unwrap().offset, Duration::from_secs(3));

        repeater.inject_fault(FaultKind::StreamStall, Duration::ZERO, Duration::from_secs(2));
        advance(Duration::from_secs(1)).await;
        assert_eq!(repeater.playback_state().await.unwrap(), PlaybackState::Buffering);
        assert_eq!(repeater.stream_position().await.unwrap().offset, Duration::from_secs(3));
        assert_eq!(sender.playback_state().await.unwrap(), PlaybackState::Playing);

        advance(Duration::from_secs(1)).await;
        assert_eq!(repeater.playback_state().await.unwrap(), PlaybackState::Playing);
        assert_eq!(repeater.stream_position().await.unwrap().offset, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_window_rejects_control() {
        let network = LoopbackNetwork::new();
        let device = network.spawn_device("sender");
        device.play(&item("a", 60)).await.unwrap();
        device.inject_fault(FaultKind::Unreachable, Duration::from_secs(1), Duration::from_secs(5));

        advance(Duration::from_secs(2)).await;
        assert!(matches!(
            device.playback_state().await,
            Err(BridgeError::Unreachable(_))
        ));
        assert!(device.stop().await.is_err());

        advance(Duration::from_secs(5)).await;
        // Audio kept going while control was down
        assert_eq!(device.stream_position().await.unwrap().offset, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_join_unknown_sender_fails() {
        let network = LoopbackNetwork::new();
        let device = network.spawn_device("slave");

        let result = device
            .join_sender(&SenderInfo {
                uri: "loopback://ghost".to_string(),
                metadata: String::new(),
            })
            .await;
        assert!(matches!(result, Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_network_forgets_dropped_devices() {
        let network = LoopbackNetwork::new();
        let device = network.spawn_device("sender");
        assert_eq!(network.len(), 1);
        assert!(network.lookup("loopback://sender").is_some());

        drop(device);
        assert!(network.is_empty());
        assert!(network.lookup("loopback://sender").is_none());
    }
}
