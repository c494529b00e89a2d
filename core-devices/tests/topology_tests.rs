use async_trait::async_trait;
use bridge_traits::{
    BridgeError, DeviceControl, DeviceResolver, DeviceRole, PlaybackState, StreamItem,
    TransmissionMode,
};
use core_devices::{DeviceError, FaultKind, LoopbackNetwork, Topology, TopologyResolver};
use core_runtime::config::DeviceSpec;
use core_runtime::events::{CoreEvent, DeviceEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;

/// Remote network where nothing answers.
struct DeadRemote;

#[async_trait]
impl DeviceResolver for DeadRemote {
    async fn resolve(&self, _identifier: &str, _role: DeviceRole) -> bridge_traits::Result<Arc<dyn DeviceControl>> {
        Err(BridgeError::Unreachable("connection refused".to_string()))
    }
}

fn item(id: &str) -> StreamItem {
    StreamItem {
        track_id: id.to_string(),
        uri: format!("https://cdn.example.com/{}.flac", id),
        title: id.to_string(),
        duration: Duration::from_secs(120),
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<CoreEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::Device(event) = event {
            events.push(event);
        }
    }
    events
}

#[tokio::test(start_paused = true)]
async fn full_chain_links_through_repeater() {
    let network = LoopbackNetwork::new();
    let resolver = TopologyResolver::new(network.clone());
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();

    let topology = Topology::connect(
        &resolver,
        &DeviceSpec::Local,
        &DeviceSpec::Local,
        &DeviceSpec::Local,
        bus,
    )
    .await
    .unwrap();
    topology.link(TransmissionMode::Multicast).await.unwrap();

    let sender = network.lookup("loopback://softplayer-sender").unwrap();
    let repeater = network.lookup("loopback://softplayer-repeater").unwrap();
    let slave = network.lookup("loopback://softplayer-slave").unwrap();

    assert_eq!(sender.transmission_mode(), Some(TransmissionMode::Multicast));
    assert_eq!(repeater.transmission_mode(), Some(TransmissionMode::Multicast));
    assert_eq!(repeater.upstream().as_deref(), Some("loopback://softplayer-sender"));
    assert_eq!(slave.upstream().as_deref(), Some("loopback://softplayer-repeater"));
    assert_eq!(topology.active().len(), 3);

    topology.sender().play(&item("a")).await.unwrap();
    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(
        topology.slave().stream_position().await.unwrap().offset,
        Duration::from_secs(9)
    );

    let connected = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, DeviceEvent::Connected { .. }))
        .count();
    assert_eq!(connected, 3);
}

#[tokio::test]
async fn slave_follows_sender_without_repeater() {
    let network = LoopbackNetwork::new();
    let resolver = TopologyResolver::new(network.clone());

    let topology = Topology::connect(
        &resolver,
        &DeviceSpec::Local,
        &DeviceSpec::Absent,
        &DeviceSpec::Local,
        EventBus::new(16),
    )
    .await
    .unwrap();
    topology.link(TransmissionMode::Unicast).await.unwrap();

    let slave = network.lookup("loopback://softplayer-slave").unwrap();
    assert_eq!(slave.upstream().as_deref(), Some("loopback://softplayer-sender"));
    assert!(!topology.repeater().is_present());
    assert_eq!(topology.active().len(), 2);
}

#[tokio::test]
async fn absent_sender_is_rejected() {
    let resolver = TopologyResolver::new(LoopbackNetwork::new());
    let result = Topology::connect(
        &resolver,
        &DeviceSpec::Absent,
        &DeviceSpec::Local,
        &DeviceSpec::Absent,
        EventBus::new(16),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn unreachable_repeater_is_bypassed() {
    let network = LoopbackNetwork::new();
    let sender = network.spawn_device("sender");
    let repeater = network.spawn_device("repeater");
    let slave = network.spawn_device("slave");

    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let topology = Topology::new(
        std::sync::Arc::new(core_devices::DeviceHandle::new("sender", DeviceRole::Sender, sender)),
        std::sync::Arc::new(core_devices::DeviceHandle::new("repeater", DeviceRole::Repeater, repeater.clone())),
        std::sync::Arc::new(core_devices::DeviceHandle::new("slave", DeviceRole::Slave, slave.clone())),
        bus,
    )
    .unwrap();

    repeater.inject_fault(FaultKind::Unreachable, Duration::ZERO, Duration::from_secs(60));
    topology.link(TransmissionMode::Unicast).await.unwrap();

    assert!(!topology.repeater().is_active());
    assert_eq!(slave.upstream().as_deref(), Some("loopback://sender"));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, DeviceEvent::Unreachable { device, .. } if device == "repeater")));
}

#[tokio::test]
async fn release_all_idles_every_device() {
    let network = LoopbackNetwork::new();
    let resolver = TopologyResolver::new(network.clone());
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();

    let topology = Topology::connect(
        &resolver,
        &DeviceSpec::Local,
        &DeviceSpec::Local,
        &DeviceSpec::Absent,
        bus,
    )
    .await
    .unwrap();
    topology.link(TransmissionMode::Unicast).await.unwrap();
    topology.sender().play(&item("a")).await.unwrap();

    topology.release_all().await;
    topology.release_all().await;

    let sender = network.lookup("loopback://softplayer-sender").unwrap();
    assert_eq!(
        topology.sender().control().playback_state().await.unwrap(),
        PlaybackState::Stopped
    );
    assert!(sender.commands().contains(&"release".to_string()));
    assert_eq!(sender.commands().iter().filter(|c| *c == "release").count(), 1);

    let released = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, DeviceEvent::Released { .. }))
        .count();
    assert_eq!(released, 2);
    assert!(topology.active().is_empty());
}

#[tokio::test]
async fn unreachable_remote_repeater_leaves_the_run_at_connect() {
    let network = LoopbackNetwork::new();
    let resolver = TopologyResolver::new(network.clone()).with_remote(Arc::new(DeadRemote));
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();

    let topology = Topology::connect(
        &resolver,
        &DeviceSpec::Local,
        &DeviceSpec::Remote("10.0.0.9".to_string()),
        &DeviceSpec::Local,
        bus,
    )
    .await
    .unwrap();

    assert!(!topology.repeater().is_present());
    let dropped = topology.dropped();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].identifier, "10.0.0.9");
    assert_eq!(dropped[0].role, DeviceRole::Repeater);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, DeviceEvent::Unreachable { device, .. } if device == "10.0.0.9")));

    // The slave is wired straight to the sender
    topology.link(TransmissionMode::Unicast).await.unwrap();
    let slave = network.lookup("loopback://softplayer-slave").unwrap();
    assert_eq!(slave.upstream().as_deref(), Some("loopback://softplayer-sender"));
    assert_eq!(topology.active().len(), 2);
}

#[tokio::test]
async fn unreachable_remote_sender_fails_connect() {
    let network = LoopbackNetwork::new();
    let resolver = TopologyResolver::new(network.clone()).with_remote(Arc::new(DeadRemote));

    let result = Topology::connect(
        &resolver,
        &DeviceSpec::Remote("10.0.0.9".to_string()),
        &DeviceSpec::Absent,
        &DeviceSpec::Local,
        EventBus::new(16),
    )
    .await;

    assert!(matches!(result, Err(DeviceError::DeviceUnreachable { .. })));
}

#[tokio::test(start_paused = true)]
async fn unlinkable_repeater_is_listed_as_dropped() {
    let network = LoopbackNetwork::new();
    let resolver = TopologyResolver::new(network.clone());
    let topology = Topology::connect(
        &resolver,
        &DeviceSpec::Local,
        &DeviceSpec::Local,
        &DeviceSpec::Absent,
        EventBus::new(16),
    )
    .await
    .unwrap();

    network
        .lookup("loopback://softplayer-repeater")
        .unwrap()
        .inject_fault(FaultKind::Unreachable, Duration::ZERO, Duration::from_secs(60));
    topology.link(TransmissionMode::Multicast).await.unwrap();

    let dropped = topology.dropped();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].identifier, "softplayer-repeater");
}
