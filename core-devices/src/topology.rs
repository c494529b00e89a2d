//! Sender / Repeater / Slave topology
//!
//! Linking rules:
//!
//! - the Sender distributes in the run's transmission mode
//! - a present Repeater follows the Sender and re-distributes in the same mode
//! - a present Slave follows the Repeater if there is one, else the Sender
//!
//! Absent roles go through the same calls and do nothing. A Repeater or
//! Slave that cannot be reached while connecting or linking leaves the run;
//! only the Sender is required.

use crate::error::{DeviceError, Result};
use crate::handle::DeviceHandle;
use crate::resolver::TopologyResolver;
use bridge_traits::{DeviceRole, SenderInfo, TransmissionMode};
use core_runtime::config::DeviceSpec;
use core_runtime::events::{CoreEvent, DeviceEvent, EventBus};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A device that left the run before playback started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedDevice {
    pub identifier: String,
    pub role: DeviceRole,
    pub reason: String,
}

pub struct Topology {
    sender: Arc<DeviceHandle>,
    repeater: Arc<DeviceHandle>,
    slave: Arc<DeviceHandle>,
    dropped: Mutex<Vec<DroppedDevice>>,
    event_bus: EventBus,
}

impl Topology {
    /// Assemble a topology from already connected handles.
    pub fn new(
        sender: Arc<DeviceHandle>,
        repeater: Arc<DeviceHandle>,
        slave: Arc<DeviceHandle>,
        event_bus: EventBus,
    ) -> Result<Self> {
        if !sender.is_present() {
            return Err(DeviceError::InvalidTopology(
                "a sender device is required".to_string(),
            ));
        }
        Ok(Self {
            sender,
            repeater,
            slave,
            dropped: Mutex::new(Vec::new()),
            event_bus,
        })
    }

    /// Resolve all three roles.
    ///
    /// An unreachable Repeater or Slave is replaced by an absent handle and
    /// listed in [`Topology::dropped`]. Any other failure ends the call, and
    /// handles connected before it are released again.
    #[instrument(skip_all)]
    pub async fn connect(
        resolver: &TopologyResolver,
        sender: &DeviceSpec,
        repeater: &DeviceSpec,
        slave: &DeviceSpec,
        event_bus: EventBus,
    ) -> Result<Self> {
        if sender.is_absent() {
            return Err(DeviceError::InvalidTopology(
                "a sender device is required".to_string(),
            ));
        }

        let mut connected: Vec<Arc<DeviceHandle>> = Vec::with_capacity(3);
        let mut dropped = Vec::new();
        for (spec, role) in [
            (sender, DeviceRole::Sender),
            (repeater, DeviceRole::Repeater),
            (slave, DeviceRole::Slave),
        ] {
            match resolver.connect_spec(spec, role).await {
                Ok(handle) => {
                    if handle.is_present() {
                        let _ = event_bus.emit(CoreEvent::Device(DeviceEvent::Connected {
                            device: handle.id().to_string(),
                            role: role.to_string(),
                            address: handle.address().to_string(),
                        }));
                    }
                    connected.push(handle);
                }
                Err(e) if role != DeviceRole::Sender && e.is_transient() => {
                    warn!(device = %spec, %role, error = %e, "Device unreachable, continuing without it");
                    let _ = event_bus.emit(CoreEvent::Device(DeviceEvent::Unreachable {
                        device: spec.to_string(),
                        role: role.to_string(),
                    }));
                    dropped.push(DroppedDevice {
                        identifier: spec.to_string(),
                        role,
                        reason: e.to_string(),
                    });
                    connected.push(Arc::new(DeviceHandle::absent(role)));
                }
                Err(e) => {
                    for handle in &connected {
                        let _ = handle.release().await;
                    }
                    return Err(e);
                }
            }
        }

        let slave = connected.pop();
        let repeater = connected.pop();
        let sender = connected.pop();
        match (sender, repeater, slave) {
            (Some(sender), Some(repeater), Some(slave)) => {
                let topology = Self::new(sender, repeater, slave, event_bus)?;
                *topology.dropped.lock() = dropped;
                Ok(topology)
            }
            _ => Err(DeviceError::InvalidTopology(
                "incomplete topology".to_string(),
            )),
        }
    }

    pub fn sender(&self) -> &Arc<DeviceHandle> {
        &self.sender
    }

    pub fn repeater(&self) -> &Arc<DeviceHandle> {
        &self.repeater
    }

    pub fn slave(&self) -> &Arc<DeviceHandle> {
        &self.slave
    }

    pub fn get(&self, role: DeviceRole) -> &Arc<DeviceHandle> {
        match role {
            DeviceRole::Sender => &self.sender,
            DeviceRole::Repeater => &self.repeater,
            DeviceRole::Slave => &self.slave,
        }
    }

    /// All three handles, present or not.
    pub fn handles(&self) -> [&Arc<DeviceHandle>; 3] {
        [&self.sender, &self.repeater, &self.slave]
    }

    /// Repeaters and Slaves that left the run while connecting or linking.
    pub fn dropped(&self) -> Vec<DroppedDevice> {
        self.dropped.lock().clone()
    }

    /// Handles that currently take part in playback.
    pub fn active(&self) -> Vec<Arc<DeviceHandle>> {
        self.handles()
            .into_iter()
            .filter(|handle| handle.is_active())
            .cloned()
            .collect()
    }

    pub fn find(&self, device_id: &str) -> Option<&Arc<DeviceHandle>> {
        self.handles()
            .into_iter()
            .find(|handle| handle.is_present() && handle.id() == device_id)
    }

    /// Wire receivers to their upstream device.
    ///
    /// A Sender that cannot be configured fails the call. A Repeater or Slave
    /// that cannot be linked is dropped from the run and the chain is rewired
    /// around it.
    #[instrument(skip_all, fields(mode = %mode))]
    pub async fn link(&self, mode: TransmissionMode) -> Result<()> {
        self.sender.configure_sender(mode).await?;
        let mut upstream = self.sender.sender_info().await?;

        if self.repeater.is_present() {
            match self.link_repeater(&upstream, mode).await {
                Ok(info) => upstream = info,
                Err(e) => self.drop_from_run(&self.repeater, &e),
            }
        }

        if self.slave.is_present() {
            if let Err(e) = self.slave.join_sender(&upstream).await {
                self.drop_from_run(&self.slave, &e);
            }
        }

        info!(
            participants = self.active().len(),
            "Topology linked"
        );
        Ok(())
    }

    async fn link_repeater(&self, upstream: &SenderInfo, mode: TransmissionMode) -> Result<SenderInfo> {
        self.repeater.join_sender(upstream).await?;
        self.repeater.configure_sender(mode).await?;
        self.repeater.sender_info().await
    }

    fn drop_from_run(&self, handle: &DeviceHandle, error: &DeviceError) {
        warn!(device = %handle.id(), role = %handle.role(), error = %error, "Device could not be linked");
        if handle.deactivate() {
            self.dropped.lock().push(DroppedDevice {
                identifier: handle.id().to_string(),
                role: handle.role(),
                reason: error.to_string(),
            });
            let _ = self
                .event_bus
                .emit(CoreEvent::Device(DeviceEvent::Unreachable {
                    device: handle.id().to_string(),
                    role: handle.role().to_string(),
                }));
        }
    }

    /// Stop the sender and idle every device. Failures are logged; every
    /// handle is attempted.
    pub async fn release_all(&self) {
        if self.sender.is_present() && !self.sender.is_released() {
            if let Err(e) = self.sender.stop().await {
                warn!(device = %self.sender.id(), error = %e, "Stop at teardown failed");
            }
        }

        // Receivers first so nothing is left following a vanished sender
        for handle in [&self.slave, &self.repeater, &self.sender] {
            if !handle.is_present() || handle.is_released() {
                continue;
            }
            match handle.release().await {
                Ok(()) => {
                    let _ = self
                        .event_bus
                        .emit(CoreEvent::Device(DeviceEvent::Released {
                            device: handle.id().to_string(),
                        }));
                }
                Err(e) => warn!(device = %handle.id(), error = %e, "Release failed"),
            }
        }
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("sender", &self.sender)
            .field("repeater", &self.repeater)
            .field("slave", &self.slave)
            .finish()
    }
}
