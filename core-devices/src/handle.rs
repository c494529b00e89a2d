//! Device handles
//!
//! A [`DeviceHandle`] wraps one [`DeviceControl`] with the bookkeeping the run
//! needs: role, identifier, last observation and whether the device still
//! takes part in playback. Roles left empty get an [`AbsentDevice`], so the
//! rest of the engine never has to special-case missing devices.

use crate::error::{DeviceError, Result};
use bridge_traits::{
    DeviceControl, DeviceRole, PlaybackState, SenderInfo, StreamItem, StreamPosition,
    TransmissionMode,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Last thing the monitor saw on a device.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub state: Option<PlaybackState>,
    pub position: Option<StreamPosition>,
}

pub struct DeviceHandle {
    id: String,
    role: DeviceRole,
    control: Arc<dyn DeviceControl>,
    active: AtomicBool,
    released: AtomicBool,
    dropouts: AtomicUsize,
    last: Mutex<Observation>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, role: DeviceRole, control: Arc<dyn DeviceControl>) -> Self {
        let present = control.is_present();
        Self {
            id: id.into(),
            role,
            control,
            active: AtomicBool::new(present),
            released: AtomicBool::new(false),
            dropouts: AtomicUsize::new(0),
            last: Mutex::new(Observation::default()),
        }
    }

    /// Handle for a role nobody fills.
    pub fn absent(role: DeviceRole) -> Self {
        Self::new(format!("absent-{}", role), role, Arc::new(AbsentDevice::new()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn address(&self) -> &str {
        self.control.address()
    }

    /// `role:name`, used in reports.
    pub fn label(&self) -> String {
        format!("{}:{}", self.role, self.control.name())
    }

    pub fn control(&self) -> &Arc<dyn DeviceControl> {
        &self.control
    }

    pub fn is_present(&self) -> bool {
        self.control.is_present()
    }

    /// Present and not yet dropped from the run.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the device from later playback sessions. Returns `false` if it
    /// was already inactive.
    pub fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            warn!(device = %self.id, role = %self.role, "Device removed from playback");
        }
        was_active
    }

    pub fn last_observation(&self) -> Observation {
        self.last.lock().clone()
    }

    pub fn record_observation(&self, state: PlaybackState, position: StreamPosition) {
        let mut last = self.last.lock();
        last.state = Some(state);
        last.position = Some(position);
    }

    pub fn record_dropout(&self) {
        self.dropouts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dropout_count(&self) -> usize {
        self.dropouts.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn playback_state(&self) -> Result<PlaybackState> {
        self.control
            .playback_state()
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "playback_state", e))
    }

    pub async fn stream_position(&self) -> Result<StreamPosition> {
        self.control
            .stream_position()
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "stream_position", e))
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub async fn play(&self, item: &StreamItem) -> Result<()> {
        self.ensure_not_released()?;
        debug!(device = %self.id, track_id = %item.track_id, "play");
        self.control
            .play(item)
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "play", e))
    }

    pub async fn queue_next(&self, item: &StreamItem) -> Result<()> {
        self.ensure_not_released()?;
        debug!(device = %self.id, track_id = %item.track_id, "queue_next");
        self.control
            .queue_next(item)
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "queue_next", e))
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_not_released()?;
        self.control
            .stop()
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "stop", e))
    }

    pub async fn configure_sender(&self, mode: TransmissionMode) -> Result<()> {
        self.ensure_not_released()?;
        self.control
            .configure_sender(mode)
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "configure_sender", e))
    }

    pub async fn sender_info(&self) -> Result<SenderInfo> {
        self.control
            .sender_info()
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "sender_info", e))
    }

    pub async fn join_sender(&self, sender: &SenderInfo) -> Result<()> {
        self.ensure_not_released()?;
        self.control
            .join_sender(sender)
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "join_sender", e))
    }

    /// Idle the device. Only the first call reaches it.
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.active.store(false, Ordering::SeqCst);
        self.control
            .release()
            .await
            .map_err(|e| DeviceError::from_bridge(&self.id, "release", e))
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn ensure_not_released(&self) -> Result<()> {
        if self.is_released() {
            return Err(DeviceError::Released {
                device: self.id.clone(),
                role: self.role,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("present", &self.is_present())
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// AbsentDevice
// ============================================================================

/// Null-object device for an unpopulated role.
///
/// Every command succeeds without effect; it always reports `Stopped` at
/// offset zero.
#[derive(Debug, Default)]
pub struct AbsentDevice;

impl AbsentDevice {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl DeviceControl for AbsentDevice {
    fn name(&self) -> &str {
        "none"
    }

    fn address(&self) -> &str {
        ""
    }

    fn is_present(&self) -> bool {
        false
    }

    async fn playback_state(&self) -> bridge_traits::Result<PlaybackState> {
        Ok(PlaybackState::Stopped)
    }

    async fn stream_position(&self) -> bridge_traits::Result<StreamPosition> {
        Ok(StreamPosition::default())
    }

    async fn play(&self, _item: &StreamItem) -> bridge_traits::Result<()> {
        Ok(())
    }

    async fn queue_next(&self, _item: &StreamItem) -> bridge_traits::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> bridge_traits::Result<()> {
        Ok(())
    }

    async fn configure_sender(&self, _mode: TransmissionMode) -> bridge_traits::Result<()> {
        Ok(())
    }

    async fn sender_info(&self) -> bridge_traits::Result<SenderInfo> {
        Ok(SenderInfo {
            uri: String::new(),
            metadata: String::new(),
        })
    }

    async fn join_sender(&self, _sender: &SenderInfo) -> bridge_traits::Result<()> {
        Ok(())
    }

    async fn release(&self) -> bridge_traits::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::BridgeError;
    use mockall::mock;
    use std::time::Duration;

    mock! {
        Device {}

        #[async_trait::async_trait]
        impl DeviceControl for Device {
            fn name(&self) -> &str;
            fn address(&self) -> &str;
            async fn playback_state(&self) -> bridge_traits::Result<PlaybackState>;
            async fn stream_position(&self) -> bridge_traits::Result<StreamPosition>;
            async fn play(&self, item: &StreamItem) -> bridge_traits::Result<()>;
            async fn queue_next(&self, item: &StreamItem) -> bridge_traits::Result<()>;
            async fn stop(&self) -> bridge_traits::Result<()>;
            async fn configure_sender(&self, mode: TransmissionMode) -> bridge_traits::Result<()>;
            async fn sender_info(&self) -> bridge_traits::Result<SenderInfo>;
            async fn join_sender(&self, sender: &SenderInfo) -> bridge_traits::Result<()>;
            async fn release(&self) -> bridge_traits::Result<()>;
        }
    }

    fn item() -> StreamItem {
        StreamItem {
            track_id: "1".to_string(),
            uri: "https://cdn.example.com/1.flac".to_string(),
            title: "One".to_string(),
            duration: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_absent_device_is_inert() {
        let handle = DeviceHandle::absent(DeviceRole::Slave);

        assert!(!handle.is_present());
        assert!(!handle.is_active());
        assert_eq!(handle.playback_state().await.unwrap(), PlaybackState::Stopped);
        assert_eq!(handle.stream_position().await.unwrap().offset, Duration::ZERO);
        handle.play(&item()).await.unwrap();
        handle.join_sender(&SenderInfo { uri: "x".into(), metadata: String::new() }).await.unwrap();
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_maps_to_unreachable() {
        let mut device = MockDevice::new();
        device.expect_name().return_const("kitchen".to_string());
        device
            .expect_playback_state()
            .returning(|| Err(BridgeError::Unreachable("no route".into())));
        device
            .expect_play()
            .returning(|_| Err(BridgeError::OperationFailed("701 Transition not available".into())));

        let handle = DeviceHandle::new("kitchen", DeviceRole::Sender, Arc::new(device));

        let err = handle.playback_state().await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, DeviceError::DeviceUnreachable { .. }));

        let err = handle.play(&item()).await.unwrap_err();
        assert!(matches!(err, DeviceError::CommandFailed { command: "play", .. }));
    }

    #[tokio::test]
    async fn test_release_once_then_commands_rejected() {
        let mut device = MockDevice::new();
        device.expect_name().return_const("lounge".to_string());
        device.expect_release().times(1).returning(|| Ok(()));

        let handle = DeviceHandle::new("lounge", DeviceRole::Repeater, Arc::new(device));
        assert!(handle.is_active());
        assert_eq!(handle.label(), "repeater:lounge");

        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert!(!handle.is_active());
        assert!(matches!(
            handle.stop().await,
            Err(DeviceError::Released { .. })
        ));
    }

    #[test]
    fn test_deactivate_reports_first_transition() {
        let handle = DeviceHandle::new(
            "local",
            DeviceRole::Slave,
            Arc::new(AbsentDevice::new()) as Arc<dyn DeviceControl>,
        );
        // Absent devices start inactive
        assert!(!handle.deactivate());

        let mut device = MockDevice::new();
        device.expect_name().return_const("den".to_string());
        let handle = DeviceHandle::new("den", DeviceRole::Slave, Arc::new(device));
        assert!(handle.deactivate());
        assert!(!handle.deactivate());
    }
}
