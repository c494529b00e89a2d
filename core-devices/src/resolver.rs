//! DUT identifier resolution
//!
//! `None` yields an absent handle, `local` a loopback SoftPlayer, and anything
//! else goes to the remote resolver (OpenHome on the desktop build).

use crate::error::{DeviceError, Result};
use crate::handle::DeviceHandle;
use crate::loopback::LoopbackNetwork;
use bridge_traits::{DeviceControl, DeviceResolver, DeviceRole};
use core_runtime::config::DeviceSpec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

/// How long a freshly resolved device gets to answer its first query
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TopologyResolver {
    loopback: LoopbackNetwork,
    remote: Option<Arc<dyn DeviceResolver>>,
    connect_timeout: Duration,
}

impl TopologyResolver {
    pub fn new(loopback: LoopbackNetwork) -> Self {
        Self {
            loopback,
            remote: None,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Resolver used for identifiers that are neither `None` nor `local`.
    pub fn with_remote(mut self, remote: Arc<dyn DeviceResolver>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn loopback(&self) -> &LoopbackNetwork {
        &self.loopback
    }

    /// Resolve a raw DUT identifier.
    pub async fn connect(&self, identifier: &str, role: DeviceRole) -> Result<Arc<DeviceHandle>> {
        let spec: DeviceSpec = identifier
            .parse()
            .map_err(|_| DeviceError::UnsupportedIdentifier(identifier.to_string()))?;
        self.connect_spec(&spec, role).await
    }

    /// Resolve a parsed device spec into a live handle.
    ///
    /// # Errors
    ///
    /// [`DeviceError::DeviceUnreachable`] when the device cannot be found or
    /// does not answer within the connect timeout.
    #[instrument(skip(self), fields(spec = %spec))]
    pub async fn connect_spec(&self, spec: &DeviceSpec, role: DeviceRole) -> Result<Arc<DeviceHandle>> {
        let handle = match spec {
            DeviceSpec::Absent => return Ok(Arc::new(DeviceHandle::absent(role))),
            DeviceSpec::Local => {
                let name = format!("softplayer-{}", role);
                let device = self.loopback.spawn_device(name.clone());
                DeviceHandle::new(name, role, device as Arc<dyn DeviceControl>)
            }
            DeviceSpec::Remote(identifier) => {
                let remote = self
                    .remote
                    .as_ref()
                    .ok_or_else(|| DeviceError::UnsupportedIdentifier(identifier.clone()))?;
                let control = remote.resolve(identifier, role).await.map_err(|e| {
                    DeviceError::DeviceUnreachable {
                        identifier: identifier.clone(),
                        reason: e.to_string(),
                    }
                })?;
                DeviceHandle::new(identifier.clone(), role, control)
            }
        };

        // A device that cannot answer one query is of no use to the run
        match timeout(self.connect_timeout, handle.playback_state()).await {
            Ok(Ok(state)) => {
                info!(device = %handle.id(), address = %handle.address(), %state, "Device connected");
                Ok(Arc::new(handle))
            }
            Ok(Err(e)) => {
                warn!(device = %handle.id(), error = %e, "Device did not answer");
                Err(DeviceError::DeviceUnreachable {
                    identifier: handle.id().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => Err(DeviceError::DeviceUnreachable {
                identifier: handle.id().to_string(),
                reason: format!("no answer within {:?}", self.connect_timeout),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::BridgeError;
    use mockall::mock;

    mock! {
        Remote {}

        #[async_trait::async_trait]
        impl DeviceResolver for Remote {
            async fn resolve(&self, identifier: &str, role: DeviceRole) -> bridge_traits::Result<Arc<dyn DeviceControl>>;
        }
    }

    #[tokio::test]
    async fn test_none_is_absent_in_any_case() {
        let resolver = TopologyResolver::new(LoopbackNetwork::new());

        for identifier in ["None", "none", "NONE"] {
            let handle = resolver.connect(identifier, DeviceRole::Slave).await.unwrap();
            assert!(!handle.is_present());
        }
    }

    #[tokio::test]
    async fn test_local_spawns_softplayer_per_role() {
        let network = LoopbackNetwork::new();
        let resolver = TopologyResolver::new(network.clone());

        let sender = resolver.connect("local", DeviceRole::Sender).await.unwrap();
        let slave = resolver.connect("local", DeviceRole::Slave).await.unwrap();

        assert_eq!(sender.id(), "softplayer-sender");
        assert_eq!(slave.id(), "softplayer-slave");
        assert_eq!(sender.address(), "loopback://softplayer-sender");
        assert_eq!(network.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_without_resolver_is_unsupported() {
        let resolver = TopologyResolver::new(LoopbackNetwork::new());
        let result = resolver.connect("192.168.1.40", DeviceRole::Sender).await;
        assert!(matches!(result, Err(DeviceError::UnsupportedIdentifier(_))));
    }

    #[tokio::test]
    async fn test_remote_resolution_failure_is_unreachable() {
        let mut remote = MockRemote::new();
        remote
            .expect_resolve()
            .returning(|_, _| Err(BridgeError::Unreachable("connection refused".into())));

        let resolver = TopologyResolver::new(LoopbackNetwork::new()).with_remote(Arc::new(remote));
        let result = resolver.connect("10.0.0.9", DeviceRole::Repeater).await;

        match result {
            Err(DeviceError::DeviceUnreachable { identifier, .. }) => assert_eq!(identifier, "10.0.0.9"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_that_never_answers_is_unreachable() {
        let network = LoopbackNetwork::new();
        let mute = network.spawn_device("mute");
        mute.inject_fault(
            crate::loopback::FaultKind::Unreachable,
            Duration::ZERO,
            Duration::from_secs(3600),
        );

        let mut remote = MockRemote::new();
        let device = mute.clone();
        remote
            .expect_resolve()
            .returning(move |_, _| Ok(device.clone() as Arc<dyn DeviceControl>));

        let resolver = TopologyResolver::new(network).with_remote(Arc::new(remote));
        let result = resolver.connect("mute-box", DeviceRole::Sender).await;
        assert!(matches!(result, Err(DeviceError::DeviceUnreachable { .. })));
    }
}
