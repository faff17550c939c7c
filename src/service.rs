//! Overlay service lifecycle.
//!
//! The service owns the overlay core handle and serialises every start and
//! stop against a single state machine:
//!
//! ```text
//! Stopped ──start()──▶ Starting ──(ok)──▶ Running
//!                          │
//!                          └──(err)─▶ Stopped
//! Running ──stop()──▶ Stopping ──▶ Stopped
//! ```
//!
//! State transitions are fanned out to subscribers as messages so a slow
//! listener can never wedge the machine, and registered components are
//! started and torn down around the core in a fixed order.

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::{self, SettingsStore};
use crate::core::{CoreFactory, MulticastHandle, OverlayCore};
use crate::error::{GatewayError, GatewayResult};
use crate::netstack::NetstackBridge;

/// Largest MTU ever reported through the control plane.
pub const MAX_MTU: u64 = 65_535;

/// Lifecycle state of the overlay service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Information about the running node. Present exactly while Running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node's overlay unicast address.
    pub address: Ipv6Addr,
    /// The node's routed subnet, e.g. `301:1234:5678:9abc::/64`.
    pub subnet: String,
    /// Hex public key.
    pub public_key: String,
    /// Seconds since the service entered Running.
    pub uptime_secs: u64,
    /// Overlay interface MTU.
    pub mtu: u64,
}

/// A state transition as observed by subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangeEvent {
    pub previous: ServiceState,
    pub current: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeInfo>,
    pub timestamp: DateTime<Utc>,
}

/// A subsystem whose lifetime is tied to the service being Running.
///
/// Components are notified after the Running transition and again while the
/// service is Stopping, before the core is torn down. Teardown runs in
/// registration order.
#[async_trait]
pub trait ServiceComponent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_running(&self, netstack: Arc<dyn NetstackBridge>);

    async fn on_stopping(&self);
}

struct ServiceInner {
    state: ServiceState,
    core: Option<Arc<dyn OverlayCore>>,
    netstack: Option<Arc<dyn NetstackBridge>>,
    multicast: Option<Box<dyn MulticastHandle>>,
    node_info: Option<NodeInfo>,
    started_at: Option<Instant>,
}

/// The overlay service state machine.
pub struct Service {
    factory: Arc<dyn CoreFactory>,
    store: Arc<dyn SettingsStore>,
    inner: RwLock<ServiceInner>,
    listeners: RwLock<Vec<mpsc::UnboundedSender<StateChangeEvent>>>,
    components: RwLock<Vec<Arc<dyn ServiceComponent>>>,
}

impl Service {
    pub fn new(factory: Arc<dyn CoreFactory>, store: Arc<dyn SettingsStore>) -> Arc<Self> {
        Arc::new(Service {
            factory,
            store,
            inner: RwLock::new(ServiceInner {
                state: ServiceState::Stopped,
                core: None,
                netstack: None,
                multicast: None,
                node_info: None,
                started_at: None,
            }),
            listeners: RwLock::new(Vec::new()),
            components: RwLock::new(Vec::new()),
        })
    }

    /// Register a component. Registration order is teardown order.
    pub async fn register_component(&self, component: Arc<dyn ServiceComponent>) {
        self.components.write().await.push(component);
    }

    /// Subscribe to state transitions. Each receiver observes transitions
    /// in the order they occurred.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.write().await.push(tx);
        rx
    }

    pub async fn state(&self) -> ServiceState {
        self.inner.read().await.state
    }

    /// Node info with live uptime, present exactly while Running.
    pub async fn node_info(&self) -> Option<NodeInfo> {
        let inner = self.inner.read().await;
        inner.node_info.clone().map(|mut info| {
            if let Some(started_at) = inner.started_at {
                info.uptime_secs = started_at.elapsed().as_secs();
            }
            info
        })
    }

    pub async fn netstack(&self) -> Option<Arc<dyn NetstackBridge>> {
        self.inner.read().await.netstack.clone()
    }

    pub async fn core(&self) -> Option<Arc<dyn OverlayCore>> {
        self.inner.read().await.core.clone()
    }

    pub fn settings_store(&self) -> Arc<dyn SettingsStore> {
        self.store.clone()
    }

    /// Bring the overlay up. Legal only in Stopped; any setup failure after
    /// entering Starting rolls back to Stopped with the error surfaced.
    pub async fn start(&self) -> GatewayResult<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.state != ServiceState::Stopped {
                return Err(GatewayError::State(format!(
                    "cannot start while {}",
                    inner.state
                )));
            }
            inner.state = ServiceState::Starting;
        }
        self.emit(ServiceState::Stopped, ServiceState::Starting, None)
            .await;

        let netstack = match self.bring_up().await {
            Ok(netstack) => netstack,
            Err(e) => {
                self.inner.write().await.state = ServiceState::Stopped;
                self.emit(ServiceState::Starting, ServiceState::Stopped, None)
                    .await;
                return Err(e);
            }
        };

        let node_info = self.node_info().await;
        info!(
            "Overlay service running as {}",
            node_info
                .as_ref()
                .map(|i| i.address.to_string())
                .unwrap_or_default()
        );
        self.emit(ServiceState::Starting, ServiceState::Running, node_info)
            .await;

        let components = self.components.read().await.clone();
        for component in &components {
            debug!("Starting component {}", component.name());
            component.on_running(netstack.clone()).await;
        }
        Ok(())
    }

    async fn bring_up(&self) -> GatewayResult<Arc<dyn NetstackBridge>> {
        let (core_config, settings) = config::materialise(self.store.as_ref()).await?;
        let (core, netstack) = self.factory.build(core_config).await?;

        let multicast = if settings.multicast_regexes.is_empty() {
            None
        } else {
            match self
                .factory
                .start_multicast(&core, &settings.multicast_regexes)
                .await
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Multicast discovery unavailable: {}", e);
                    None
                }
            }
        };

        let node_info = NodeInfo {
            address: core.address(),
            subnet: core.subnet().to_string(),
            public_key: hex::encode(core.public_key()),
            uptime_secs: 0,
            mtu: core.mtu().min(MAX_MTU),
        };

        let mut inner = self.inner.write().await;
        inner.core = Some(core);
        inner.netstack = Some(netstack.clone());
        inner.multicast = multicast;
        inner.node_info = Some(node_info);
        inner.started_at = Some(Instant::now());
        inner.state = ServiceState::Running;
        Ok(netstack)
    }

    /// Tear the overlay down. A stop while already Stopped is a no-op.
    ///
    /// Teardown order: registered components (mapping manager, then the
    /// SOCKS gateway), multicast, core, netstack.
    pub async fn stop(&self) -> GatewayResult<()> {
        let (core, multicast, netstack) = {
            let mut inner = self.inner.write().await;
            match inner.state {
                ServiceState::Running => {}
                ServiceState::Stopped => {
                    info!("Service is not running");
                    return Ok(());
                }
                state => {
                    return Err(GatewayError::State(format!("cannot stop while {}", state)))
                }
            }
            inner.state = ServiceState::Stopping;
            inner.node_info = None;
            inner.started_at = None;
            (
                inner.core.take(),
                inner.multicast.take(),
                inner.netstack.take(),
            )
        };
        self.emit(ServiceState::Running, ServiceState::Stopping, None)
            .await;

        let components = self.components.read().await.clone();
        for component in &components {
            debug!("Stopping component {}", component.name());
            component.on_stopping().await;
        }
        if let Some(multicast) = multicast {
            multicast.stop().await;
        }
        if let Some(core) = core {
            core.stop().await;
        }
        drop(netstack);

        self.inner.write().await.state = ServiceState::Stopped;
        self.emit(ServiceState::Stopping, ServiceState::Stopped, None)
            .await;
        info!("Overlay service stopped");
        Ok(())
    }

    /// Post a transition to every subscriber, dropping closed channels.
    async fn emit(
        &self,
        previous: ServiceState,
        current: ServiceState,
        node_info: Option<NodeInfo>,
    ) {
        let event = StateChangeEvent {
            previous,
            current,
            node_info,
            timestamp: Utc::now(),
        };
        let mut listeners = self.listeners.write().await;
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySettingsStore;
    use crate::test_utils::{MockCoreFactory, MockNetwork};

    fn new_service() -> Arc<Service> {
        let network = MockNetwork::new();
        Service::new(
            Arc::new(MockCoreFactory::new(network)),
            Arc::new(MemorySettingsStore::default()),
        )
    }

    #[tokio::test]
    async fn start_walks_through_starting_to_running() {
        let service = new_service();
        let mut events = service.subscribe().await;

        service.start().await.unwrap();
        assert_eq!(service.state().await, ServiceState::Running);

        let first = events.recv().await.unwrap();
        assert_eq!(first.previous, ServiceState::Stopped);
        assert_eq!(first.current, ServiceState::Starting);
        assert!(first.node_info.is_none());

        let second = events.recv().await.unwrap();
        assert_eq!(second.previous, ServiceState::Starting);
        assert_eq!(second.current, ServiceState::Running);
        let info = second.node_info.unwrap();
        assert!(crate::identity::is_overlay_address(&info.address));
        assert!(info.subnet.ends_with("/64"));
        assert_eq!(info.public_key.len(), 64);
    }

    #[tokio::test]
    async fn node_info_present_exactly_while_running() {
        let service = new_service();
        assert!(service.node_info().await.is_none());

        service.start().await.unwrap();
        assert!(service.node_info().await.is_some());

        service.stop().await.unwrap();
        assert_eq!(service.state().await, ServiceState::Stopped);
        assert!(service.node_info().await.is_none());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let service = new_service();
        service.start().await.unwrap();
        let err = service.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::State(_)));
        assert_eq!(service.state().await, ServiceState::Running);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_noop() {
        let service = new_service();
        service.stop().await.unwrap();
        assert_eq!(service.state().await, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn failed_start_rolls_back_to_stopped() {
        let service = {
            let network = MockNetwork::new();
            let factory = MockCoreFactory::new(network);
            factory.fail_next_build();
            Service::new(
                Arc::new(factory),
                Arc::new(MemorySettingsStore::default()),
            )
        };
        let mut events = service.subscribe().await;

        assert!(service.start().await.is_err());
        assert_eq!(service.state().await, ServiceState::Stopped);
        assert!(service.node_info().await.is_none());

        let first = events.recv().await.unwrap();
        assert_eq!(first.current, ServiceState::Starting);
        let second = events.recv().await.unwrap();
        assert_eq!(second.previous, ServiceState::Starting);
        assert_eq!(second.current, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn identity_survives_restarts() {
        let service = new_service();
        service.start().await.unwrap();
        let first = service.node_info().await.unwrap();
        service.stop().await.unwrap();

        service.start().await.unwrap();
        let second = service.node_info().await.unwrap();
        assert_eq!(first.address, second.address);
        assert_eq!(first.public_key, second.public_key);
    }

    #[tokio::test]
    async fn multicast_failure_is_not_fatal() {
        let network = MockNetwork::new();
        let factory = MockCoreFactory::new(network);
        factory.fail_multicast();
        let store = MemorySettingsStore::new(crate::config::Settings {
            multicast_regexes: vec!["en.*".into()],
            ..Default::default()
        });
        let service = Service::new(Arc::new(factory), Arc::new(store));

        service.start().await.unwrap();
        assert_eq!(service.state().await, ServiceState::Running);
    }
}
