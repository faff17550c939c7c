//! Peer registry: the declared peer list and the live peer table.
//!
//! While the service is Stopped the registry answers from the persisted
//! settings; while Running it reads the core's live table and mirrors
//! mutations into both the core and the settings.

use std::net::Ipv6Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config;
use crate::error::GatewayResult;
use crate::identity::address_for_key;
use crate::service::{Service, ServiceState};

/// A peer as reported over the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub uri: String,
    pub inbound: bool,
    pub connected: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub uptime_secs: u64,
    /// One-way latency in milliseconds; zero when no sample exists.
    pub latency_ms: u64,
    /// Overlay address derived from the remote key, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv6Addr>,
    pub priority: u8,
}

/// A live session as reported over the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub public_key: String,
    pub address: Ipv6Addr,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub uptime_secs: u64,
}

/// Aggregate peer and session statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerStats {
    pub peer_count: usize,
    pub connected_count: usize,
    pub session_count: usize,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Peer table operations against the service and the persisted settings.
pub struct PeerRegistry {
    service: Arc<Service>,
}

impl PeerRegistry {
    pub fn new(service: Arc<Service>) -> Self {
        PeerRegistry { service }
    }

    /// List peers: the live table while Running, the declared list otherwise.
    pub async fn list(&self) -> GatewayResult<Vec<PeerInfo>> {
        if self.service.state().await == ServiceState::Running {
            if let Some(core) = self.service.core().await {
                let peers = core
                    .peers()
                    .await
                    .into_iter()
                    .map(|entry| PeerInfo {
                        uri: entry.uri.unwrap_or_default(),
                        inbound: entry.inbound,
                        connected: entry.up,
                        rx_bytes: entry.rx_bytes,
                        tx_bytes: entry.tx_bytes,
                        uptime_secs: entry.uptime.as_secs(),
                        latency_ms: entry
                            .latency
                            .map(|latency| latency.as_millis() as u64)
                            .unwrap_or(0),
                        address: entry.remote_key.map(|key| address_for_key(&key)),
                        priority: entry.priority,
                    })
                    .collect();
                return Ok(peers);
            }
        }

        let settings = self.service.settings_store().load().await?;
        Ok(settings
            .peers
            .into_iter()
            .map(|uri| PeerInfo {
                uri,
                inbound: false,
                connected: false,
                rx_bytes: 0,
                tx_bytes: 0,
                uptime_secs: 0,
                latency_ms: 0,
                address: None,
                priority: 0,
            })
            .collect())
    }

    /// Declare a peer and, while Running, hand it to the live core.
    /// Adding an already-declared URI is a no-op.
    pub async fn add(&self, uri: &str) -> GatewayResult<()> {
        config::validate_peer_uri(uri)?;

        let store = self.service.settings_store();
        let mut settings = store.load().await?;
        if settings.peers.iter().any(|existing| existing == uri) {
            debug!("Peer {} is already declared", uri);
            return Ok(());
        }
        settings.peers.push(uri.to_string());
        store.save(&settings).await?;

        if self.service.state().await == ServiceState::Running {
            if let Some(core) = self.service.core().await {
                core.add_peer(uri, None).await?;
            }
        }
        Ok(())
    }

    /// Remove a declared peer and, while Running, drop it from the core.
    /// Removing an unknown URI is a no-op; a core-side rejection (peer not
    /// currently attached) is warned, not surfaced.
    pub async fn remove(&self, uri: &str) -> GatewayResult<()> {
        config::validate_peer_uri(uri)?;

        let store = self.service.settings_store();
        let mut settings = store.load().await?;
        let declared = settings.peers.len();
        settings.peers.retain(|existing| existing != uri);
        if settings.peers.len() == declared {
            debug!("Peer {} is not declared", uri);
            return Ok(());
        }
        store.save(&settings).await?;

        if self.service.state().await == ServiceState::Running {
            if let Some(core) = self.service.core().await {
                if let Err(e) = core.remove_peer(uri, None).await {
                    warn!("Core rejected removal of {}: {}", uri, e);
                }
            }
        }
        Ok(())
    }

    /// Live sessions; empty while the service is not Running.
    pub async fn sessions(&self) -> GatewayResult<Vec<SessionInfo>> {
        let Some(core) = self.service.core().await else {
            return Ok(Vec::new());
        };
        Ok(core
            .sessions()
            .await
            .into_iter()
            .map(|entry| SessionInfo {
                public_key: hex::encode(entry.remote_key),
                address: address_for_key(&entry.remote_key),
                rx_bytes: entry.rx_bytes,
                tx_bytes: entry.tx_bytes,
                uptime_secs: entry.uptime.as_secs(),
            })
            .collect())
    }

    /// Aggregate statistics over peers and sessions.
    pub async fn stats(&self) -> GatewayResult<PeerStats> {
        let peers = self.list().await?;
        let sessions = self.sessions().await?;
        Ok(PeerStats {
            peer_count: peers.len(),
            connected_count: peers.iter().filter(|peer| peer.connected).count(),
            session_count: sessions.len(),
            rx_bytes: peers.iter().map(|peer| peer.rx_bytes).sum(),
            tx_bytes: peers.iter().map(|peer| peer.tx_bytes).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySettingsStore;
    use crate::test_utils::{MockCoreFactory, MockNetwork};

    fn new_registry() -> (Arc<Service>, PeerRegistry, Arc<MockCoreFactory>) {
        let factory = Arc::new(MockCoreFactory::new(MockNetwork::new()));
        let service = Service::new(factory.clone(), Arc::new(MemorySettingsStore::default()));
        (service.clone(), PeerRegistry::new(service), factory)
    }

    const PEER: &str = "tls://peer.example.com:443";

    #[tokio::test]
    async fn add_is_idempotent() {
        let (_service, registry, _factory) = new_registry();
        registry.add(PEER).await.unwrap();
        registry.add(PEER).await.unwrap();

        let peers = registry.list().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].uri, PEER);
        assert!(!peers[0].connected);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_service, registry, _factory) = new_registry();
        registry.add(PEER).await.unwrap();
        registry.remove(PEER).await.unwrap();
        registry.remove(PEER).await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_rejects_invalid_uris() {
        let (_service, registry, _factory) = new_registry();
        assert!(registry.add("tcp://peer.example:0").await.is_err());
        assert!(registry.add("nope").await.is_err());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_while_running_reaches_the_core() {
        let (service, registry, factory) = new_registry();
        service.start().await.unwrap();

        registry.add(PEER).await.unwrap();
        let core = factory.core().await.unwrap();
        assert!(core.added_uris().await.contains(&PEER.to_string()));

        let peers = registry.list().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].connected);
    }

    #[tokio::test]
    async fn remove_of_unattached_peer_is_warned_not_fatal() {
        let (service, registry, _factory) = new_registry();
        registry.add(PEER).await.unwrap();
        service.start().await.unwrap();
        // The core never saw this peer attach; removal still succeeds.
        registry.remove(PEER).await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uri_round_trips_through_the_declared_set() {
        let (_service, registry, _factory) = new_registry();
        registry.add("tcp://a.example:1").await.unwrap();
        registry.add(PEER).await.unwrap();

        let after: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|peer| peer.uri)
            .collect();
        registry.remove(PEER).await.unwrap();
        let finally: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|peer| peer.uri)
            .collect();

        let mut expected = after.clone();
        expected.retain(|uri| uri != PEER);
        assert_eq!(expected, finally);
    }
}
