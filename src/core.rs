//! The overlay routing engine, treated as a black box.
//!
//! The gateway depends on the minimal surface below; any mesh overlay that
//! can hand out a userspace netstack bound to itself can sit behind these
//! traits. The routing protocol, transport encryption and session handling
//! all live on the far side of [`OverlayCore`].

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::identity::Subnet;
use crate::netstack::NetstackBridge;

/// Errors reported by the overlay core.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core setup failed: {0}")]
    Setup(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer rejected: {0}")]
    PeerRejected(String),

    #[error("Multicast discovery failed: {0}")]
    Multicast(String),

    #[error("Core is stopped")]
    Stopped,

    #[error("Other core error: {0}")]
    Other(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Fully materialised configuration handed to the overlay core.
///
/// No `Debug` derive: the struct carries the private key.
#[derive(Clone)]
pub struct CoreConfig {
    /// Ed25519 seed bytes, scrubbed when the config is dropped.
    pub private_key: Zeroizing<Vec<u8>>,
    /// Public key matching the seed.
    pub public_key: [u8; 32],
    /// Transport listeners, e.g. `tcp://0.0.0.0:0`.
    pub listen: Vec<String>,
    /// Declared peer URIs dialled at startup.
    pub peers: Vec<String>,
    /// Interface name patterns for link-local multicast discovery.
    pub multicast_regexes: Vec<String>,
    /// When non-empty, only these public keys may peer with us.
    pub allowed_keys: Vec<[u8; 32]>,
    /// Admin socket endpoint. Always `None` here: the in-process control
    /// plane is the only admin surface.
    pub admin_listen: Option<String>,
}

/// A peer as observed by the running core.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Transport URI the peer was declared or observed at.
    pub uri: Option<String>,
    /// Remote node's public key, when the handshake has completed.
    pub remote_key: Option<[u8; 32]>,
    /// Whether the remote side initiated the connection.
    pub inbound: bool,
    /// Whether the transport is currently established.
    pub up: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Time since the transport came up.
    pub uptime: Duration,
    /// One-way latency estimate, when the session has a sample.
    pub latency: Option<Duration>,
    pub priority: u8,
}

/// A live cryptographic session with another overlay node.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub remote_key: [u8; 32],
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub uptime: Duration,
}

/// Handle over a running overlay core.
#[async_trait]
pub trait OverlayCore: Send + Sync {
    /// The node's overlay unicast address.
    fn address(&self) -> Ipv6Addr;

    /// The node's routed /64 subnet.
    fn subnet(&self) -> Subnet;

    /// The node's public key.
    fn public_key(&self) -> [u8; 32];

    /// Maximum transmission unit of the overlay interface.
    fn mtu(&self) -> u64;

    /// Dial an additional peer on the running core.
    async fn add_peer(&self, uri: &str, source_iface: Option<&str>) -> CoreResult<()>;

    /// Drop a peer from the running core.
    async fn remove_peer(&self, uri: &str, source_iface: Option<&str>) -> CoreResult<()>;

    /// Snapshot of the live peer table.
    async fn peers(&self) -> Vec<PeerEntry>;

    /// Snapshot of the live session table.
    async fn sessions(&self) -> Vec<SessionEntry>;

    /// Shut the core down, invalidating all netstack handles bound to it.
    async fn stop(&self);
}

/// Link-local multicast discovery, owned by the service while running.
#[async_trait]
pub trait MulticastHandle: Send + Sync {
    async fn stop(&self);
}

/// Constructs an overlay core together with the netstack bound to it.
#[async_trait]
pub trait CoreFactory: Send + Sync {
    async fn build(
        &self,
        config: CoreConfig,
    ) -> CoreResult<(Arc<dyn OverlayCore>, Arc<dyn NetstackBridge>)>;

    /// Start multicast discovery on interfaces matching `regexes`. Failure
    /// here is non-fatal to service startup.
    async fn start_multicast(
        &self,
        core: &Arc<dyn OverlayCore>,
        regexes: &[String],
    ) -> CoreResult<Box<dyn MulticastHandle>>;
}
