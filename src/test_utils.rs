//! Mock overlay core and a loopback-backed netstack bridge.
//!
//! The mock routes overlay endpoints onto real loopback sockets, so the
//! SOCKS gateway, forwarders and resolver can be exercised end to end
//! without a mesh. Register a route for an overlay endpoint, stand up an
//! ordinary listener at the mapped address, and dials through the bridge
//! land there.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;

use crate::core::{
    CoreConfig, CoreError, CoreFactory, CoreResult, MulticastHandle, OverlayCore, PeerEntry,
    SessionEntry,
};
use crate::identity::{address_for_key, subnet_for_key, Subnet};
use crate::netstack::{
    NetResult, NetstackBridge, NetstackError, OverlayDatagram, OverlayListener,
    OverlayPacketSocket, OverlayStream,
};

/// Overlay endpoint to loopback endpoint routing table shared by every
/// netstack built from one factory.
#[derive(Default)]
pub struct MockNetwork {
    tcp_routes: StdRwLock<HashMap<SocketAddrV6, SocketAddr>>,
    udp_routes: StdRwLock<HashMap<SocketAddrV6, SocketAddr>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(MockNetwork::default())
    }

    /// Route TCP dials for `overlay` to a real listener at `real`.
    pub fn register_tcp(&self, overlay: SocketAddrV6, real: SocketAddr) {
        self.tcp_routes.write().unwrap().insert(overlay, real);
    }

    /// Route UDP dials for `overlay` to a real socket at `real`.
    pub fn register_udp(&self, overlay: SocketAddrV6, real: SocketAddr) {
        self.udp_routes.write().unwrap().insert(overlay, real);
    }

    fn lookup_tcp(&self, overlay: &SocketAddrV6) -> Option<SocketAddr> {
        self.tcp_routes.read().unwrap().get(overlay).copied()
    }

    fn lookup_udp(&self, overlay: &SocketAddrV6) -> Option<SocketAddr> {
        self.udp_routes.read().unwrap().get(overlay).copied()
    }

    fn tcp_route_exists(&self, overlay: &SocketAddrV6) -> bool {
        self.tcp_routes.read().unwrap().contains_key(overlay)
    }

    fn udp_route_exists(&self, overlay: &SocketAddrV6) -> bool {
        self.udp_routes.read().unwrap().contains_key(overlay)
    }

    fn unregister_tcp(&self, overlay: &SocketAddrV6) {
        self.tcp_routes.write().unwrap().remove(overlay);
    }

    fn unregister_udp(&self, overlay: &SocketAddrV6) {
        self.udp_routes.write().unwrap().remove(overlay);
    }
}

/// Builds [`MockCore`] + [`MockNetstack`] pairs over a shared route table.
pub struct MockCoreFactory {
    network: Arc<MockNetwork>,
    fail_next_build: AtomicBool,
    fail_multicast: AtomicBool,
    last_core: StdRwLock<Option<Arc<MockCore>>>,
}

impl MockCoreFactory {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        MockCoreFactory {
            network,
            fail_next_build: AtomicBool::new(false),
            fail_multicast: AtomicBool::new(false),
            last_core: StdRwLock::new(None),
        }
    }

    pub fn network(&self) -> Arc<MockNetwork> {
        self.network.clone()
    }

    /// Make the next `build` fail, simulating a fatal start-up error.
    pub fn fail_next_build(&self) {
        self.fail_next_build.store(true, Ordering::SeqCst);
    }

    /// Make multicast setup fail, which must only warn.
    pub fn fail_multicast(&self) {
        self.fail_multicast.store(true, Ordering::SeqCst);
    }

    /// The most recently built core.
    pub async fn core(&self) -> Option<Arc<MockCore>> {
        self.last_core.read().unwrap().clone()
    }
}

#[async_trait]
impl CoreFactory for MockCoreFactory {
    async fn build(
        &self,
        config: CoreConfig,
    ) -> CoreResult<(Arc<dyn OverlayCore>, Arc<dyn NetstackBridge>)> {
        if self.fail_next_build.swap(false, Ordering::SeqCst) {
            return Err(CoreError::Setup("forced build failure".into()));
        }

        let peers = config
            .peers
            .iter()
            .map(|uri| PeerEntry {
                uri: Some(uri.clone()),
                remote_key: None,
                inbound: false,
                up: false,
                rx_bytes: 0,
                tx_bytes: 0,
                uptime: Duration::ZERO,
                latency: None,
                priority: 0,
            })
            .collect();

        let closed = Arc::new(AtomicBool::new(false));
        let core = Arc::new(MockCore {
            public_key: config.public_key,
            address: address_for_key(&config.public_key),
            subnet: subnet_for_key(&config.public_key),
            peers: RwLock::new(peers),
            sessions: RwLock::new(Vec::new()),
            added: RwLock::new(Vec::new()),
            closed: closed.clone(),
        });
        *self.last_core.write().unwrap() = Some(core.clone());

        let netstack: Arc<dyn NetstackBridge> = Arc::new(MockNetstack {
            network: self.network.clone(),
            address: core.address,
            subnet: core.subnet,
            closed,
        });
        let core: Arc<dyn OverlayCore> = core;
        Ok((core, netstack))
    }

    async fn start_multicast(
        &self,
        _core: &Arc<dyn OverlayCore>,
        _regexes: &[String],
    ) -> CoreResult<Box<dyn MulticastHandle>> {
        if self.fail_multicast.load(Ordering::SeqCst) {
            return Err(CoreError::Multicast("forced multicast failure".into()));
        }
        Ok(Box::new(MockMulticast))
    }
}

struct MockMulticast;

#[async_trait]
impl MulticastHandle for MockMulticast {
    async fn stop(&self) {}
}

/// In-process overlay core over the mock route table.
pub struct MockCore {
    public_key: [u8; 32],
    address: Ipv6Addr,
    subnet: Subnet,
    peers: RwLock<Vec<PeerEntry>>,
    sessions: RwLock<Vec<SessionEntry>>,
    added: RwLock<Vec<String>>,
    closed: Arc<AtomicBool>,
}

impl MockCore {
    /// URIs handed to `add_peer` since the core was built.
    pub async fn added_uris(&self) -> Vec<String> {
        self.added.read().await.clone()
    }

    /// Seed a live session entry.
    pub async fn push_session(&self, session: SessionEntry) {
        self.sessions.write().await.push(session);
    }
}

#[async_trait]
impl OverlayCore for MockCore {
    fn address(&self) -> Ipv6Addr {
        self.address
    }

    fn subnet(&self) -> Subnet {
        self.subnet
    }

    fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    fn mtu(&self) -> u64 {
        65_535
    }

    async fn add_peer(&self, uri: &str, _source_iface: Option<&str>) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Stopped);
        }
        self.added.write().await.push(uri.to_string());
        let mut peers = self.peers.write().await;
        if peers.iter().any(|peer| peer.uri.as_deref() == Some(uri)) {
            return Ok(());
        }
        peers.push(PeerEntry {
            uri: Some(uri.to_string()),
            remote_key: None,
            inbound: false,
            up: true,
            rx_bytes: 0,
            tx_bytes: 0,
            uptime: Duration::ZERO,
            latency: Some(Duration::from_millis(12)),
            priority: 0,
        });
        Ok(())
    }

    async fn remove_peer(&self, uri: &str, _source_iface: Option<&str>) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Stopped);
        }
        let mut peers = self.peers.write().await;
        match peers.iter().position(|peer| peer.uri.as_deref() == Some(uri)) {
            Some(index) if peers[index].up => {
                peers.remove(index);
                Ok(())
            }
            Some(_) => Err(CoreError::PeerRejected(format!(
                "{} is not currently attached",
                uri
            ))),
            None => Err(CoreError::PeerNotFound(uri.to_string())),
        }
    }

    async fn peers(&self) -> Vec<PeerEntry> {
        self.peers.read().await.clone()
    }

    async fn sessions(&self) -> Vec<SessionEntry> {
        self.sessions.read().await.clone()
    }

    async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Netstack bridge backed by loopback sockets.
pub struct MockNetstack {
    network: Arc<MockNetwork>,
    address: Ipv6Addr,
    subnet: Subnet,
    closed: Arc<AtomicBool>,
}

impl MockNetstack {
    fn ensure_open(&self) -> NetResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetstackError::Closed);
        }
        Ok(())
    }

    fn owns(&self, addr: &Ipv6Addr) -> bool {
        *addr == self.address || self.subnet.contains(addr)
    }
}

#[async_trait]
impl NetstackBridge for MockNetstack {
    async fn dial_tcp(&self, remote: SocketAddrV6) -> NetResult<Box<dyn OverlayStream>> {
        self.ensure_open()?;
        let real = self
            .network
            .lookup_tcp(&remote)
            .ok_or(NetstackError::NoRoute(remote))?;
        let stream = TcpStream::connect(real).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, remote: SocketAddrV6) -> NetResult<Box<dyn OverlayDatagram>> {
        self.ensure_open()?;
        let real = self
            .network
            .lookup_udp(&remote)
            .ok_or(NetstackError::NoRoute(remote))?;
        let bind: SocketAddr = if real.is_ipv4() {
            "127.0.0.1:0".parse().expect("literal addr")
        } else {
            "[::1]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(real).await?;
        Ok(Box::new(MockDatagram {
            socket,
            closed: self.closed.clone(),
        }))
    }

    async fn listen_tcp(&self, local: SocketAddrV6) -> NetResult<Box<dyn OverlayListener>> {
        self.ensure_open()?;
        if !self.owns(local.ip()) {
            return Err(NetstackError::NotOwned(local));
        }
        if self.network.tcp_route_exists(&local) {
            return Err(NetstackError::AddressInUse(local));
        }
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        self.network.register_tcp(local, listener.local_addr()?);
        Ok(Box::new(MockListener {
            inner: listener,
            local,
            network: self.network.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn listen_udp(&self, local: SocketAddrV6) -> NetResult<Box<dyn OverlayPacketSocket>> {
        self.ensure_open()?;
        if !self.owns(local.ip()) {
            return Err(NetstackError::NotOwned(local));
        }
        if self.network.udp_route_exists(&local) {
            return Err(NetstackError::AddressInUse(local));
        }
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        self.network.register_udp(local, socket.local_addr()?);
        Ok(Box::new(MockPacketSocket {
            socket,
            local,
            network: self.network.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct MockListener {
    inner: TcpListener,
    local: SocketAddrV6,
    network: Arc<MockNetwork>,
    closed: Arc<AtomicBool>,
}

impl Drop for MockListener {
    fn drop(&mut self) {
        self.network.unregister_tcp(&self.local);
    }
}

#[async_trait]
impl OverlayListener for MockListener {
    async fn accept(&self) -> NetResult<(Box<dyn OverlayStream>, SocketAddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetstackError::Closed);
        }
        let (stream, peer) = self.inner.accept().await?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> SocketAddrV6 {
        self.local
    }
}

struct MockDatagram {
    socket: UdpSocket,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl OverlayDatagram for MockDatagram {
    async fn send(&self, buf: &[u8]) -> NetResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetstackError::Closed);
        }
        Ok(self.socket.send(buf).await?)
    }

    async fn recv(&self, buf: &mut [u8]) -> NetResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetstackError::Closed);
        }
        Ok(self.socket.recv(buf).await?)
    }
}

struct MockPacketSocket {
    socket: UdpSocket,
    local: SocketAddrV6,
    network: Arc<MockNetwork>,
    closed: Arc<AtomicBool>,
}

impl Drop for MockPacketSocket {
    fn drop(&mut self) {
        self.network.unregister_udp(&self.local);
    }
}

#[async_trait]
impl OverlayPacketSocket for MockPacketSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> NetResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetstackError::Closed);
        }
        Ok(self.socket.send_to(buf, to).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetstackError::Closed);
        }
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> SocketAddrV6 {
        self.local
    }
}
