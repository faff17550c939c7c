//! UDP forwarders with per-client session demultiplexing.
//!
//! Each distinct client endpoint gets its own datagram connection to the
//! forwarded destination plus a reply pump task, so answers reach exactly
//! the client that asked. Sessions die on their first read error and are
//! otherwise evicted by a sweeper once idle.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GatewayError, GatewayResult};
use crate::netstack::{NetResult, NetstackBridge, NetstackError, OverlayDatagram, OverlayPacketSocket};

use super::{parse_local_endpoint, parse_overlay_endpoint, MappingEntry};

const UDP_BUF_SIZE: usize = 65_535;

/// Sessions idle longer than this are evicted by the sweeper.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Per-client forwarding context, keyed by the client's source endpoint.
struct Session<C: ?Sized> {
    conn: Arc<C>,
    cancel: CancellationToken,
    /// Milliseconds since the forwarder's epoch, for idle eviction.
    last_active_ms: AtomicU64,
}

impl<C: ?Sized> Session<C> {
    fn new(conn: Arc<C>, cancel: CancellationToken, epoch: Instant) -> Arc<Self> {
        let session = Arc::new(Session {
            conn,
            cancel,
            last_active_ms: AtomicU64::new(0),
        });
        session.touch(epoch);
        session
    }

    fn touch(&self, epoch: Instant) {
        self.last_active_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self, epoch: Instant) -> Duration {
        let now = epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_active_ms.load(Ordering::Relaxed)))
    }
}

type SessionMap<C> = Arc<RwLock<HashMap<SocketAddr, Arc<Session<C>>>>>;

async fn evict_idle<C: ?Sized>(sessions: &SessionMap<C>, epoch: Instant, id: &str) {
    let idle: Vec<SocketAddr> = sessions
        .read()
        .await
        .iter()
        .filter(|(_, session)| session.idle(epoch) > SESSION_IDLE_TIMEOUT)
        .map(|(client, _)| *client)
        .collect();
    if idle.is_empty() {
        return;
    }
    let mut map = sessions.write().await;
    for client in idle {
        if let Some(session) = map.remove(&client) {
            session.cancel.cancel();
            debug!("Mapping {}: evicted idle session for {}", id, client);
        }
    }
}

pub(super) async fn start_local(
    entry: Arc<MappingEntry>,
    netstack: Arc<dyn NetstackBridge>,
    cancel: CancellationToken,
) -> GatewayResult<JoinHandle<()>> {
    let source = parse_local_endpoint(&entry.source)?;
    let target = parse_overlay_endpoint(&entry.target)?;
    let socket = UdpSocket::bind(source)
        .await
        .map_err(|e| GatewayError::Mapping(format!("failed to bind {}: {}", source, e)))?;
    info!("Mapping {}: {} -> overlay {}", entry.id, source, target);

    Ok(tokio::spawn(run_local(
        entry,
        netstack,
        cancel,
        Arc::new(socket),
        target,
    )))
}

async fn run_local(
    entry: Arc<MappingEntry>,
    netstack: Arc<dyn NetstackBridge>,
    cancel: CancellationToken,
    socket: Arc<UdpSocket>,
    target: SocketAddrV6,
) {
    let epoch = Instant::now();
    let sessions: SessionMap<dyn OverlayDatagram> = Arc::new(RwLock::new(HashMap::new()));
    let mut sweep = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => evict_idle(&sessions, epoch, &entry.id).await,
            received = socket.recv_from(&mut buf) => {
                let (n, client) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        debug!("Mapping {} receive failed: {}", entry.id, e);
                        continue;
                    }
                };
                let session = match local_session(
                    client, &entry, &netstack, &socket, &sessions, &cancel, target, epoch,
                )
                .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        debug!("Mapping {}: session to {} failed: {}", entry.id, target, e);
                        continue;
                    }
                };
                match session.conn.send(&buf[..n]).await {
                    Ok(sent) => {
                        entry.bytes_out.fetch_add(sent as u64, Ordering::Relaxed);
                        session.touch(epoch);
                    }
                    Err(e) => {
                        debug!("Mapping {}: overlay send for {} failed: {}", entry.id, client, e);
                        if let Some(session) = sessions.write().await.remove(&client) {
                            session.cancel.cancel();
                        }
                    }
                }
            }
        }
    }

    for (_, session) in sessions.write().await.drain() {
        session.cancel.cancel();
    }
    entry.active.store(false, Ordering::SeqCst);
    debug!("Mapping {} socket closed", entry.id);
}

/// Look up or open the overlay-side session for a local client.
#[allow(clippy::too_many_arguments)]
async fn local_session(
    client: SocketAddr,
    entry: &Arc<MappingEntry>,
    netstack: &Arc<dyn NetstackBridge>,
    socket: &Arc<UdpSocket>,
    sessions: &SessionMap<dyn OverlayDatagram>,
    parent: &CancellationToken,
    target: SocketAddrV6,
    epoch: Instant,
) -> NetResult<Arc<Session<dyn OverlayDatagram>>> {
    if let Some(session) = sessions.read().await.get(&client) {
        return Ok(session.clone());
    }

    let conn: Arc<dyn OverlayDatagram> = Arc::from(netstack.dial_udp(target).await?);
    let session = Session::new(conn.clone(), parent.child_token(), epoch);
    sessions.write().await.insert(client, session.clone());
    debug!("Mapping {}: new session for {}", entry.id, client);

    // Reply pump: overlay replies travel back to exactly this client.
    let entry = entry.clone();
    let socket = socket.clone();
    let sessions = sessions.clone();
    let pump = session.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let n = tokio::select! {
                _ = pump.cancel.cancelled() => break,
                received = conn.recv(&mut buf) => match received {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Mapping {}: session for {} ended: {}", entry.id, client, e);
                        break;
                    }
                },
            };
            if socket.send_to(&buf[..n], client).await.is_err() {
                break;
            }
            entry.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
            pump.touch(epoch);
        }
        sessions.write().await.remove(&client);
    });

    Ok(session)
}

pub(super) async fn start_remote(
    entry: Arc<MappingEntry>,
    netstack: Arc<dyn NetstackBridge>,
    cancel: CancellationToken,
) -> GatewayResult<JoinHandle<()>> {
    let source = parse_overlay_endpoint(&entry.source)?;
    let target = parse_local_endpoint(&entry.target)?;
    let packet: Arc<dyn OverlayPacketSocket> = Arc::from(
        netstack
            .listen_udp(source)
            .await
            .map_err(|e| GatewayError::Mapping(format!("failed to listen on {}: {}", source, e)))?,
    );
    info!("Mapping {}: overlay {} -> {}", entry.id, source, target);

    Ok(tokio::spawn(run_remote(entry, cancel, packet, target)))
}

async fn run_remote(
    entry: Arc<MappingEntry>,
    cancel: CancellationToken,
    packet: Arc<dyn OverlayPacketSocket>,
    target: SocketAddr,
) {
    let epoch = Instant::now();
    let sessions: SessionMap<UdpSocket> = Arc::new(RwLock::new(HashMap::new()));
    let mut sweep = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => evict_idle(&sessions, epoch, &entry.id).await,
            received = packet.recv_from(&mut buf) => {
                let (n, client) = match received {
                    Ok(pair) => pair,
                    Err(NetstackError::Closed) => {
                        debug!("Mapping {} overlay socket closed", entry.id);
                        break;
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        debug!("Mapping {} receive failed: {}", entry.id, e);
                        continue;
                    }
                };
                let session = match remote_session(
                    client, &entry, &packet, &sessions, &cancel, target, epoch,
                )
                .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        debug!("Mapping {}: session to {} failed: {}", entry.id, target, e);
                        continue;
                    }
                };
                match session.conn.send(&buf[..n]).await {
                    Ok(sent) => {
                        entry.bytes_in.fetch_add(sent as u64, Ordering::Relaxed);
                        session.touch(epoch);
                    }
                    Err(e) => {
                        debug!("Mapping {}: local send for {} failed: {}", entry.id, client, e);
                        if let Some(session) = sessions.write().await.remove(&client) {
                            session.cancel.cancel();
                        }
                    }
                }
            }
        }
    }

    for (_, session) in sessions.write().await.drain() {
        session.cancel.cancel();
    }
    entry.active.store(false, Ordering::SeqCst);
    debug!("Mapping {} socket closed", entry.id);
}

/// Look up or open the local-side session for an overlay client.
async fn remote_session(
    client: SocketAddr,
    entry: &Arc<MappingEntry>,
    packet: &Arc<dyn OverlayPacketSocket>,
    sessions: &SessionMap<UdpSocket>,
    parent: &CancellationToken,
    target: SocketAddr,
    epoch: Instant,
) -> std::io::Result<Arc<Session<UdpSocket>>> {
    if let Some(session) = sessions.read().await.get(&client) {
        return Ok(session.clone());
    }

    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };
    let conn = UdpSocket::bind(bind_addr).await?;
    conn.connect(target).await?;
    let session = Session::new(Arc::new(conn), parent.child_token(), epoch);
    sessions.write().await.insert(client, session.clone());
    debug!("Mapping {}: new session for {}", entry.id, client);

    let entry = entry.clone();
    let packet = packet.clone();
    let sessions = sessions.clone();
    let pump = session.clone();
    let conn = pump.conn.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let n = tokio::select! {
                _ = pump.cancel.cancelled() => break,
                received = conn.recv(&mut buf) => match received {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Mapping {}: session for {} ended: {}", entry.id, client, e);
                        break;
                    }
                },
            };
            if packet.send_to(&buf[..n], client).await.is_err() {
                break;
            }
            entry.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
            pump.touch(epoch);
        }
        sessions.write().await.remove(&client);
    });

    Ok(session)
}
