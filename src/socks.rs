//! SOCKS5 gateway into the overlay.
//!
//! Local applications CONNECT through a loopback listener; destinations are
//! resolved to overlay addresses and dialled through the netstack bridge.
//! No authentication is offered, the listener is meant for loopback only.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config;
use crate::error::{GatewayError, GatewayResult};
use crate::netstack::{NetstackBridge, NetstackError};
use crate::pipe;
use crate::resolver::NameResolver;
use crate::service::{Service, ServiceComponent, ServiceState};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// How long a CONNECT may spend dialling into the overlay.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// How long a nameserver round-trip may take.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration of the gateway listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksConfig {
    pub listen: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameserver: Option<Ipv6Addr>,
}

/// Gateway counters. Readable without any lock.
#[derive(Default)]
pub struct SocksStats {
    pub active: AtomicU64,
    pub total: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

/// Snapshot of the gateway reported over the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct SocksInner {
    config: Option<SocksConfig>,
    listen_addr: Option<SocketAddr>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// The SOCKS5 gateway. At most one listener at any time.
pub struct SocksGateway {
    service: Arc<Service>,
    stats: Arc<SocksStats>,
    inner: RwLock<SocksInner>,
}

impl SocksGateway {
    pub fn new(service: Arc<Service>) -> Self {
        SocksGateway {
            service,
            stats: Arc::new(SocksStats::default()),
            inner: RwLock::new(SocksInner {
                config: None,
                listen_addr: None,
                cancel: None,
                task: None,
            }),
        }
    }

    /// Start listening. Requires the service to be Running.
    pub async fn start(&self, config: SocksConfig) -> GatewayResult<()> {
        if self.service.state().await != ServiceState::Running {
            return Err(GatewayError::Proxy("service is not running".into()));
        }
        let netstack = self
            .service
            .netstack()
            .await
            .ok_or_else(|| GatewayError::Proxy("netstack unavailable".into()))?;

        let listener = TcpListener::bind(config.listen).await.map_err(|e| {
            GatewayError::Proxy(format!("failed to bind {}: {}", config.listen, e))
        })?;
        let listen_addr = listener.local_addr()?;

        let mut inner = self.inner.write().await;
        if inner.cancel.is_some() {
            return Err(GatewayError::Proxy("gateway is already listening".into()));
        }
        let cancel = CancellationToken::new();
        let resolver = Arc::new(NameResolver::new(config.nameserver));
        let task = tokio::spawn(accept_loop(
            listener,
            netstack,
            resolver,
            self.stats.clone(),
            cancel.clone(),
        ));

        inner.config = Some(config);
        inner.listen_addr = Some(listen_addr);
        inner.cancel = Some(cancel);
        inner.task = Some(task);
        info!("SOCKS5 gateway listening on {}", listen_addr);
        Ok(())
    }

    /// Close the listener and interrupt the accept loop. Connections that
    /// are already piping are left to finish on their own.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut inner = self.inner.write().await;
            inner.config = None;
            inner.listen_addr = None;
            (inner.cancel.take(), inner.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            task.await.ok();
            info!("SOCKS5 gateway stopped");
        }
    }

    /// Persist the gateway settings and apply them. Reconfiguration is a
    /// stop followed by a start.
    pub async fn configure(
        &self,
        enabled: bool,
        listen: Option<String>,
        nameserver: Option<String>,
    ) -> GatewayResult<()> {
        let store = self.service.settings_store();
        let mut settings = store.load().await?;

        let listen = listen.unwrap_or_else(|| settings.socks.listen.clone());
        let listen_addr: SocketAddr = listen
            .parse()
            .map_err(|_| GatewayError::Validation(format!("invalid listen address {:?}", listen)))?;
        let nameserver_addr = match &nameserver {
            Some(text) => Some(config::validate_overlay_address(text)?),
            None => None,
        };

        settings.socks.enabled = enabled;
        settings.socks.listen = listen;
        settings.socks.nameserver = nameserver;
        store.save(&settings).await?;

        self.stop().await;
        if enabled {
            self.start(SocksConfig {
                listen: listen_addr,
                nameserver: nameserver_addr,
            })
            .await?;
        }
        Ok(())
    }

    /// Counter snapshot plus listener state.
    pub async fn status(&self) -> SocksStatus {
        let inner = self.inner.read().await;
        SocksStatus {
            enabled: inner.cancel.is_some(),
            listen: inner.listen_addr,
            active_connections: self.stats.active.load(Ordering::Relaxed),
            total_connections: self.stats.total.load(Ordering::Relaxed),
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl ServiceComponent for SocksGateway {
    fn name(&self) -> &'static str {
        "socks-gateway"
    }

    async fn on_running(&self, _netstack: Arc<dyn NetstackBridge>) {
        let settings = match self.service.settings_store().load().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Cannot read SOCKS settings: {}", e);
                return;
            }
        };
        if !settings.socks.enabled {
            return;
        }
        let listen = match settings.socks.listen.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("Invalid SOCKS listen address {:?}", settings.socks.listen);
                return;
            }
        };
        let nameserver = settings
            .socks
            .nameserver
            .as_deref()
            .and_then(|text| config::validate_overlay_address(text).ok());
        if let Err(e) = self.start(SocksConfig { listen, nameserver }).await {
            warn!("SOCKS5 gateway failed to start: {}", e);
        }
    }

    async fn on_stopping(&self) {
        self.stop().await;
    }
}

/// Decrements the active gauge exactly once, however the connection ends.
struct ConnectionGuard {
    stats: Arc<SocksStats>,
}

impl ConnectionGuard {
    fn open(stats: &Arc<SocksStats>) -> Self {
        stats.total.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: stats.clone(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn accept_loop(
    listener: TcpListener,
    netstack: Arc<dyn NetstackBridge>,
    resolver: Arc<NameResolver>,
    stats: Arc<SocksStats>,
    cancel: CancellationToken,
) {
    loop {
        let (client, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    debug!("SOCKS accept failed: {}", e);
                    continue;
                }
            },
        };
        debug!("SOCKS client connected from {}", peer);

        let netstack = netstack.clone();
        let resolver = resolver.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(client, netstack, resolver, stats).await {
                debug!("SOCKS connection from {} ended: {}", peer, e);
            }
        });
    }
    debug!("SOCKS accept loop stopped");
}

async fn handle_client(
    mut client: TcpStream,
    netstack: Arc<dyn NetstackBridge>,
    resolver: Arc<NameResolver>,
    stats: Arc<SocksStats>,
) -> GatewayResult<()> {
    // Method negotiation.
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(GatewayError::Proxy(format!(
            "unsupported SOCKS version {}",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        client
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(GatewayError::Proxy(
            "client offers no acceptable authentication method".into(),
        ));
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT.
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(GatewayError::Proxy("malformed SOCKS request".into()));
    }

    let host = match request[3] {
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| GatewayError::Proxy("destination is not valid UTF-8".into()))?
        }
        ATYP_IPV4 => {
            // IPv4 targets cannot live inside the overlay.
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            let mut port = [0u8; 2];
            client.read_exact(&mut port).await?;
            send_reply(&mut client, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Err(GatewayError::Proxy("IPv4 destinations unsupported".into()));
        }
        other => {
            send_reply(&mut client, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Err(GatewayError::Proxy(format!("unknown address type {}", other)));
        }
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    if request[1] != CMD_CONNECT {
        send_reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(GatewayError::Proxy(format!(
            "unsupported command {}",
            request[1]
        )));
    }

    let target = match resolver
        .resolve(netstack.as_ref(), &host, RESOLVE_TIMEOUT)
        .await
    {
        Ok(addr) => addr,
        Err(e) => {
            send_reply(&mut client, REPLY_HOST_UNREACHABLE).await.ok();
            return Err(e);
        }
    };

    let remote = SocketAddrV6::new(target, port, 0, 0);
    let overlay = match tokio::time::timeout(CONNECT_TIMEOUT, netstack.dial_tcp(remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            send_reply(&mut client, reply_code(&e)).await.ok();
            return Err(e.into());
        }
        Err(_) => {
            send_reply(&mut client, REPLY_HOST_UNREACHABLE).await.ok();
            return Err(NetstackError::Timeout.into());
        }
    };

    let guard = ConnectionGuard::open(&stats);
    send_reply(&mut client, REPLY_SUCCEEDED).await?;
    debug!("SOCKS tunnel open to {}", remote);
    pipe::pipe_streams(client, overlay, &stats.bytes_in, &stats.bytes_out).await;
    drop(guard);
    Ok(())
}

async fn send_reply(client: &mut TcpStream, code: u8) -> GatewayResult<()> {
    // Bind address is not meaningful for a tunnelled CONNECT; zeros suffice.
    let reply = [SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    client.write_all(&reply).await?;
    Ok(())
}

fn reply_code(err: &NetstackError) -> u8 {
    match err {
        NetstackError::NoRoute(_) | NetstackError::Timeout => REPLY_HOST_UNREACHABLE,
        NetstackError::Unreachable(_) => REPLY_NETWORK_UNREACHABLE,
        NetstackError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            REPLY_CONNECTION_REFUSED
        }
        _ => REPLY_GENERAL_FAILURE,
    }
}
