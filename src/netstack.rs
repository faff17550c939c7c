//! Socket-style access to the overlay through a userspace netstack.
//!
//! The bridge exposes dial and listen by overlay IPv6 address without ever
//! touching a kernel interface. Handles are tied to the core they were
//! created from; once the core stops, every outstanding handle fails its
//! next operation with [`NetstackError::Closed`].

use std::io;
use std::net::{SocketAddr, SocketAddrV6};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors reported by the netstack bridge.
#[derive(Error, Debug)]
pub enum NetstackError {
    #[error("No route to {0}")]
    NoRoute(SocketAddrV6),

    #[error("Dial timed out")]
    Timeout,

    #[error("Destination unreachable: {0}")]
    Unreachable(SocketAddrV6),

    #[error("Address in use: {0}")]
    AddressInUse(SocketAddrV6),

    #[error("Address not owned by this node: {0}")]
    NotOwned(SocketAddrV6),

    #[error("Netstack is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for netstack operations
pub type NetResult<T> = Result<T, NetstackError>;

/// A reliable byte stream whose remote end lives inside the overlay.
pub trait OverlayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> OverlayStream for T {}

/// Acceptor bound to an overlay TCP endpoint owned by this node.
#[async_trait]
pub trait OverlayListener: Send + Sync {
    async fn accept(&self) -> NetResult<(Box<dyn OverlayStream>, SocketAddr)>;

    fn local_addr(&self) -> SocketAddrV6;
}

/// A connected, unreliable datagram channel into the overlay.
#[async_trait]
pub trait OverlayDatagram: Send + Sync {
    async fn send(&self, buf: &[u8]) -> NetResult<usize>;

    async fn recv(&self, buf: &mut [u8]) -> NetResult<usize>;
}

/// An unconnected packet socket bound to an overlay UDP endpoint.
#[async_trait]
pub trait OverlayPacketSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> NetResult<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)>;

    fn local_addr(&self) -> SocketAddrV6;
}

/// Dial and listen on overlay addresses through the userspace stack.
///
/// Dial fails with `NoRoute`, `Timeout` or `Unreachable` when the overlay
/// cannot reach the destination; listen fails with `AddressInUse` or
/// `NotOwned` when the endpoint is not available to this node.
#[async_trait]
pub trait NetstackBridge: Send + Sync {
    async fn dial_tcp(&self, remote: SocketAddrV6) -> NetResult<Box<dyn OverlayStream>>;

    async fn dial_udp(&self, remote: SocketAddrV6) -> NetResult<Box<dyn OverlayDatagram>>;

    async fn listen_tcp(&self, local: SocketAddrV6) -> NetResult<Box<dyn OverlayListener>>;

    async fn listen_udp(&self, local: SocketAddrV6) -> NetResult<Box<dyn OverlayPacketSocket>>;
}
