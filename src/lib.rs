//! Userspace gateway to an end-to-end-encrypted IPv6 mesh overlay.
//!
//! A process embedding this crate joins the mesh by speaking the overlay
//! protocol to one or more peers, terminates the overlay's IPv6 stack in
//! userspace, and re-exposes the mesh to local applications through a
//! SOCKS5 gateway and bidirectional TCP/UDP port forwarders. No TUN
//! interface and no elevated privileges are involved.
//!
//! The [`service::Service`] state machine owns the overlay core; the
//! [`control::ControlPlane`] wires the peer registry, SOCKS gateway and
//! mapping manager around it and exposes the request/response surface a UI
//! bridge consumes. The overlay routing engine itself is a black box behind
//! the traits in [`core`] and [`netstack`].

pub mod config;
pub mod control;
pub mod core;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod netstack;
pub mod peers;
mod pipe;
pub mod resolver;
pub mod service;
pub mod socks;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use config::{MemorySettingsStore, Settings, SettingsStore, SocksSettings};
pub use control::{ControlPlane, ControlRequest, ControlResponse};
pub use error::{GatewayError, GatewayResult};
pub use mapping::{MappingKind, MappingManager, MappingSpec, MappingStatus};
pub use peers::{PeerInfo, PeerRegistry, SessionInfo};
pub use service::{NodeInfo, Service, ServiceState, StateChangeEvent};
pub use socks::{SocksConfig, SocksGateway, SocksStatus};
