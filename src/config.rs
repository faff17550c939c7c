//! Persistent settings and materialisation of the overlay core config.
//!
//! Settings are owned by an external collaborator (file store, keychain);
//! the gateway only sees them through [`SettingsStore`]. Materialisation
//! validates everything up front, generates a missing identity and writes
//! it back, and emits the [`CoreConfig`] the overlay core is built from.

use std::net::Ipv6Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::core::CoreConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::identity::{self, IdentityKeyPair};
use crate::mapping::MappingSpec;

/// Longest accepted peer or listen URI.
pub const MAX_URI_LENGTH: usize = 2048;

/// Transport schemes the overlay core understands.
const URI_SCHEMES: &[&str] = &["tcp", "tls", "quic", "ws", "wss", "unix"];

/// Schemes that cannot infer a port and therefore require one.
const PORT_REQUIRED_SCHEMES: &[&str] = &["tcp", "tls", "quic"];

/// Characters rejected in URIs besides control bytes.
const FORBIDDEN_URI_CHARS: &[char] = &[
    ';', '`', '$', '|', '&', '<', '>', '(', ')', '{', '}', '\'', '"', '\\', ' ',
];

/// Persistent gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Hex Ed25519 seed. Held by the secure store; never sent over the
    /// control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Hex public key matching `private_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Declared peer URIs.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Transport listener URIs.
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Interface name patterns for multicast discovery; empty disables it.
    #[serde(default)]
    pub multicast_regexes: Vec<String>,

    /// Hex public keys allowed to peer with us; empty allows anyone.
    #[serde(default)]
    pub allowed_keys: Vec<String>,

    /// SOCKS5 gateway settings.
    #[serde(default)]
    pub socks: SocksSettings,

    /// Declared port mappings.
    #[serde(default)]
    pub mappings: Vec<MappingSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            private_key: None,
            public_key: None,
            peers: Vec::new(),
            listen: default_listen(),
            multicast_regexes: Vec::new(),
            allowed_keys: Vec::new(),
            socks: SocksSettings::default(),
            mappings: Vec::new(),
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["tcp://0.0.0.0:0".to_string()]
}

/// Persistent SOCKS5 gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Local listen endpoint, normally on loopback.
    #[serde(default = "default_socks_listen")]
    pub listen: String,

    /// Optional overlay nameserver consulted for hostnames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameserver: Option<String>,
}

impl Default for SocksSettings {
    fn default() -> Self {
        SocksSettings {
            enabled: false,
            listen: default_socks_listen(),
            nameserver: None,
        }
    }
}

fn default_socks_listen() -> String {
    "127.0.0.1:1080".to_string()
}

/// Access to the settings owned by the persistence collaborator.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> GatewayResult<Settings>;

    async fn save(&self, settings: &Settings) -> GatewayResult<()>;
}

/// In-memory settings store.
///
/// The embedding application provides durable storage; this implementation
/// backs tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySettingsStore {
    inner: RwLock<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        MemorySettingsStore {
            inner: RwLock::new(settings),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> GatewayResult<Settings> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, settings: &Settings) -> GatewayResult<()> {
        *self.inner.write().await = settings.clone();
        Ok(())
    }
}

struct ParsedUri<'a> {
    scheme: &'a str,
    port: Option<u32>,
    key: Option<&'a str>,
}

fn validation(message: impl Into<String>) -> GatewayError {
    GatewayError::Validation(message.into())
}

fn parse_uri(uri: &str) -> GatewayResult<ParsedUri<'_>> {
    if uri.len() > MAX_URI_LENGTH {
        return Err(validation(format!(
            "URI exceeds {} characters",
            MAX_URI_LENGTH
        )));
    }
    if uri.chars().any(|c| c.is_control()) {
        return Err(validation("URI contains control characters"));
    }
    if let Some(c) = uri.chars().find(|c| FORBIDDEN_URI_CHARS.contains(c)) {
        return Err(validation(format!("URI contains forbidden character {:?}", c)));
    }

    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| validation("URI is missing a scheme"))?;
    if !URI_SCHEMES.contains(&scheme) {
        return Err(validation(format!("unsupported scheme {:?}", scheme)));
    }

    if scheme == "unix" {
        if rest.is_empty() {
            return Err(validation("unix URI requires a socket path"));
        }
        return Ok(ParsedUri {
            scheme,
            port: None,
            key: None,
        });
    }

    let (hostport, key) = match rest.split_once('?') {
        Some((hostport, query)) => {
            let key = query
                .strip_prefix("key=")
                .ok_or_else(|| validation(format!("unsupported URI parameter {:?}", query)))?;
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(validation("peer key must be 64 hex characters"));
            }
            (hostport, Some(key))
        }
        None => (rest, None),
    };

    let (host, port) = split_host_port(hostport)?;
    if host.is_empty() {
        return Err(validation(format!("{} URI requires a host", scheme)));
    }

    Ok(ParsedUri { scheme, port, key })
}

fn split_host_port(hostport: &str) -> GatewayResult<(&str, Option<u32>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| validation("unterminated IPv6 host"))?;
        host.parse::<Ipv6Addr>()
            .map_err(|_| validation(format!("invalid IPv6 host {:?}", host)))?;
        match after {
            "" => Ok((host, None)),
            port => {
                let port = port
                    .strip_prefix(':')
                    .ok_or_else(|| validation("invalid port separator"))?;
                Ok((host, Some(parse_port(port)?)))
            }
        }
    } else {
        match hostport.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                Err(validation("IPv6 hosts must be bracketed"))
            }
            Some((host, port)) => Ok((host, Some(parse_port(port)?))),
            None => Ok((hostport, None)),
        }
    }
}

fn parse_port(port: &str) -> GatewayResult<u32> {
    port.parse::<u32>()
        .map_err(|_| validation(format!("invalid port {:?}", port)))
}

/// Validate a peer URI against the accepted transport grammar.
pub fn validate_peer_uri(uri: &str) -> GatewayResult<()> {
    let parsed = parse_uri(uri)?;
    if parsed.scheme == "unix" {
        return Ok(());
    }
    match parsed.port {
        Some(port) if (1..=65535).contains(&port) => Ok(()),
        Some(port) => Err(validation(format!("port {} out of range", port))),
        None if PORT_REQUIRED_SCHEMES.contains(&parsed.scheme) => Err(validation(format!(
            "{} peers require an explicit port",
            parsed.scheme
        ))),
        None => Ok(()),
    }
}

/// Validate a transport listener URI. Port 0 requests an ephemeral port.
pub fn validate_listen_uri(uri: &str) -> GatewayResult<()> {
    let parsed = parse_uri(uri)?;
    if parsed.key.is_some() {
        return Err(validation("listeners do not take a key parameter"));
    }
    match parsed.port {
        Some(port) if port > 65535 => Err(validation(format!("port {} out of range", port))),
        _ => Ok(()),
    }
}

/// Parse a textual IPv6 address and require it to be an overlay address.
pub fn validate_overlay_address(text: &str) -> GatewayResult<Ipv6Addr> {
    let addr = text
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<Ipv6Addr>()
        .map_err(|_| validation(format!("invalid IPv6 address {:?}", text)))?;
    if !identity::in_overlay_range(&addr) {
        return Err(validation(format!("{} is outside the overlay range", addr)));
    }
    Ok(addr)
}

fn parse_key_hex(text: &str) -> GatewayResult<[u8; 32]> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(text, &mut key)
        .map_err(|_| GatewayError::Config(format!("invalid public key {:?}", text)))?;
    Ok(key)
}

/// Validate settings and produce the overlay core configuration.
///
/// Generates a fresh identity when none is stored and persists it through
/// the store before the core ever sees it. Returns the (possibly updated)
/// settings alongside the config.
pub async fn materialise(store: &dyn SettingsStore) -> GatewayResult<(CoreConfig, Settings)> {
    let mut settings = store.load().await?;

    for uri in &settings.peers {
        validate_peer_uri(uri)?;
    }
    for uri in &settings.listen {
        validate_listen_uri(uri)?;
    }

    let keys = match settings.private_key.as_deref() {
        Some(seed_hex) => IdentityKeyPair::from_hex(seed_hex)?,
        None => {
            let keys = IdentityKeyPair::generate();
            settings.private_key = Some(keys.private_key_hex().to_string());
            settings.public_key = Some(keys.public_key_hex());
            store.save(&settings).await?;
            info!("Generated new node identity {}", keys.public_key_hex());
            keys
        }
    };

    // Keep the stored public key consistent with the private key.
    let public_key_hex = keys.public_key_hex();
    if settings.public_key.as_deref() != Some(public_key_hex.as_str()) {
        settings.public_key = Some(public_key_hex);
        store.save(&settings).await?;
    }

    let allowed_keys = settings
        .allowed_keys
        .iter()
        .map(|text| parse_key_hex(text))
        .collect::<GatewayResult<Vec<_>>>()?;

    let config = CoreConfig {
        private_key: keys.private_key_bytes(),
        public_key: keys.public_key(),
        listen: settings.listen.clone(),
        peers: settings.peers.clone(),
        multicast_regexes: settings.multicast_regexes.clone(),
        allowed_keys,
        admin_listen: None,
    };

    Ok((config, settings))
}
