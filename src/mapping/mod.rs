//! Port mappings between local sockets and the overlay.
//!
//! Four forwarder kinds exist: `local-tcp` and `local-udp` accept local
//! traffic and carry it into the overlay, `remote-tcp` and `remote-udp`
//! listen on an overlay address owned by this node and carry traffic to a
//! host-network target. All four share one accounting convention:
//! `bytes_in` counts data from the overlay toward the local side,
//! `bytes_out` the reverse, regardless of which side accepts.

mod tcp;
mod udp;

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::identity;
use crate::netstack::NetstackBridge;
use crate::service::{Service, ServiceComponent, ServiceState};

/// The four forwarder kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingKind {
    LocalTcp,
    RemoteTcp,
    LocalUdp,
    RemoteUdp,
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingKind::LocalTcp => write!(f, "local-tcp"),
            MappingKind::RemoteTcp => write!(f, "remote-tcp"),
            MappingKind::LocalUdp => write!(f, "local-udp"),
            MappingKind::RemoteUdp => write!(f, "remote-udp"),
        }
    }
}

/// A declared port mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSpec {
    /// Assigned by the manager when empty.
    #[serde(default)]
    pub id: String,
    pub kind: MappingKind,
    pub source: String,
    pub target: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A mapping as reported over the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingStatus {
    pub id: String,
    pub kind: MappingKind,
    pub source: String,
    pub target: String,
    pub enabled: bool,
    pub active: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct ForwarderRuntime {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One mapping with its counters and, while active, its forwarder tasks.
pub(crate) struct MappingEntry {
    pub(crate) id: String,
    pub(crate) kind: MappingKind,
    pub(crate) source: String,
    pub(crate) target: String,
    enabled: AtomicBool,
    pub(crate) active: AtomicBool,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    runtime: Mutex<Option<ForwarderRuntime>>,
}

impl MappingEntry {
    fn new(spec: MappingSpec) -> Self {
        MappingEntry {
            id: spec.id,
            kind: spec.kind,
            source: spec.source,
            target: spec.target,
            enabled: AtomicBool::new(spec.enabled),
            active: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            runtime: Mutex::new(None),
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn spec(&self) -> MappingSpec {
        MappingSpec {
            id: self.id.clone(),
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
            enabled: self.enabled(),
        }
    }

    fn status(&self) -> MappingStatus {
        MappingStatus {
            id: self.id.clone(),
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
            enabled: self.enabled(),
            active: self.active.load(Ordering::SeqCst),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Owns the mapping set and starts and stops forwarders with the service.
pub struct MappingManager {
    service: Arc<Service>,
    entries: RwLock<HashMap<String, Arc<MappingEntry>>>,
}

impl MappingManager {
    pub fn new(service: Arc<Service>) -> Self {
        MappingManager {
            service,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Populate the set from persisted specs without writing back. Invalid
    /// specs are skipped with a warning.
    pub async fn restore(&self, specs: Vec<MappingSpec>) {
        let mut entries = self.entries.write().await;
        for mut spec in specs {
            if let Err(e) = validate_spec(&spec) {
                warn!("Skipping persisted mapping {:?}: {}", spec.id, e);
                continue;
            }
            if spec.id.is_empty() {
                spec.id = Uuid::new_v4().to_string();
            }
            let entry = Arc::new(MappingEntry::new(spec));
            entries.insert(entry.id.clone(), entry);
        }
    }

    /// Add a mapping, persist it, and start it when enabled and Running.
    pub async fn add(&self, mut spec: MappingSpec) -> GatewayResult<MappingStatus> {
        validate_spec(&spec)?;
        if spec.id.is_empty() {
            spec.id = Uuid::new_v4().to_string();
        }

        let entry = Arc::new(MappingEntry::new(spec));
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&entry.id) {
                return Err(GatewayError::Mapping(format!(
                    "duplicate mapping id {:?}",
                    entry.id
                )));
            }
            entries.insert(entry.id.clone(), entry.clone());
        }

        if entry.enabled() && self.service.state().await == ServiceState::Running {
            if let Some(netstack) = self.service.netstack().await {
                if let Err(e) = self.start_entry(&entry, netstack).await {
                    self.entries.write().await.remove(&entry.id);
                    return Err(e);
                }
            }
        }

        self.persist().await?;
        Ok(entry.status())
    }

    /// Stop and drop a mapping.
    pub async fn remove(&self, id: &str) -> GatewayResult<()> {
        let entry = self
            .entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| GatewayError::Mapping(format!("no such mapping {:?}", id)))?;
        stop_entry(&entry).await;
        self.persist().await?;
        info!("Mapping {} removed", id);
        Ok(())
    }

    /// Toggle a mapping, starting or stopping its forwarder as needed.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> GatewayResult<()> {
        let entry = self
            .entries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::Mapping(format!("no such mapping {:?}", id)))?;
        entry.enabled.store(enabled, Ordering::SeqCst);

        if enabled {
            if self.service.state().await == ServiceState::Running {
                if let Some(netstack) = self.service.netstack().await {
                    self.start_entry(&entry, netstack).await?;
                }
            }
        } else {
            stop_entry(&entry).await;
        }
        self.persist().await?;
        Ok(())
    }

    /// Status of every mapping.
    pub async fn list(&self) -> Vec<MappingStatus> {
        let mut statuses: Vec<MappingStatus> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    async fn start_entry(
        &self,
        entry: &Arc<MappingEntry>,
        netstack: Arc<dyn NetstackBridge>,
    ) -> GatewayResult<()> {
        let mut runtime = entry.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let task = match entry.kind {
            MappingKind::LocalTcp => {
                tcp::start_local(entry.clone(), netstack, cancel.clone()).await?
            }
            MappingKind::RemoteTcp => {
                tcp::start_remote(entry.clone(), netstack, cancel.clone()).await?
            }
            MappingKind::LocalUdp => {
                udp::start_local(entry.clone(), netstack, cancel.clone()).await?
            }
            MappingKind::RemoteUdp => {
                udp::start_remote(entry.clone(), netstack, cancel.clone()).await?
            }
        };
        entry.active.store(true, Ordering::SeqCst);
        *runtime = Some(ForwarderRuntime { cancel, task });
        Ok(())
    }

    async fn persist(&self) -> GatewayResult<()> {
        let specs: Vec<MappingSpec> = {
            let entries = self.entries.read().await;
            let mut specs: Vec<MappingSpec> =
                entries.values().map(|entry| entry.spec()).collect();
            specs.sort_by(|a, b| a.id.cmp(&b.id));
            specs
        };
        let store = self.service.settings_store();
        let mut settings = store.load().await?;
        settings.mappings = specs;
        store.save(&settings).await
    }
}

#[async_trait]
impl ServiceComponent for MappingManager {
    fn name(&self) -> &'static str {
        "mapping-manager"
    }

    async fn on_running(&self, netstack: Arc<dyn NetstackBridge>) {
        let entries: Vec<Arc<MappingEntry>> =
            self.entries.read().await.values().cloned().collect();
        for entry in entries {
            if !entry.enabled() {
                continue;
            }
            if let Err(e) = self.start_entry(&entry, netstack.clone()).await {
                warn!("Mapping {} failed to start: {}", entry.id, e);
            }
        }
    }

    async fn on_stopping(&self) {
        let entries: Vec<Arc<MappingEntry>> =
            self.entries.read().await.values().cloned().collect();
        for entry in entries {
            stop_entry(&entry).await;
        }
    }
}

/// Cancel a forwarder and wait for its loops to unwind.
async fn stop_entry(entry: &Arc<MappingEntry>) {
    let runtime = entry.runtime.lock().await.take();
    if let Some(runtime) = runtime {
        runtime.cancel.cancel();
        runtime.task.await.ok();
    }
    entry.active.store(false, Ordering::SeqCst);
}

fn validate_spec(spec: &MappingSpec) -> GatewayResult<()> {
    if spec.source.is_empty() {
        return Err(GatewayError::Validation("mapping source is empty".into()));
    }
    if spec.target.is_empty() {
        return Err(GatewayError::Validation("mapping target is empty".into()));
    }
    match spec.kind {
        MappingKind::LocalTcp | MappingKind::LocalUdp => {
            parse_local_endpoint(&spec.source)?;
            parse_overlay_endpoint(&spec.target)?;
        }
        MappingKind::RemoteTcp | MappingKind::RemoteUdp => {
            parse_overlay_endpoint(&spec.source)?;
            parse_local_endpoint(&spec.target)?;
        }
    }
    Ok(())
}

fn parse_local_endpoint(text: &str) -> GatewayResult<SocketAddr> {
    text.parse::<SocketAddr>()
        .map_err(|_| GatewayError::Validation(format!("invalid endpoint {:?}", text)))
}

fn parse_overlay_endpoint(text: &str) -> GatewayResult<SocketAddrV6> {
    let addr = text
        .parse::<SocketAddr>()
        .map_err(|_| GatewayError::Validation(format!("invalid endpoint {:?}", text)))?;
    match addr {
        SocketAddr::V6(v6) if identity::in_overlay_range(v6.ip()) => {
            Ok(SocketAddrV6::new(*v6.ip(), v6.port(), 0, 0))
        }
        _ => Err(GatewayError::Validation(format!(
            "{} is not an overlay endpoint",
            text
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: MappingKind, source: &str, target: &str) -> MappingSpec {
        MappingSpec {
            id: String::new(),
            kind,
            source: source.into(),
            target: target.into(),
            enabled: true,
        }
    }

    #[test]
    fn kind_names_round_trip_through_serde() {
        let json = serde_json::to_string(&MappingKind::LocalTcp).unwrap();
        assert_eq!(json, "\"local-tcp\"");
        let kind: MappingKind = serde_json::from_str("\"remote-udp\"").unwrap();
        assert_eq!(kind, MappingKind::RemoteUdp);
        assert!(serde_json::from_str::<MappingKind>("\"sideways-tcp\"").is_err());
    }

    #[test]
    fn local_specs_need_an_overlay_target() {
        validate_spec(&spec(
            MappingKind::LocalTcp,
            "127.0.0.1:2222",
            "[200:abcd::1]:22",
        ))
        .unwrap();
        assert!(validate_spec(&spec(
            MappingKind::LocalTcp,
            "127.0.0.1:2222",
            "192.0.2.1:22"
        ))
        .is_err());
        assert!(validate_spec(&spec(
            MappingKind::LocalUdp,
            "127.0.0.1:53",
            "[fe80::1]:53"
        ))
        .is_err());
    }

    #[test]
    fn remote_specs_need_an_overlay_source() {
        validate_spec(&spec(
            MappingKind::RemoteTcp,
            "[200:abcd::1]:80",
            "127.0.0.1:8080",
        ))
        .unwrap();
        assert!(validate_spec(&spec(
            MappingKind::RemoteUdp,
            "127.0.0.1:53",
            "127.0.0.1:5353"
        ))
        .is_err());
    }

    #[test]
    fn empty_endpoints_are_rejected() {
        assert!(validate_spec(&spec(MappingKind::LocalTcp, "", "[200::1]:22")).is_err());
        assert!(validate_spec(&spec(MappingKind::LocalTcp, "127.0.0.1:2222", "")).is_err());
        assert!(validate_spec(&spec(MappingKind::LocalTcp, "127.0.0.1:2222", "nope")).is_err());
    }

    use crate::config::MemorySettingsStore;
    use crate::test_utils::{MockCoreFactory, MockNetwork};

    async fn new_manager() -> (Arc<Service>, Arc<MappingManager>) {
        let factory = Arc::new(MockCoreFactory::new(MockNetwork::new()));
        let service = Service::new(factory, Arc::new(MemorySettingsStore::default()));
        let manager = Arc::new(MappingManager::new(service.clone()));
        service.register_component(manager.clone()).await;
        (service, manager)
    }

    #[tokio::test]
    async fn mappings_stay_inactive_while_stopped() {
        let (service, manager) = new_manager().await;
        let status = manager
            .add(spec(
                MappingKind::LocalTcp,
                "127.0.0.1:42581",
                "[200:abcd::8]:22",
            ))
            .await
            .unwrap();
        assert!(status.enabled);
        assert!(!status.active);
        assert!(!status.id.is_empty());

        // The declared mapping is persisted.
        let settings = service.settings_store().load().await.unwrap();
        assert_eq!(settings.mappings.len(), 1);
        assert_eq!(settings.mappings[0].id, status.id);
    }

    #[tokio::test]
    async fn enabled_mappings_follow_the_service_and_the_toggle() {
        let (service, manager) = new_manager().await;
        let status = manager
            .add(spec(
                MappingKind::LocalTcp,
                "127.0.0.1:42582",
                "[200:abcd::8]:22",
            ))
            .await
            .unwrap();

        service.start().await.unwrap();
        assert!(manager.list().await[0].active);

        manager.set_enabled(&status.id, false).await.unwrap();
        assert!(!manager.list().await[0].active);
        manager.set_enabled(&status.id, true).await.unwrap();
        assert!(manager.list().await[0].active);

        service.stop().await.unwrap();
        assert!(!manager.list().await[0].active);
    }

    #[tokio::test]
    async fn failed_bind_surfaces_and_leaves_no_entry() {
        let (service, manager) = new_manager().await;
        service.start().await.unwrap();

        manager
            .add(spec(
                MappingKind::LocalTcp,
                "127.0.0.1:42583",
                "[200:abcd::8]:22",
            ))
            .await
            .unwrap();
        // Same local source again: the bind fails and the entry is dropped.
        let err = manager
            .add(spec(
                MappingKind::LocalTcp,
                "127.0.0.1:42583",
                "[200:abcd::9]:23",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Mapping(_)));
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn restore_skips_invalid_specs() {
        let (_service, manager) = new_manager().await;
        manager
            .restore(vec![
                spec(MappingKind::LocalUdp, "127.0.0.1:42584", "[200:abcd::8]:53"),
                spec(MappingKind::LocalUdp, "127.0.0.1:42585", "not-an-endpoint"),
            ])
            .await;
        assert_eq!(manager.list().await.len(), 1);
    }
}
