//! Control-plane surface consumed by the UI bridge.
//!
//! Requests are tagged JSON objects (`{"op": "...", "payload": {...}}`);
//! responses always carry `success` plus either `data` or an error with a
//! stable code. State transitions are pushed separately through
//! [`ControlPlane::subscribe`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::SettingsStore;
use crate::core::CoreFactory;
use crate::error::{GatewayError, GatewayResult};
use crate::mapping::{MappingManager, MappingSpec};
use crate::peers::PeerRegistry;
use crate::service::{Service, StateChangeEvent};
use crate::socks::SocksGateway;

/// A request from the UI bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", content = "payload")]
pub enum ControlRequest {
    #[serde(rename = "node.start")]
    NodeStart,
    #[serde(rename = "node.stop")]
    NodeStop,
    #[serde(rename = "node.status")]
    NodeStatus,
    #[serde(rename = "peers.list")]
    PeersList,
    #[serde(rename = "peers.add")]
    PeersAdd { uri: String },
    #[serde(rename = "peers.remove")]
    PeersRemove { uri: String },
    #[serde(rename = "proxy.config")]
    ProxyConfig {
        enabled: bool,
        #[serde(default)]
        listen: Option<String>,
        #[serde(default)]
        nameserver: Option<String>,
    },
    #[serde(rename = "proxy.status")]
    ProxyStatus,
    #[serde(rename = "mapping.add")]
    MappingAdd(MappingSpec),
    #[serde(rename = "mapping.remove")]
    MappingRemove { id: String },
}

/// Error detail carried in a failed response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// A response to the UI bridge.
#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ControlResponse {
    fn ok(data: Value) -> Self {
        ControlResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn ok_empty() -> Self {
        ControlResponse {
            success: true,
            data: None,
            error: None,
        }
    }

    fn fail(code: &str, message: impl Into<String>) -> Self {
        ControlResponse {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Dispatches control requests against the gateway's components.
pub struct ControlPlane {
    service: Arc<Service>,
    peers: Arc<PeerRegistry>,
    socks: Arc<SocksGateway>,
    mappings: Arc<MappingManager>,
}

impl ControlPlane {
    /// Wire up the service, registry, gateway and mapping manager around
    /// the given core factory and settings store.
    pub async fn new(
        factory: Arc<dyn CoreFactory>,
        store: Arc<dyn SettingsStore>,
    ) -> GatewayResult<Arc<Self>> {
        let service = Service::new(factory, store.clone());
        let peers = Arc::new(PeerRegistry::new(service.clone()));
        let socks = Arc::new(SocksGateway::new(service.clone()));
        let mappings = Arc::new(MappingManager::new(service.clone()));

        let settings = store.load().await?;
        mappings.restore(settings.mappings).await;

        // Teardown order on stop: mappings first, then the SOCKS gateway.
        service.register_component(mappings.clone()).await;
        service.register_component(socks.clone()).await;

        Ok(Arc::new(ControlPlane {
            service,
            peers,
            socks,
            mappings,
        }))
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn socks(&self) -> &Arc<SocksGateway> {
        &self.socks
    }

    pub fn mappings(&self) -> &Arc<MappingManager> {
        &self.mappings
    }

    /// Subscribe to pushed state-change events.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChangeEvent> {
        self.service.subscribe().await
    }

    /// Handle a raw JSON request line.
    pub async fn handle_json(&self, raw: &str) -> ControlResponse {
        match serde_json::from_str::<ControlRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => ControlResponse::fail("PARSE_ERROR", e.to_string()),
        }
    }

    /// Handle a request and produce the response envelope.
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::NodeStart => match self.service.start().await {
                Ok(()) => self.status_response().await,
                Err(e) => ControlResponse::fail(start_code(&e), e.to_string()),
            },
            ControlRequest::NodeStop => match self.service.stop().await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(e) => ControlResponse::fail(stop_code(&e), e.to_string()),
            },
            ControlRequest::NodeStatus => self.status_response().await,
            ControlRequest::PeersList => match self.peers.list().await {
                Ok(peers) => ControlResponse::ok(json!({ "peers": peers })),
                Err(e) => ControlResponse::fail(e.code(), e.to_string()),
            },
            ControlRequest::PeersAdd { uri } => match self.peers.add(&uri).await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(e) => ControlResponse::fail(e.code(), e.to_string()),
            },
            ControlRequest::PeersRemove { uri } => match self.peers.remove(&uri).await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(e) => ControlResponse::fail(e.code(), e.to_string()),
            },
            ControlRequest::ProxyConfig {
                enabled,
                listen,
                nameserver,
            } => match self.socks.configure(enabled, listen, nameserver).await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(e @ GatewayError::Validation(_)) => {
                    ControlResponse::fail(e.code(), e.to_string())
                }
                Err(e) => ControlResponse::fail("PROXY_ERROR", e.to_string()),
            },
            ControlRequest::ProxyStatus => {
                let status = self.socks.status().await;
                ControlResponse::ok(json!(status))
            }
            ControlRequest::MappingAdd(spec) => match self.mappings.add(spec).await {
                Ok(status) => ControlResponse::ok(json!(status)),
                Err(e @ GatewayError::Validation(_)) => {
                    ControlResponse::fail(e.code(), e.to_string())
                }
                Err(e) => ControlResponse::fail("MAPPING_ERROR", e.to_string()),
            },
            ControlRequest::MappingRemove { id } => match self.mappings.remove(&id).await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(e) => ControlResponse::fail("MAPPING_ERROR", e.to_string()),
            },
        }
    }

    async fn status_response(&self) -> ControlResponse {
        let state = self.service.state().await;
        let node_info = self.service.node_info().await;
        let peer_stats = self.peers.stats().await.unwrap_or_default();
        let proxy = self.socks.status().await;
        let mappings = self.mappings.list().await;
        ControlResponse::ok(json!({
            "state": state,
            "node_info": node_info,
            "stats": {
                "peers": peer_stats,
                "proxy": proxy,
                "mappings": mappings,
            },
        }))
    }
}

fn start_code(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Config(_) | GatewayError::Validation(_) => "CONFIG_ERROR",
        GatewayError::State(_) => "STATE_ERROR",
        _ => "START_ERROR",
    }
}

fn stop_code(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::State(_) => "STATE_ERROR",
        _ => "STOP_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySettingsStore;
    use crate::service::ServiceState;
    use crate::test_utils::{MockCoreFactory, MockNetwork};

    async fn new_control() -> Arc<ControlPlane> {
        let factory = Arc::new(MockCoreFactory::new(MockNetwork::new()));
        ControlPlane::new(factory, Arc::new(MemorySettingsStore::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn requests_parse_from_tagged_json() {
        let control = new_control().await;
        let response = control
            .handle_json(r#"{"op": "node.status"}"#)
            .await;
        assert!(response.success);

        let response = control.handle_json(r#"{"op": "bogus.op"}"#).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "PARSE_ERROR");
    }

    #[tokio::test]
    async fn start_status_stop_round_trip() {
        let control = new_control().await;

        let response = control.handle(ControlRequest::NodeStart).await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(control.service().state().await, ServiceState::Running);

        let data = response.data.unwrap();
        let address = data["node_info"]["address"].as_str().unwrap().to_string();
        assert!(address.starts_with("2") || address.starts_with("3"));

        let response = control.handle(ControlRequest::NodeStop).await;
        assert!(response.success);
        assert_eq!(control.service().state().await, ServiceState::Stopped);

        let status = control.handle(ControlRequest::NodeStatus).await;
        let data = status.data.unwrap();
        assert_eq!(data["state"], json!("stopped"));
        assert!(data["node_info"].is_null());
    }

    #[tokio::test]
    async fn stop_while_stopped_succeeds() {
        let control = new_control().await;
        let response = control.handle(ControlRequest::NodeStop).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn peer_errors_carry_validation_codes() {
        let control = new_control().await;
        let response = control
            .handle(ControlRequest::PeersAdd {
                uri: "tcp://peer.example:65536".into(),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn proxy_config_requires_running_service() {
        let control = new_control().await;
        let response = control
            .handle(ControlRequest::ProxyConfig {
                enabled: true,
                listen: Some("127.0.0.1:0".into()),
                nameserver: None,
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "PROXY_ERROR");
    }

    #[tokio::test]
    async fn mapping_validation_errors_are_typed() {
        let control = new_control().await;
        let response = control
            .handle_json(
                r#"{"op": "mapping.add", "payload": {"kind": "local-tcp", "source": "", "target": "[200::1]:80"}}"#,
            )
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "VALIDATION_ERROR");

        let response = control
            .handle(ControlRequest::MappingRemove { id: "missing".into() })
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "MAPPING_ERROR");
    }

    #[tokio::test]
    async fn events_fan_out_on_transitions() {
        let control = new_control().await;
        let mut events = control.subscribe().await;
        control.handle(ControlRequest::NodeStart).await;
        control.handle(ControlRequest::NodeStop).await;

        let states: Vec<(ServiceState, ServiceState)> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|event| (event.previous, event.current))
        .collect();
        assert_eq!(
            states,
            vec![
                (ServiceState::Stopped, ServiceState::Starting),
                (ServiceState::Starting, ServiceState::Running),
                (ServiceState::Running, ServiceState::Stopping),
                (ServiceState::Stopping, ServiceState::Stopped),
            ]
        );
    }
}
