//! TCP forwarders.
//!
//! `local-tcp` accepts on a host socket and dials the overlay target for
//! every connection; `remote-tcp` accepts on an overlay address owned by
//! this node and dials a host-network target. Per-connection failures are
//! logged and never stop the accept loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GatewayError, GatewayResult};
use crate::netstack::{NetstackBridge, NetstackError};
use crate::pipe;

use super::{parse_local_endpoint, parse_overlay_endpoint, MappingEntry};

pub(super) async fn start_local(
    entry: Arc<MappingEntry>,
    netstack: Arc<dyn NetstackBridge>,
    cancel: CancellationToken,
) -> GatewayResult<JoinHandle<()>> {
    let source = parse_local_endpoint(&entry.source)?;
    let target = parse_overlay_endpoint(&entry.target)?;
    let listener = TcpListener::bind(source)
        .await
        .map_err(|e| GatewayError::Mapping(format!("failed to bind {}: {}", source, e)))?;
    info!("Mapping {}: {} -> overlay {}", entry.id, source, target);

    Ok(tokio::spawn(async move {
        loop {
            let (client, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        debug!("Mapping {} accept failed: {}", entry.id, e);
                        continue;
                    }
                },
            };
            debug!("Mapping {}: connection from {}", entry.id, peer);

            let entry = entry.clone();
            let netstack = netstack.clone();
            tokio::spawn(async move {
                match netstack.dial_tcp(target).await {
                    Ok(overlay) => {
                        pipe::pipe_streams(client, overlay, &entry.bytes_in, &entry.bytes_out)
                            .await;
                    }
                    Err(e) => debug!("Mapping {} dial to {} failed: {}", entry.id, target, e),
                }
            });
        }
        entry.active.store(false, Ordering::SeqCst);
        debug!("Mapping {} listener closed", entry.id);
    }))
}

pub(super) async fn start_remote(
    entry: Arc<MappingEntry>,
    netstack: Arc<dyn NetstackBridge>,
    cancel: CancellationToken,
) -> GatewayResult<JoinHandle<()>> {
    let source = parse_overlay_endpoint(&entry.source)?;
    let target = parse_local_endpoint(&entry.target)?;
    let listener = netstack
        .listen_tcp(source)
        .await
        .map_err(|e| GatewayError::Mapping(format!("failed to listen on {}: {}", source, e)))?;
    info!("Mapping {}: overlay {} -> {}", entry.id, source, target);

    Ok(tokio::spawn(async move {
        loop {
            let (overlay, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(NetstackError::Closed) => {
                        debug!("Mapping {} overlay listener closed", entry.id);
                        break;
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        debug!("Mapping {} accept failed: {}", entry.id, e);
                        continue;
                    }
                },
            };
            debug!("Mapping {}: overlay connection from {}", entry.id, peer);

            let entry = entry.clone();
            tokio::spawn(async move {
                match TcpStream::connect(target).await {
                    Ok(local) => {
                        pipe::pipe_streams(local, overlay, &entry.bytes_in, &entry.bytes_out)
                            .await;
                    }
                    Err(e) => debug!("Mapping {} dial to {} failed: {}", entry.id, target, e),
                }
            });
        }
        entry.active.store(false, Ordering::SeqCst);
        debug!("Mapping {} listener closed", entry.id);
    }))
}
