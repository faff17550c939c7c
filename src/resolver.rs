//! Overlay name resolution.
//!
//! Resolution policy, in order: literal overlay IPv6 addresses pass through,
//! public-key-encoded hostnames are derived locally, and anything else is
//! asked of the configured overlay nameserver with a plain AAAA query sent
//! through the netstack bridge. Without a nameserver, unknown names are not
//! resolvable.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::identity::{self, address_for_key};
use crate::netstack::NetstackBridge;

const DNS_PORT: u16 = 53;
const DNS_MAX_RESPONSE: usize = 4096;

/// Hostname suffix carrying a hex-encoded public key.
pub const PK_NAME_SUFFIX: &str = ".pk.ygg";

/// Resolves hostnames to overlay addresses.
pub struct NameResolver {
    nameserver: Option<Ipv6Addr>,
}

impl NameResolver {
    /// `nameserver` is an optional overlay-hosted DNS server.
    pub fn new(nameserver: Option<Ipv6Addr>) -> Self {
        NameResolver { nameserver }
    }

    /// Resolve `host` to an overlay address. `timeout` bounds the
    /// nameserver round-trip only.
    pub async fn resolve(
        &self,
        netstack: &dyn NetstackBridge,
        host: &str,
        timeout: Duration,
    ) -> GatewayResult<Ipv6Addr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if let Ok(addr) = host.parse::<Ipv6Addr>() {
            if identity::in_overlay_range(&addr) {
                return Ok(addr);
            }
            return Err(GatewayError::Validation(format!(
                "{} is outside the overlay range",
                addr
            )));
        }

        if let Some(key) = public_key_name(host) {
            return Ok(address_for_key(&key));
        }

        if let Some(nameserver) = self.nameserver {
            return self
                .query_nameserver(netstack, nameserver, host, timeout)
                .await;
        }

        Err(GatewayError::NotResolvable(host.to_string()))
    }

    async fn query_nameserver(
        &self,
        netstack: &dyn NetstackBridge,
        nameserver: Ipv6Addr,
        host: &str,
        timeout: Duration,
    ) -> GatewayResult<Ipv6Addr> {
        let name = Name::from_utf8(host)
            .map_err(|_| GatewayError::NotResolvable(format!("invalid hostname {:?}", host)))?;
        let mut message = Message::new();
        message
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, RecordType::AAAA));
        let wire = message
            .to_vec()
            .map_err(|e| GatewayError::NotResolvable(format!("query encoding failed: {}", e)))?;

        debug!("Resolving {} via overlay nameserver {}", host, nameserver);
        let conn = netstack
            .dial_udp(SocketAddrV6::new(nameserver, DNS_PORT, 0, 0))
            .await?;
        conn.send(&wire).await?;

        let mut buf = vec![0u8; DNS_MAX_RESPONSE];
        let n = tokio::time::timeout(timeout, conn.recv(&mut buf))
            .await
            .map_err(|_| GatewayError::NotResolvable(format!("query for {} timed out", host)))??;

        let response = Message::from_vec(&buf[..n])
            .map_err(|e| GatewayError::NotResolvable(format!("bad DNS response: {}", e)))?;
        if response.id() != message.id() {
            return Err(GatewayError::NotResolvable(format!(
                "mismatched DNS response id for {}",
                host
            )));
        }

        response
            .answers()
            .iter()
            .find_map(|record| match record.data() {
                Some(RData::AAAA(aaaa)) if identity::in_overlay_range(&aaaa.0) => Some(aaaa.0),
                _ => None,
            })
            .ok_or_else(|| GatewayError::NotResolvable(host.to_string()))
    }
}

/// Extract the public key from a `<64 hex>.pk.ygg` hostname.
fn public_key_name(host: &str) -> Option<[u8; 32]> {
    let label = host
        .to_ascii_lowercase()
        .strip_suffix(PK_NAME_SUFFIX)?
        .to_string();
    if label.len() != 64 {
        return None;
    }
    let mut key = [0u8; 32];
    hex::decode_to_slice(&label, &mut key).ok()?;
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CoreConfig, CoreFactory};
    use crate::identity::IdentityKeyPair;
    use crate::test_utils::{MockCoreFactory, MockNetwork};
    use hickory_proto::rr::rdata::AAAA;
    use hickory_proto::rr::Record;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    async fn new_netstack_on(network: Arc<MockNetwork>) -> Arc<dyn NetstackBridge> {
        let keys = IdentityKeyPair::generate();
        let factory = MockCoreFactory::new(network);
        let (_core, netstack) = factory
            .build(CoreConfig {
                private_key: keys.private_key_bytes(),
                public_key: keys.public_key(),
                listen: vec![],
                peers: vec![],
                multicast_regexes: vec![],
                allowed_keys: vec![],
                admin_listen: None,
            })
            .await
            .unwrap();
        netstack
    }

    async fn new_netstack() -> Arc<dyn NetstackBridge> {
        new_netstack_on(MockNetwork::new()).await
    }

    /// A loopback DNS server answering every AAAA query with `answer`.
    async fn spawn_dns(answer: Ipv6Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let query = Message::from_vec(&buf[..n]).unwrap();
                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query);
                if let Some(question) = query.queries().first() {
                    response.add_query(question.clone());
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        60,
                        RData::AAAA(AAAA(answer)),
                    ));
                }
                socket
                    .send_to(&response.to_vec().unwrap(), peer)
                    .await
                    .ok();
            }
        });
        addr
    }

    #[tokio::test]
    async fn nameserver_queries_resolve_overlay_hosts() {
        let network = MockNetwork::new();
        let netstack = new_netstack_on(network.clone()).await;

        let answer: Ipv6Addr = "200:1111::7".parse().unwrap();
        let dns = spawn_dns(answer).await;
        let nameserver: Ipv6Addr = "200:53::53".parse().unwrap();
        network.register_udp(SocketAddrV6::new(nameserver, 53, 0, 0), dns);

        let resolver = NameResolver::new(Some(nameserver));
        let addr = resolver
            .resolve(netstack.as_ref(), "service.mesh", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(addr, answer);
    }

    #[tokio::test]
    async fn non_overlay_answers_are_ignored() {
        let network = MockNetwork::new();
        let netstack = new_netstack_on(network.clone()).await;

        let dns = spawn_dns("2001:db8::1".parse().unwrap()).await;
        let nameserver: Ipv6Addr = "200:53::53".parse().unwrap();
        network.register_udp(SocketAddrV6::new(nameserver, 53, 0, 0), dns);

        let resolver = NameResolver::new(Some(nameserver));
        let err = resolver
            .resolve(netstack.as_ref(), "service.mesh", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotResolvable(_)));
    }

    #[tokio::test]
    async fn literal_overlay_addresses_pass_through() {
        let netstack = new_netstack().await;
        let resolver = NameResolver::new(None);
        let addr = resolver
            .resolve(netstack.as_ref(), "200:1234::1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(addr, "200:1234::1".parse::<Ipv6Addr>().unwrap());

        let bracketed = resolver
            .resolve(netstack.as_ref(), "[200:1234::1]", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(bracketed, addr);
    }

    #[tokio::test]
    async fn non_overlay_literals_are_rejected() {
        let netstack = new_netstack().await;
        let resolver = NameResolver::new(None);
        let err = resolver
            .resolve(netstack.as_ref(), "2001:db8::1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn public_key_names_derive_without_lookup() {
        let netstack = new_netstack().await;
        let resolver = NameResolver::new(None);
        let keys = IdentityKeyPair::generate();
        let host = format!("{}{}", keys.public_key_hex(), PK_NAME_SUFFIX);
        let addr = resolver
            .resolve(netstack.as_ref(), &host, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(addr, keys.address());

        // Uppercase hex derives the same address.
        let upper = format!("{}{}", keys.public_key_hex().to_uppercase(), PK_NAME_SUFFIX);
        let upper_addr = resolver
            .resolve(netstack.as_ref(), &upper, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(upper_addr, addr);
    }

    #[tokio::test]
    async fn unknown_names_fail_without_a_nameserver() {
        let netstack = new_netstack().await;
        let resolver = NameResolver::new(None);
        let err = resolver
            .resolve(netstack.as_ref(), "mesh.example", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotResolvable(_)));
    }

    #[test]
    fn malformed_pk_labels_are_not_keys() {
        assert!(public_key_name("abcd.pk.ygg").is_none());
        assert!(public_key_name(&format!("{}.pk.ygg", "zz".repeat(32))).is_none());
        assert!(public_key_name("mesh.example").is_none());
        assert!(public_key_name(&format!("{}.pk.ygg", "ab".repeat(32))).is_some());
    }
}
