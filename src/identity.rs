//! Node identity and overlay address derivation.
//!
//! Every node is identified by a long-lived Ed25519 keypair. The node's
//! overlay IPv6 address and its routed /64 subnet are derived
//! deterministically from the public key, so two nodes holding the same key
//! always produce identical address bytes.

use std::fmt;
use std::net::Ipv6Addr;

use ed25519_dalek::{SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{GatewayError, GatewayResult};

/// First byte of every overlay unicast address (the 0200::/7 range).
pub const ADDRESS_PREFIX: u8 = 0x02;

/// First byte of every overlay /64 subnet.
pub const SUBNET_PREFIX: u8 = 0x03;

/// The node's Ed25519 keypair.
///
/// The private half never leaves this type except as the hex form handed to
/// the secure settings store; intermediate buffers are scrubbed.
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        IdentityKeyPair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load a keypair from a 64-character hex seed.
    pub fn from_hex(seed_hex: &str) -> GatewayResult<Self> {
        let mut bytes = hex::decode(seed_hex)
            .map_err(|e| GatewayError::Config(format!("invalid private key hex: {}", e)))?;
        if bytes.len() != SECRET_KEY_LENGTH {
            let got = bytes.len();
            bytes.zeroize();
            return Err(GatewayError::Config(format!(
                "private key must be {} bytes, got {}",
                SECRET_KEY_LENGTH, got
            )));
        }
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        seed.copy_from_slice(&bytes);
        bytes.zeroize();
        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(IdentityKeyPair { signing })
    }

    /// The public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The public key as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// The private seed as lowercase hex, scrubbed when dropped.
    pub fn private_key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing.to_bytes()))
    }

    /// The private seed bytes, scrubbed when dropped.
    pub fn private_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing.to_bytes().to_vec())
    }

    /// The overlay address derived from the public key.
    pub fn address(&self) -> Ipv6Addr {
        address_for_key(&self.public_key())
    }

    /// The overlay /64 subnet derived from the public key.
    pub fn subnet(&self) -> Subnet {
        subnet_for_key(&self.public_key())
    }
}

/// A /64 overlay subnet, stored as its upper 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet(pub [u8; 8]);

impl Subnet {
    /// Prefix length of every overlay subnet.
    pub const PREFIX_LEN: u8 = 64;

    /// The subnet's network address (host bits cleared).
    pub fn network_address(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&self.0);
        Ipv6Addr::from(octets)
    }

    /// Whether `addr` falls inside this subnet.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        addr.octets()[..8] == self.0
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address(), Self::PREFIX_LEN)
    }
}

/// Derive the overlay unicast address for an Ed25519 public key.
///
/// The key bytes are inverted, the run of leading one bits is counted and
/// stripped together with the zero bit that terminates it, and the address
/// is assembled as `prefix | ones | remaining bits`.
pub fn address_for_key(public_key: &[u8; 32]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = ADDRESS_PREFIX;
    let (ones, tail) = compress_key(public_key);
    octets[1] = ones;
    octets[2..].copy_from_slice(&tail);
    Ipv6Addr::from(octets)
}

/// Derive the overlay /64 subnet for an Ed25519 public key.
///
/// Same derivation as the unicast address with the host bits dropped and the
/// subnet bit set in the leading byte.
pub fn subnet_for_key(public_key: &[u8; 32]) -> Subnet {
    let addr = address_for_key(public_key).octets();
    let mut net = [0u8; 8];
    net.copy_from_slice(&addr[..8]);
    net[0] |= 0x01;
    Subnet(net)
}

/// Whether `addr` is an overlay unicast address.
pub fn is_overlay_address(addr: &Ipv6Addr) -> bool {
    addr.octets()[0] == ADDRESS_PREFIX
}

/// Whether `addr` falls anywhere in the overlay range, unicast or subnet.
pub fn in_overlay_range(addr: &Ipv6Addr) -> bool {
    addr.octets()[0] & 0xfe == ADDRESS_PREFIX
}

/// Leading-ones count and the following 14 address bytes of the inverted key.
fn compress_key(public_key: &[u8; 32]) -> (u8, [u8; 14]) {
    let mut ones: u8 = 0;
    let mut done = false;
    let mut bits: u8 = 0;
    let mut n_bits: u8 = 0;
    let mut tail = [0u8; 14];
    let mut tail_len = 0;

    for idx in 0..8 * public_key.len() {
        let bit = (!public_key[idx / 8] >> (7 - (idx % 8))) & 1;
        if !done {
            if bit == 1 {
                ones = ones.wrapping_add(1);
            } else {
                // The first zero bit terminates the run and is dropped too.
                done = true;
            }
            continue;
        }
        bits = (bits << 1) | bit;
        n_bits += 1;
        if n_bits == 8 {
            tail[tail_len] = bits;
            tail_len += 1;
            n_bits = 0;
            if tail_len == tail.len() {
                break;
            }
        }
    }

    (ones, tail)
}
