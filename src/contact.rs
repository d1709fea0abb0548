//! Router identifiers and contact records
//!
//! A router contact (RC) is a signed, self-describing record of one
//! router's identity and reachability: its ed25519 identity key, its
//! long-term X25519 encryption key and a network address. Hop candidates
//! are handed to the core as fully-formed contacts; the core never goes
//! looking for them itself.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::error::{Result, VeilError};

/// Size of a router identity key in bytes
pub const ROUTER_ID_SIZE: usize = 32;

/// Size of a path identifier in bytes
pub const PATH_ID_SIZE: usize = 16;

/// Signed portion of an encoded router contact
const RC_PAYLOAD_SIZE: usize = ROUTER_ID_SIZE + 32 + 18 + 8;

/// Full encoded router contact (payload + ed25519 signature)
pub const RC_WIRE_SIZE: usize = RC_PAYLOAD_SIZE + 64;

/// A router's public identity (ed25519 verifying key bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouterId(pub [u8; ROUTER_ID_SIZE]);

impl RouterId {
    pub fn as_bytes(&self) -> &[u8; ROUTER_ID_SIZE] {
        &self.0
    }

    /// Short printable form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl std::fmt::Debug for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterId({})", self.short())
    }
}

impl From<[u8; ROUTER_ID_SIZE]> for RouterId {
    fn from(b: [u8; ROUTER_ID_SIZE]) -> Self {
        Self(b)
    }
}

/// Identifier of one direction of one hop of a path
///
/// Generated randomly by the path's creator; never zero (a zero id is the
/// decode-failure sentinel on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PathId(pub [u8; PATH_ID_SIZE]);

impl PathId {
    /// Fresh random id, retried until nonzero
    pub fn random() -> Self {
        let mut id = [0u8; PATH_ID_SIZE];
        loop {
            OsRng.fill_bytes(&mut id);
            if id.iter().any(|&b| b != 0) {
                return Self(id);
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; PATH_ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Debug for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathId({})", hex::encode(&self.0[..4]))
    }
}

/// A router's signed contact record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterContact {
    /// Identity (signing) key
    pub router_id: RouterId,
    /// Long-term X25519 encryption key, target of hop key exchanges
    pub enc_key: PublicKey,
    /// Reachable address
    pub addr: SocketAddr,
    /// Expiry, unix milliseconds
    pub expires_at: u64,
    /// Signature by `router_id` over the canonical payload encoding
    signature: [u8; 64],
}

impl RouterContact {
    /// Build and sign a contact record
    pub fn new_signed(
        identity: &SigningKey,
        enc_key: PublicKey,
        addr: SocketAddr,
        expires_at: u64,
    ) -> Self {
        let router_id = RouterId(identity.verifying_key().to_bytes());
        let mut rc = Self {
            router_id,
            enc_key,
            addr,
            expires_at,
            signature: [0u8; 64],
        };
        let payload = rc.encode_payload();
        rc.signature = identity.sign(&payload).to_bytes();
        rc
    }

    /// Verify the record's self-signature
    pub fn verify(&self) -> Result<()> {
        let key = VerifyingKey::from_bytes(self.router_id.as_bytes())
            .map_err(|_| VeilError::DecodeFailure("bad identity key in RC".into()))?;
        let sig = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.encode_payload(), &sig)
            .map_err(|_| VeilError::DecodeFailure("RC signature invalid".into()))
    }

    pub fn expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    fn encode_payload(&self) -> [u8; RC_PAYLOAD_SIZE] {
        let mut out = [0u8; RC_PAYLOAD_SIZE];
        let mut at = 0;
        out[at..at + 32].copy_from_slice(self.router_id.as_bytes());
        at += 32;
        out[at..at + 32].copy_from_slice(self.enc_key.as_bytes());
        at += 32;
        // address as a v4-mapped/native v6 16-byte form plus port
        let ip6: Ipv6Addr = match self.addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        out[at..at + 16].copy_from_slice(&ip6.octets());
        at += 16;
        out[at..at + 2].copy_from_slice(&self.addr.port().to_be_bytes());
        at += 2;
        out[at..at + 8].copy_from_slice(&self.expires_at.to_be_bytes());
        out
    }

    /// Serialize to the fixed wire form
    pub fn to_bytes(&self) -> [u8; RC_WIRE_SIZE] {
        let mut out = [0u8; RC_WIRE_SIZE];
        out[..RC_PAYLOAD_SIZE].copy_from_slice(&self.encode_payload());
        out[RC_PAYLOAD_SIZE..].copy_from_slice(&self.signature);
        out
    }

    /// Parse from the fixed wire form; the signature is carried as-is and
    /// checked separately via [`verify`](Self::verify).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RC_WIRE_SIZE {
            return Err(VeilError::DecodeFailure("RC too short".into()));
        }
        let mut at = 0;
        let mut id = [0u8; 32];
        id.copy_from_slice(&data[at..at + 32]);
        at += 32;
        let mut enc = [0u8; 32];
        enc.copy_from_slice(&data[at..at + 32]);
        at += 32;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&data[at..at + 16]);
        at += 16;
        let port = u16::from_be_bytes([data[at], data[at + 1]]);
        at += 2;
        let mut exp = [0u8; 8];
        exp.copy_from_slice(&data[at..at + 8]);
        at += 8;
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&data[at..at + 64]);

        let ip6 = Ipv6Addr::from(ip);
        let ip_addr: IpAddr = match ip6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip6),
        };

        Ok(Self {
            router_id: RouterId(id),
            enc_key: PublicKey::from(enc),
            addr: SocketAddr::new(ip_addr, port),
            expires_at: u64::from_be_bytes(exp),
            signature: sig,
        })
    }
}

/// Generate a fresh identity signing key
pub fn identity_keygen() -> SigningKey {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    SigningKey::from_bytes(&seed)
}
