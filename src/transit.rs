//! Relay-side transit hops
//!
//! One [`TransitHop`] per path this router carries for someone else. A hop
//! is born from a successfully opened commit record, lives under the path
//! context keyed by both its path ids, relays traffic in both directions,
//! and dies on expiry or an explicit self-destruct.
//!
//! A hop where the decoded next-hop identity is this router is the path's
//! far endpoint: upstream traffic terminates here and is dispatched as
//! routing messages instead of being forwarded. A non-endpoint hop never
//! parses payload.

use x25519_dalek::StaticSecret;

use crate::contact::{PathId, RouterId};
use crate::crypto::{self, NonceXor, SharedKey, TunnelNonce};
use crate::error::{Result, VeilError};
use crate::messages::commit::CommitRecord;
use crate::messages::relay::{RelayDownstream, RelayUpstream};
use crate::routing::RoutingMessage;

/// Identity of a transit hop: its two path ids and the routers on
/// either side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitHopInfo {
    /// Path id of traffic continuing away from the path's creator
    pub tx_id: PathId,
    /// Path id of traffic arriving from the creator's side
    pub rx_id: PathId,
    /// Next router away from the creator
    pub upstream: RouterId,
    /// The router this hop's build request arrived from
    pub downstream: RouterId,
}

impl std::fmt::Display for TransitHopInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[tx={} rx={} upstream={} downstream={}]",
            self.tx_id, self.rx_id, self.upstream, self.downstream
        )
    }
}

/// This router's participation in someone else's path
pub struct TransitHop {
    pub info: TransitHopInfo,
    pub path_key: SharedKey,
    pub nonce_xor: NonceXor,
    pub started: u64,
    pub lifetime_ms: u64,
    seq_no: u64,
    destroy: bool,
    last_activity: u64,
}

impl TransitHop {
    /// Derive a hop from an opened commit record.
    ///
    /// Runs the server half of the key exchange against the record's
    /// commitment key; called on a worker thread, as the DH is the
    /// expensive part of admission.
    pub fn from_commit(
        record: &CommitRecord,
        downstream: RouterId,
        our_enc_secret: &StaticSecret,
        now: u64,
    ) -> Result<Self> {
        if record.tx_id.is_zero() || record.rx_id.is_zero() {
            return Err(VeilError::DecodeFailure("zero path id in commit".into()));
        }
        let path_key = crypto::dh_server(our_enc_secret, &record.commit_key, &record.tunnel_nonce)?;
        let nonce_xor = NonceXor::derive(&path_key);
        Ok(Self {
            info: TransitHopInfo {
                tx_id: record.tx_id,
                rx_id: record.rx_id,
                upstream: record.next_hop,
                downstream,
            },
            path_key,
            nonce_xor,
            started: now,
            lifetime_ms: record.effective_lifetime(now),
            seq_no: 0,
            destroy: false,
            last_activity: now,
        })
    }

    /// Endpoint test: the build told us to forward to ourselves, so the
    /// path terminates here
    pub fn is_endpoint(&self, us: &RouterId) -> bool {
        self.info.upstream == *us
    }

    pub fn expire_time(&self) -> u64 {
        self.started + self.lifetime_ms
    }

    /// Once true, stays true: the destroy flag never clears and time only
    /// moves forward
    pub fn expired(&self, now: u64) -> bool {
        self.destroy || now >= self.expire_time()
    }

    pub fn expires_soon(&self, now: u64, margin_ms: u64) -> bool {
        now + margin_ms >= self.expire_time()
    }

    /// Flag the hop for teardown on the next expiry sweep. Only ever
    /// called from the logic thread.
    pub fn set_destroy(&mut self) {
        self.destroy = true;
    }

    pub fn mark_active(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub fn next_seq_no(&mut self) -> u64 {
        self.seq_no += 1;
        self.seq_no
    }

    /// One onion pass: re-key `payload` with this hop's path key and the
    /// received nonce, returning the mixed nonce to forward with
    pub fn onion(&self, payload: &mut [u8], nonce: &TunnelNonce) -> TunnelNonce {
        crypto::onion_step(payload, &self.path_key, nonce, &self.nonce_xor)
    }

    /// Transform creator-bound traffic for the next hop up
    pub fn relay_upstream(&self, mut payload: Vec<u8>, nonce: &TunnelNonce) -> RelayUpstream {
        let next = self.onion(&mut payload, nonce);
        RelayUpstream {
            path_id: self.info.tx_id,
            nonce: next,
            payload,
        }
    }

    /// Transform creator-ward traffic for the next hop down
    pub fn relay_downstream(&self, mut payload: Vec<u8>, nonce: &TunnelNonce) -> RelayDownstream {
        let next = self.onion(&mut payload, nonce);
        RelayDownstream {
            path_id: self.info.rx_id,
            nonce: next,
            payload,
        }
    }

    /// Decrypt upstream payload at the endpoint and parse it as a routing
    /// message. Only valid on a hop where `is_endpoint` holds.
    pub fn open_routing_message(
        &self,
        mut payload: Vec<u8>,
        nonce: &TunnelNonce,
    ) -> Result<RoutingMessage> {
        self.onion(&mut payload, nonce);
        RoutingMessage::from_padded_bytes(&payload)
    }

    /// Originate a reply at the endpoint: pad, add our single layer, and
    /// address it to our downstream segment. Closer hops each add theirs
    /// as it travels; the creator peels them all.
    pub fn make_downstream_reply(&self, msg: &RoutingMessage) -> RelayDownstream {
        let payload = msg.to_padded_bytes();
        self.relay_downstream(payload, &TunnelNonce::random())
    }
}

impl std::fmt::Debug for TransitHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitHop")
            .field("info", &self.info)
            .field("started", &self.started)
            .field("lifetime_ms", &self.lifetime_ms)
            .field("destroy", &self.destroy)
            .finish()
    }
}
