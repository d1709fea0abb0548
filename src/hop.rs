//! Client-side per-hop state
//!
//! One [`HopConfig`] per hop of a path the local router owns. Created with
//! fresh path ids when the build starts, key material filled in by the key
//! exchange pipeline, and treated as immutable once the build request is
//! on the wire.

use x25519_dalek::StaticSecret;

use crate::contact::{PathId, RouterContact, RouterId};
use crate::crypto::{NonceXor, SharedKey, TunnelNonce};
use crate::error::{Result, VeilError};
use crate::DEFAULT_LIFETIME_MS;

/// One hop of an owned path
pub struct HopConfig {
    /// The hop's contact record
    pub rc: RouterContact,
    /// Ephemeral commitment secret for this build; dropped with the path
    pub commit_secret: Option<StaticSecret>,
    /// Nonce binding this hop's key exchange
    pub tunnel_nonce: TunnelNonce,
    /// Derived shared key, present once the pipeline has run this hop
    pub shared: Option<SharedKey>,
    /// Nonce-mixing value derived from `shared`
    pub nonce_xor: NonceXor,
    /// Path id for traffic flowing away from us at this hop
    pub tx_id: PathId,
    /// Path id for traffic flowing toward us at this hop
    pub rx_id: PathId,
    /// The next router after this hop; the hop's own id at the far end
    pub upstream: RouterId,
    /// Hop lifetime, milliseconds
    pub lifetime_ms: u64,
}

impl HopConfig {
    /// Fresh hop state with random ids and no key material yet
    pub fn new(rc: RouterContact) -> Self {
        let upstream = rc.router_id;
        Self {
            rc,
            commit_secret: None,
            tunnel_nonce: TunnelNonce::random(),
            shared: None,
            nonce_xor: NonceXor::default(),
            tx_id: PathId::random(),
            rx_id: PathId::random(),
            upstream,
            lifetime_ms: DEFAULT_LIFETIME_MS,
        }
    }

    /// The hop's router identity
    pub fn router_id(&self) -> RouterId {
        self.rc.router_id
    }

    /// The shared key, or an error if the key exchange has not run yet
    pub fn shared_key(&self) -> Result<&SharedKey> {
        self.shared
            .as_ref()
            .ok_or_else(|| VeilError::InvalidState("hop key exchange incomplete".into()))
    }
}

impl std::fmt::Debug for HopConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopConfig")
            .field("router", &self.rc.router_id)
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .field("upstream", &self.upstream)
            .field("keyed", &self.shared.is_some())
            .finish()
    }
}
