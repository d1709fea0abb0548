//! Sealed frames
//!
//! The fixed-size encrypted envelope both build-request commit records and
//! status records travel in. Layout:
//!
//! ```text
//! mac (32) | nonce (16) | sender pubkey (32) | encrypted body (fixed)
//! ```
//!
//! Two seal modes share the layout:
//! - DH-sealed: a fresh one-time X25519 keypair against the recipient's
//!   long-term encryption key; only the recipient can open it.
//! - Symmetric: the path key is already shared, the pubkey field is random
//!   filler indistinguishable from a real key.
//!
//! Frames of a given role are always the same size no matter which optional
//! record fields are present, so an observer learns nothing about hop
//! position from length. Failure to open a frame yields no reply anywhere
//! in the protocol.

use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{self, SharedKey, TunnelNonce, NONCE_SIZE};
use crate::error::{Result, VeilError};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// mac + nonce + pubkey
pub const FRAME_OVERHEAD: usize = 32 + NONCE_SIZE + 32;

/// Body size of a commit-record frame
pub const COMMIT_BODY_SIZE: usize = 320;

/// Total size of a commit-record frame
pub const COMMIT_FRAME_SIZE: usize = FRAME_OVERHEAD + COMMIT_BODY_SIZE;

/// Body size of a status-record frame
pub const STATUS_BODY_SIZE: usize = 48;

/// Total size of a status-record frame
pub const STATUS_FRAME_SIZE: usize = FRAME_OVERHEAD + STATUS_BODY_SIZE;

const MAC_OFF: usize = 0;
const NONCE_OFF: usize = 32;
const PUBKEY_OFF: usize = 32 + NONCE_SIZE;
const BODY_OFF: usize = FRAME_OVERHEAD;

/// One fixed-size encrypted frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    buf: Vec<u8>,
}

impl SealedFrame {
    /// A frame of pure random bytes, indistinguishable from a sealed one
    pub fn random(size: usize) -> Self {
        debug_assert!(size > FRAME_OVERHEAD);
        let mut buf = vec![0u8; size];
        crypto::randombytes(&mut buf);
        Self { buf }
    }

    /// Seal `body` for `recipient` with a fresh one-time keypair.
    ///
    /// `body.len()` must equal `size - FRAME_OVERHEAD`; records are padded
    /// to that length before sealing.
    pub fn seal_dh(body: &[u8], recipient: &PublicKey, size: usize) -> Result<Self> {
        if body.len() != size - FRAME_OVERHEAD {
            return Err(VeilError::Internal(format!(
                "frame body {} != {}",
                body.len(),
                size - FRAME_OVERHEAD
            )));
        }
        let (eph_secret, eph_public) = crypto::keygen();
        let nonce = TunnelNonce::random();
        let shared = crypto::dh_client(&eph_secret, recipient, &nonce)?;
        Self::assemble(&shared, &nonce, eph_public.as_bytes(), body, size)
    }

    /// Open a DH-sealed frame with our long-term encryption secret.
    pub fn open_dh(&self, our_secret: &StaticSecret) -> Result<Vec<u8>> {
        let (nonce, sender) = self.header()?;
        let sender_pub = PublicKey::from(sender);
        let shared = crypto::dh_server(our_secret, &sender_pub, &nonce)?;
        self.open_with(&shared, &nonce)
    }

    /// Seal `body` under an already-shared path key. The pubkey field is
    /// random filler.
    pub fn seal_symmetric(body: &[u8], key: &SharedKey, size: usize) -> Result<Self> {
        if body.len() != size - FRAME_OVERHEAD {
            return Err(VeilError::Internal(format!(
                "frame body {} != {}",
                body.len(),
                size - FRAME_OVERHEAD
            )));
        }
        let nonce = TunnelNonce::random();
        let mut filler = [0u8; 32];
        crypto::randombytes(&mut filler);
        Self::assemble(key, &nonce, &filler, body, size)
    }

    /// Open a symmetrically sealed frame.
    pub fn open_symmetric(&self, key: &SharedKey) -> Result<Vec<u8>> {
        let (nonce, _) = self.header()?;
        self.open_with(key, &nonce)
    }

    fn assemble(
        key: &SharedKey,
        nonce: &TunnelNonce,
        pubkey: &[u8; 32],
        body: &[u8],
        size: usize,
    ) -> Result<Self> {
        let body_key = crypto::frame_body_key(key)?;
        let mut buf = vec![0u8; size];
        buf[NONCE_OFF..NONCE_OFF + NONCE_SIZE].copy_from_slice(nonce.as_bytes());
        buf[PUBKEY_OFF..PUBKEY_OFF + 32].copy_from_slice(pubkey);
        buf[BODY_OFF..].copy_from_slice(body);
        crypto::apply_stream(&mut buf[BODY_OFF..], &body_key, nonce);

        let mac = Self::mac(key, &buf[NONCE_OFF..]);
        buf[MAC_OFF..MAC_OFF + 32].copy_from_slice(&mac);
        Ok(Self { buf })
    }

    fn open_with(&self, key: &SharedKey, nonce: &TunnelNonce) -> Result<Vec<u8>> {
        let expected = Self::mac(key, &self.buf[NONCE_OFF..]);
        let ok: bool = expected.ct_eq(&self.buf[MAC_OFF..MAC_OFF + 32]).into();
        if !ok {
            return Err(VeilError::FrameAuth);
        }
        let body_key = crypto::frame_body_key(key)?;
        let mut body = self.buf[BODY_OFF..].to_vec();
        crypto::apply_stream(&mut body, &body_key, nonce);
        Ok(body)
    }

    /// mac over everything after the mac field
    fn mac(key: &SharedKey, data: &[u8]) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts 32-byte keys");
        mac.update(data);
        let out = mac.finalize().into_bytes();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&out);
        bytes
    }

    fn header(&self) -> Result<(TunnelNonce, [u8; 32])> {
        if self.buf.len() <= FRAME_OVERHEAD {
            return Err(VeilError::DecodeFailure("frame too short".into()));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&self.buf[NONCE_OFF..NONCE_OFF + NONCE_SIZE]);
        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&self.buf[PUBKEY_OFF..PUBKEY_OFF + 32]);
        Ok((TunnelNonce(nonce), pubkey))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Parse a frame of the expected size from a buffer
    pub fn from_bytes(data: &[u8], size: usize) -> Result<Self> {
        if data.len() < size {
            return Err(VeilError::DecodeFailure("frame truncated".into()));
        }
        Ok(Self {
            buf: data[..size].to_vec(),
        })
    }
}
