//! Path cryptography
//!
//! Implements the primitives the build protocol is made of:
//! - X25519 Diffie-Hellman, split into a client half and a server half that
//!   arrive at the same shared key (both are bound to the tunnel nonce and
//!   to both public keys via HMAC-SHA256)
//! - Nonce-XOR derivation (hash of the shared key, truncated) used to
//!   decorrelate nonces from hop to hop
//! - The symmetric onion transform (AES-256-CTR keyed by the hop's shared
//!   key, nonce as the counter IV)
//!
//! Security: all derived key material is zeroized on drop.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VeilError};

type HmacSha256 = Hmac<Sha256>;

/// AES-256-CTR cipher for onion layers
type Aes256Ctr = Ctr128BE<Aes256>;

/// Size of a tunnel nonce in bytes (also the CTR IV size)
pub const NONCE_SIZE: usize = 16;

/// Size of a shared key in bytes
pub const SHARED_KEY_SIZE: usize = 32;

/// Symmetric key shared between a path owner and one hop
///
/// SECURITY: zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey(pub [u8; SHARED_KEY_SIZE]);

impl SharedKey {
    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        write!(f, "SharedKey(..)")
    }
}

/// Per-message tunnel nonce, doubles as the CTR IV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelNonce(pub [u8; NONCE_SIZE]);

impl TunnelNonce {
    /// Fresh random nonce
    pub fn random() -> Self {
        let mut n = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut n);
        Self(n)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// XOR with a hop's nonce-mixing value
    pub fn mixed(&self, xor: &NonceXor) -> Self {
        let mut out = [0u8; NONCE_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ xor.0[i];
        }
        Self(out)
    }
}

/// Nonce-mixing value: hash of a hop's shared key, truncated to nonce size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NonceXor(pub [u8; NONCE_SIZE]);

impl NonceXor {
    /// Derive the nonce-mixing value from a shared key
    pub fn derive(key: &SharedKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut out = [0u8; NONCE_SIZE];
        out.copy_from_slice(&digest[..NONCE_SIZE]);
        Self(out)
    }
}

/// Generate a fresh X25519 keypair.
///
/// SECURITY: panics if the RNG hands back a degenerate key; running with a
/// broken RNG is not survivable.
pub fn keygen() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    if public.as_bytes().iter().all(|&b| b == 0) {
        panic!("RNG failure: generated all-zero public key");
    }
    (secret, public)
}

/// Fill a buffer with random bytes
pub fn randombytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Client half of the hop key exchange.
///
/// `local` is the fresh per-build commitment secret, `remote` the hop's
/// long-term encryption public key. The raw DH point is bound to the
/// transcript (both public keys) and the tunnel nonce, so the same point
/// used under a different nonce yields an unrelated key.
pub fn dh_client(
    local: &StaticSecret,
    remote: &PublicKey,
    nonce: &TunnelNonce,
) -> Result<SharedKey> {
    let local_pub = PublicKey::from(local);
    let point = local.diffie_hellman(remote);
    mix_dh(point.as_bytes(), &local_pub, remote, nonce)
}

/// Server half of the hop key exchange.
///
/// `local` is this router's long-term encryption secret, `remote` the
/// client's ephemeral commitment public key. Produces the same key as
/// [`dh_client`] run with the matching halves.
pub fn dh_server(
    local: &StaticSecret,
    remote: &PublicKey,
    nonce: &TunnelNonce,
) -> Result<SharedKey> {
    let local_pub = PublicKey::from(local);
    let point = local.diffie_hellman(remote);
    mix_dh(point.as_bytes(), remote, &local_pub, nonce)
}

/// shared = HMAC-SHA256(nonce, client_pub || server_pub || dh_point)
fn mix_dh(
    point: &[u8; 32],
    client_pub: &PublicKey,
    server_pub: &PublicKey,
    nonce: &TunnelNonce,
) -> Result<SharedKey> {
    // an all-zero point means the peer handed us a low-order key
    if point.iter().all(|&b| b == 0) {
        return Err(VeilError::Crypto("degenerate DH result".into()));
    }
    let mut mac = HmacSha256::new_from_slice(nonce.as_bytes())
        .map_err(|_| VeilError::Crypto("hmac init".into()))?;
    mac.update(client_pub.as_bytes());
    mac.update(server_pub.as_bytes());
    mac.update(point);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; SHARED_KEY_SIZE];
    key.copy_from_slice(&out);
    Ok(SharedKey(key))
}

/// Expand a shared key into the cipher key used for sealed frame bodies.
///
/// The shared key itself keys the frame MAC; the body cipher gets its own
/// expansion so the two uses never share key material. The shared key is
/// already HMAC output, so it is used as the PRK directly.
pub fn frame_body_key(shared: &SharedKey) -> Result<SharedKey> {
    const EXPAND: &[u8] = b"veilnet-frame-body-v1";

    let hkdf = Hkdf::<Sha256>::from_prk(shared.as_bytes())
        .map_err(|_| VeilError::Crypto("invalid PRK length".into()))?;
    let mut okm = [0u8; SHARED_KEY_SIZE];
    hkdf.expand(EXPAND, &mut okm)
        .map_err(|_| VeilError::Crypto("frame key expansion failed".into()))?;
    Ok(SharedKey(okm))
}

/// One onion step: AES-256-CTR over `data` in place, then return the nonce
/// mixed with the hop's nonce-XOR for the next layer.
///
/// CTR is an involution, so the same call both adds and removes a layer.
pub fn onion_step(
    data: &mut [u8],
    key: &SharedKey,
    nonce: &TunnelNonce,
    xor: &NonceXor,
) -> TunnelNonce {
    apply_stream(data, key, nonce);
    nonce.mixed(xor)
}

/// Raw AES-256-CTR pass without the nonce mutation
pub fn apply_stream(data: &mut [u8], key: &SharedKey, nonce: &TunnelNonce) {
    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), nonce.as_bytes().into());
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_halves_agree() {
        let (client_sk, client_pk) = keygen();
        let (server_sk, server_pk) = keygen();
        let nonce = TunnelNonce::random();

        let a = dh_client(&client_sk, &server_pk, &nonce).unwrap();
        let b = dh_server(&server_sk, &client_pk, &nonce).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        // nonce-XOR derives equal on both sides too
        assert_eq!(NonceXor::derive(&a), NonceXor::derive(&b));
    }

    #[test]
    fn test_dh_nonce_separates_keys() {
        let (client_sk, _) = keygen();
        let (_, server_pk) = keygen();

        let a = dh_client(&client_sk, &server_pk, &TunnelNonce::random()).unwrap();
        let b = dh_client(&client_sk, &server_pk, &TunnelNonce::random()).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_onion_step_is_involution() {
        let key = SharedKey([7u8; 32]);
        let xor = NonceXor::derive(&key);
        let nonce = TunnelNonce::random();

        let mut data = b"relay payload bytes".to_vec();
        let original = data.clone();

        let mixed = onion_step(&mut data, &key, &nonce, &xor);
        assert_ne!(data, original);
        assert_eq!(mixed, nonce.mixed(&xor));

        onion_step(&mut data, &key, &nonce, &xor);
        assert_eq!(data, original);
    }

    #[test]
    fn test_frame_body_key_differs_from_shared() {
        let shared = SharedKey([4u8; 32]);
        let body_key = frame_body_key(&shared).unwrap();
        assert_ne!(body_key.as_bytes(), shared.as_bytes());
        // deterministic
        assert_eq!(
            frame_body_key(&shared).unwrap().as_bytes(),
            body_key.as_bytes()
        );
    }

    #[test]
    fn test_nonce_mix_roundtrip() {
        let nonce = TunnelNonce::random();
        let xor = NonceXor([0x5au8; NONCE_SIZE]);
        assert_eq!(nonce.mixed(&xor).mixed(&xor), nonce);
    }
}
