//! Steady-state relay data messages
//!
//! Once a path is established, all traffic rides in these two mirrored
//! message types. The payload is opaque here: each hop only re-keys its
//! own onion layer and swaps the path id for the one the next receiver
//! knows the hop by.

use crate::contact::{PathId, PATH_ID_SIZE};
use crate::crypto::{TunnelNonce, NONCE_SIZE};
use crate::error::{Result, VeilError};

/// Traffic flowing away from the path's creator
#[derive(Debug, Clone)]
pub struct RelayUpstream {
    pub path_id: PathId,
    pub nonce: TunnelNonce,
    pub payload: Vec<u8>,
}

/// Traffic flowing toward the path's creator
#[derive(Debug, Clone)]
pub struct RelayDownstream {
    pub path_id: PathId,
    pub nonce: TunnelNonce,
    pub payload: Vec<u8>,
}

fn encode(path_id: &PathId, nonce: &TunnelNonce, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PATH_ID_SIZE + NONCE_SIZE + payload.len());
    out.extend_from_slice(path_id.as_bytes());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode(data: &[u8]) -> Result<(PathId, TunnelNonce, Vec<u8>)> {
    if data.len() < PATH_ID_SIZE + NONCE_SIZE {
        return Err(VeilError::DecodeFailure("relay message too short".into()));
    }
    let mut id = [0u8; PATH_ID_SIZE];
    id.copy_from_slice(&data[..PATH_ID_SIZE]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&data[PATH_ID_SIZE..PATH_ID_SIZE + NONCE_SIZE]);
    let payload = data[PATH_ID_SIZE + NONCE_SIZE..].to_vec();
    let id = PathId(id);
    if id.is_zero() {
        return Err(VeilError::DecodeFailure("zero path id".into()));
    }
    Ok((id, TunnelNonce(nonce), payload))
}

impl RelayUpstream {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.path_id, &self.nonce, &self.payload)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (path_id, nonce, payload) = decode(data)?;
        Ok(Self {
            path_id,
            nonce,
            payload,
        })
    }
}

impl RelayDownstream {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.path_id, &self.nonce, &self.payload)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (path_id, nonce, payload) = decode(data)?;
        Ok(Self {
            path_id,
            nonce,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msg = RelayUpstream {
            path_id: PathId::random(),
            nonce: TunnelNonce::random(),
            payload: vec![9u8; 128],
        };
        let parsed = RelayUpstream::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.path_id, msg.path_id);
        assert_eq!(parsed.nonce, msg.nonce);
        assert_eq!(parsed.payload, msg.payload);
    }

    #[test]
    fn test_zero_path_id_rejected() {
        let msg = RelayDownstream {
            path_id: PathId([0u8; PATH_ID_SIZE]),
            nonce: TunnelNonce::random(),
            payload: vec![],
        };
        assert!(RelayDownstream::from_bytes(&msg.to_bytes()).is_err());
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(RelayUpstream::from_bytes(&[0u8; 8]).is_err());
    }
}
