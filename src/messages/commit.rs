//! Build requests and commit records
//!
//! A commit record is one hop's decrypted instructions: its ephemeral
//! commitment key, its two path ids, the tunnel nonce, and who the next hop
//! is. A build request is always exactly [`MAX_HOPS`] sealed commit frames;
//! for shorter paths the trailing frames are random bytes. The count never
//! varies with the real hop count: frame position and frame count must not
//! tell an observer anything about where in a path a router sits.

use x25519_dalek::PublicKey;

use crate::contact::{PathId, RouterContact, RouterId, PATH_ID_SIZE, RC_WIRE_SIZE};
use crate::crypto::{self, TunnelNonce, NONCE_SIZE};
use crate::error::{Result, VeilError};
use crate::frame::{SealedFrame, COMMIT_BODY_SIZE, COMMIT_FRAME_SIZE};
use crate::{DEFAULT_LIFETIME_MS, MAX_HOPS, MIN_LIFETIME_MS};

/// Proof-of-work token attached to a commit record to buy a longer
/// hop lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkProof {
    pub nonce: [u8; 24],
    /// Requested lifetime extension, milliseconds
    pub extended_lifetime_ms: u64,
    /// Token expiry, unix milliseconds
    pub expires_at: u64,
}

/// Encoded size of a work proof
pub const WORK_PROOF_SIZE: usize = 24 + 8 + 8;

impl WorkProof {
    /// A token is honored while unexpired and while asking for no more
    /// than the default lifetime.
    pub fn valid(&self, now: u64) -> bool {
        now < self.expires_at && self.extended_lifetime_ms <= DEFAULT_LIFETIME_MS
    }

    fn encode(&self, out: &mut [u8]) {
        out[..24].copy_from_slice(&self.nonce);
        out[24..32].copy_from_slice(&self.extended_lifetime_ms.to_be_bytes());
        out[32..40].copy_from_slice(&self.expires_at.to_be_bytes());
    }

    fn decode(data: &[u8]) -> Self {
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&data[..24]);
        let mut ext = [0u8; 8];
        ext.copy_from_slice(&data[24..32]);
        let mut exp = [0u8; 8];
        exp.copy_from_slice(&data[32..40]);
        Self {
            nonce,
            extended_lifetime_ms: u64::from_be_bytes(ext),
            expires_at: u64::from_be_bytes(exp),
        }
    }
}

const FLAG_NEXT_RC: u8 = 1 << 0;
const FLAG_WORK: u8 = 1 << 1;
const FLAG_LIFETIME: u8 = 1 << 2;

/// One hop's build instructions, carried encrypted inside a commit frame
#[derive(Debug, Clone)]
pub struct CommitRecord {
    /// The creator's ephemeral commitment public key for this hop
    pub commit_key: PublicKey,
    /// Path id for traffic flowing away from the creator
    pub tx_id: PathId,
    /// Path id for traffic flowing toward the creator
    pub rx_id: PathId,
    /// Nonce binding this hop's key exchange
    pub tunnel_nonce: TunnelNonce,
    /// The hop after this one; equal to the hop's own id at the far end
    pub next_hop: RouterId,
    /// Full contact record for the next hop (absent on the last hop)
    pub next_rc: Option<RouterContact>,
    /// Optional proof-of-work lifetime extension
    pub work: Option<WorkProof>,
    /// Optional short lifetime override, milliseconds
    pub lifetime_override_ms: Option<u64>,
}

impl CommitRecord {
    /// Encode into a fixed-size frame body. Absent optional fields are
    /// filled with random bytes so every record encodes to the same length
    /// and the same byte distribution.
    pub fn encode(&self) -> [u8; COMMIT_BODY_SIZE] {
        let mut out = [0u8; COMMIT_BODY_SIZE];
        crypto::randombytes(&mut out);

        let mut at = 0;
        out[at..at + 32].copy_from_slice(self.commit_key.as_bytes());
        at += 32;
        out[at..at + PATH_ID_SIZE].copy_from_slice(self.tx_id.as_bytes());
        at += PATH_ID_SIZE;
        out[at..at + PATH_ID_SIZE].copy_from_slice(self.rx_id.as_bytes());
        at += PATH_ID_SIZE;
        out[at..at + NONCE_SIZE].copy_from_slice(self.tunnel_nonce.as_bytes());
        at += NONCE_SIZE;
        out[at..at + 32].copy_from_slice(self.next_hop.as_bytes());
        at += 32;

        let mut flags = 0u8;
        if self.next_rc.is_some() {
            flags |= FLAG_NEXT_RC;
        }
        if self.work.is_some() {
            flags |= FLAG_WORK;
        }
        if self.lifetime_override_ms.is_some() {
            flags |= FLAG_LIFETIME;
        }
        out[at] = flags;
        at += 1;

        if let Some(lt) = self.lifetime_override_ms {
            out[at..at + 8].copy_from_slice(&lt.to_be_bytes());
        }
        at += 8;
        if let Some(work) = &self.work {
            work.encode(&mut out[at..at + WORK_PROOF_SIZE]);
        }
        at += WORK_PROOF_SIZE;
        if let Some(rc) = &self.next_rc {
            out[at..at + RC_WIRE_SIZE].copy_from_slice(&rc.to_bytes());
        }
        out
    }

    /// Decode a frame body produced by [`encode`](Self::encode)
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < COMMIT_BODY_SIZE {
            return Err(VeilError::DecodeFailure("commit record too short".into()));
        }
        let mut at = 0;
        let mut commit = [0u8; 32];
        commit.copy_from_slice(&data[at..at + 32]);
        at += 32;
        let mut tx = [0u8; PATH_ID_SIZE];
        tx.copy_from_slice(&data[at..at + PATH_ID_SIZE]);
        at += PATH_ID_SIZE;
        let mut rx = [0u8; PATH_ID_SIZE];
        rx.copy_from_slice(&data[at..at + PATH_ID_SIZE]);
        at += PATH_ID_SIZE;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[at..at + NONCE_SIZE]);
        at += NONCE_SIZE;
        let mut next = [0u8; 32];
        next.copy_from_slice(&data[at..at + 32]);
        at += 32;

        let flags = data[at];
        at += 1;

        let lifetime_override_ms = if flags & FLAG_LIFETIME != 0 {
            let mut lt = [0u8; 8];
            lt.copy_from_slice(&data[at..at + 8]);
            Some(u64::from_be_bytes(lt))
        } else {
            None
        };
        at += 8;

        let work = if flags & FLAG_WORK != 0 {
            Some(WorkProof::decode(&data[at..at + WORK_PROOF_SIZE]))
        } else {
            None
        };
        at += WORK_PROOF_SIZE;

        let next_rc = if flags & FLAG_NEXT_RC != 0 {
            Some(RouterContact::from_bytes(&data[at..at + RC_WIRE_SIZE])?)
        } else {
            None
        };

        Ok(Self {
            commit_key: PublicKey::from(commit),
            tx_id: PathId(tx),
            rx_id: PathId(rx),
            tunnel_nonce: TunnelNonce(nonce),
            next_hop: RouterId(next),
            next_rc,
            work,
            lifetime_override_ms,
        })
    }

    /// The effective hop lifetime this record asks for, clamped per the
    /// protocol rules: an honored work proof may extend up to the default;
    /// a plain override may only shorten, and never below the minimum.
    pub fn effective_lifetime(&self, now: u64) -> u64 {
        if let Some(work) = &self.work {
            if work.valid(now) {
                return work
                    .extended_lifetime_ms
                    .clamp(MIN_LIFETIME_MS, DEFAULT_LIFETIME_MS);
            }
        }
        if let Some(lt) = self.lifetime_override_ms {
            if lt > MIN_LIFETIME_MS && lt < DEFAULT_LIFETIME_MS {
                return lt;
            }
        }
        DEFAULT_LIFETIME_MS
    }
}

/// A path build request: always exactly [`MAX_HOPS`] sealed commit frames
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub frames: Vec<SealedFrame>,
}

impl BuildRequest {
    /// All-random frames; the key exchange pipeline replaces the first
    /// `hop_count` of them with real sealed records.
    pub fn randomized() -> Self {
        let frames = (0..MAX_HOPS)
            .map(|_| SealedFrame::random(COMMIT_FRAME_SIZE))
            .collect();
        Self { frames }
    }

    /// Consume our frame and keep the fixed count: drop frame 0, shift the
    /// rest down one slot, append one fresh random frame at the end.
    pub fn shift_after_consume(&mut self) {
        self.frames.remove(0);
        self.frames.push(SealedFrame::random(COMMIT_FRAME_SIZE));
        debug_assert_eq!(self.frames.len(), MAX_HOPS);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_HOPS * COMMIT_FRAME_SIZE);
        for frame in &self.frames {
            out.extend_from_slice(frame.as_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MAX_HOPS * COMMIT_FRAME_SIZE {
            return Err(VeilError::DecodeFailure(format!(
                "build request wrong size: {}",
                data.len()
            )));
        }
        let frames = (0..MAX_HOPS)
            .map(|i| SealedFrame::from_bytes(&data[i * COMMIT_FRAME_SIZE..], COMMIT_FRAME_SIZE))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { frames })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::identity_keygen;

    fn sample_record(with_rc: bool) -> CommitRecord {
        let (_, commit_pub) = crypto::keygen();
        let next_rc = with_rc.then(|| {
            let identity = identity_keygen();
            let (_, enc) = crypto::keygen();
            RouterContact::new_signed(&identity, enc, "198.51.100.2:7000".parse().unwrap(), 10_000)
        });
        CommitRecord {
            commit_key: commit_pub,
            tx_id: PathId::random(),
            rx_id: PathId::random(),
            tunnel_nonce: TunnelNonce::random(),
            next_hop: RouterId([5u8; 32]),
            next_rc,
            work: None,
            lifetime_override_ms: None,
        }
    }

    #[test]
    fn test_record_roundtrip_with_rc() {
        let record = sample_record(true);
        let decoded = CommitRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.tx_id, record.tx_id);
        assert_eq!(decoded.rx_id, record.rx_id);
        assert_eq!(decoded.next_hop, record.next_hop);
        assert_eq!(decoded.next_rc, record.next_rc);
        decoded.next_rc.unwrap().verify().unwrap();
    }

    #[test]
    fn test_record_roundtrip_without_optionals() {
        let record = sample_record(false);
        let decoded = CommitRecord::decode(&record.encode()).unwrap();
        assert!(decoded.next_rc.is_none());
        assert!(decoded.work.is_none());
        assert!(decoded.lifetime_override_ms.is_none());
    }

    #[test]
    fn test_encoding_size_constant_regardless_of_optionals() {
        // the whole point of the padding: both encodings are body-sized
        assert_eq!(sample_record(true).encode().len(), COMMIT_BODY_SIZE);
        assert_eq!(sample_record(false).encode().len(), COMMIT_BODY_SIZE);
    }

    #[test]
    fn test_effective_lifetime_clamps() {
        let mut record = sample_record(false);
        assert_eq!(record.effective_lifetime(0), DEFAULT_LIFETIME_MS);

        record.lifetime_override_ms = Some(60_000);
        assert_eq!(record.effective_lifetime(0), 60_000);

        // too short an override falls back to the default
        record.lifetime_override_ms = Some(1_000);
        assert_eq!(record.effective_lifetime(0), DEFAULT_LIFETIME_MS);

        // a valid work proof wins and is clamped to the default
        record.work = Some(WorkProof {
            nonce: [0u8; 24],
            extended_lifetime_ms: DEFAULT_LIFETIME_MS * 4,
            expires_at: u64::MAX,
        });
        assert_eq!(record.effective_lifetime(0), DEFAULT_LIFETIME_MS);

        // an expired proof is ignored
        record.work = Some(WorkProof {
            nonce: [0u8; 24],
            extended_lifetime_ms: 120_000,
            expires_at: 5,
        });
        record.lifetime_override_ms = None;
        assert_eq!(record.effective_lifetime(10), DEFAULT_LIFETIME_MS);
    }

    #[test]
    fn test_build_request_always_max_frames() {
        let mut req = BuildRequest::randomized();
        assert_eq!(req.frames.len(), MAX_HOPS);

        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), MAX_HOPS * COMMIT_FRAME_SIZE);

        req.shift_after_consume();
        assert_eq!(req.frames.len(), MAX_HOPS);

        let reparsed = BuildRequest::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed.frames.len(), MAX_HOPS);
    }

    #[test]
    fn test_shift_moves_frames_down() {
        let mut req = BuildRequest::randomized();
        let second = req.frames[1].clone();
        let last = req.frames[MAX_HOPS - 1].clone();
        req.shift_after_consume();
        assert_eq!(req.frames[0], second);
        assert_eq!(req.frames[MAX_HOPS - 2], last);
    }

    #[test]
    fn test_truncated_build_request_rejected() {
        let req = BuildRequest::randomized();
        let bytes = req.to_bytes();
        assert!(BuildRequest::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
