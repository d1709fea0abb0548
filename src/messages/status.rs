//! Status records and messages
//!
//! The reply to a build request. As the confirmation (or failure) travels
//! back toward the path's creator, every hop shifts the frame set up one
//! slot and seals its own outcome record into slot 0 under its path key, so
//! the creator reads hop i's record from frame i. The frame count is pinned
//! at [`MAX_HOPS`] just like the build request.

use serde::{Deserialize, Serialize};

use crate::contact::{PathId, PATH_ID_SIZE};
use crate::crypto::SharedKey;
use crate::error::{Result, VeilError};
use crate::frame::{SealedFrame, STATUS_BODY_SIZE, STATUS_FRAME_SIZE};
use crate::{crypto, MAX_HOPS};

/// Per-hop build outcome, carried as bit flags so a record can combine
/// an outcome with qualifiers if the protocol ever needs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u64)]
pub enum StatusCode {
    /// Hop admitted and wired up
    Success = 1 << 0,
    /// No reply from further up the path within budget
    Timeout = 1 << 1,
    /// Hop is over its per-source build allowance
    Congestion = 1 << 2,
    /// Link to the next hop could not be brought up
    CannotConnect = 1 << 3,
    /// Forwarding to the requested next hop is not permitted
    DestinationInvalid = 1 << 4,
    /// Next hop is not known to the forwarding router
    DestinationUnknown = 1 << 5,
    /// The (tx, rx) pair is already in use on this router
    DuplicateHop = 1 << 6,
}

impl StatusCode {
    pub fn bit(self) -> u64 {
        self as u64
    }

    /// True when `status` carries this code
    pub fn present_in(self, status: u64) -> bool {
        status & self.bit() != 0
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Success => "success",
            StatusCode::Timeout => "timeout",
            StatusCode::Congestion => "congestion",
            StatusCode::CannotConnect => "cannot connect",
            StatusCode::DestinationInvalid => "destination invalid",
            StatusCode::DestinationUnknown => "destination unknown",
            StatusCode::DuplicateHop => "duplicate hop",
        };
        f.write_str(name)
    }
}

/// Render a status bitmask for log lines
pub fn status_to_string(status: u64) -> String {
    const ALL: [StatusCode; 7] = [
        StatusCode::Success,
        StatusCode::Timeout,
        StatusCode::Congestion,
        StatusCode::CannotConnect,
        StatusCode::DestinationInvalid,
        StatusCode::DestinationUnknown,
        StatusCode::DuplicateHop,
    ];
    let names: Vec<String> = ALL
        .iter()
        .filter(|c| c.present_in(status))
        .map(|c| c.to_string())
        .collect();
    format!("[{}]", names.join(", "))
}

/// One hop's sealed outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub status: u64,
}

impl StatusRecord {
    pub fn encode(&self) -> [u8; STATUS_BODY_SIZE] {
        let mut out = [0u8; STATUS_BODY_SIZE];
        crypto::randombytes(&mut out);
        out[..8].copy_from_slice(&self.status.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(VeilError::DecodeFailure("status record too short".into()));
        }
        let mut s = [0u8; 8];
        s.copy_from_slice(&data[..8]);
        Ok(Self {
            status: u64::from_be_bytes(s),
        })
    }

    pub fn success(&self) -> bool {
        StatusCode::Success.present_in(self.status)
    }
}

/// The status reply message addressed to one path id
#[derive(Debug, Clone)]
pub struct StatusMessage {
    /// The path id the next receiver knows this hop by
    pub path_id: PathId,
    /// Aggregate status, visible to every hop on the way down
    pub status: u64,
    pub frames: Vec<SealedFrame>,
}

impl StatusMessage {
    /// Start a fresh status reply: all-random frames, then the originating
    /// hop's own record folded in.
    pub fn create(path_id: PathId, path_key: &SharedKey, status: u64) -> Result<Self> {
        let frames = (0..MAX_HOPS)
            .map(|_| SealedFrame::random(STATUS_FRAME_SIZE))
            .collect();
        let mut msg = Self {
            path_id,
            status,
            frames,
        };
        msg.add_frame(path_key, status)?;
        Ok(msg)
    }

    /// Shift all frames up one slot and seal our own record into slot 0.
    /// The frame that falls off the end was a dummy (or past the creator's
    /// hop count); the fixed count is preserved.
    pub fn add_frame(&mut self, path_key: &SharedKey, status: u64) -> Result<()> {
        self.frames.pop();
        let record = StatusRecord { status };
        let frame = SealedFrame::seal_symmetric(&record.encode(), path_key, STATUS_FRAME_SIZE)?;
        self.frames.insert(0, frame);
        debug_assert_eq!(self.frames.len(), MAX_HOPS);
        Ok(())
    }

    /// Open hop records with the creator's per-hop shared keys: record i
    /// comes from hop i. A failure partway up the path leaves later slots
    /// holding noise, so each record is optional; `None` means that hop
    /// never contributed one.
    pub fn read_records(&self, hop_keys: &[SharedKey]) -> Vec<Option<StatusRecord>> {
        hop_keys
            .iter()
            .zip(&self.frames)
            .map(|(key, frame)| {
                frame
                    .open_symmetric(key)
                    .ok()
                    .and_then(|body| StatusRecord::decode(&body).ok())
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PATH_ID_SIZE + 8 + MAX_HOPS * STATUS_FRAME_SIZE);
        out.extend_from_slice(self.path_id.as_bytes());
        out.extend_from_slice(&self.status.to_be_bytes());
        for frame in &self.frames {
            out.extend_from_slice(frame.as_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let expected = PATH_ID_SIZE + 8 + MAX_HOPS * STATUS_FRAME_SIZE;
        if data.len() != expected {
            return Err(VeilError::DecodeFailure(format!(
                "status message wrong size: {}",
                data.len()
            )));
        }
        let mut id = [0u8; PATH_ID_SIZE];
        id.copy_from_slice(&data[..PATH_ID_SIZE]);
        let mut status = [0u8; 8];
        status.copy_from_slice(&data[PATH_ID_SIZE..PATH_ID_SIZE + 8]);
        let frames_at = PATH_ID_SIZE + 8;
        let frames = (0..MAX_HOPS)
            .map(|i| {
                SealedFrame::from_bytes(&data[frames_at + i * STATUS_FRAME_SIZE..], STATUS_FRAME_SIZE)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            path_id: PathId(id),
            status: u64::from_be_bytes(status),
            frames,
        })
    }
}
