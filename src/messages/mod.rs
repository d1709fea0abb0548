//! Link-layer message framing
//!
//! Everything the core puts on (or takes off) a link session is one of the
//! four message types below, encoded as a one-byte type tag followed by the
//! message body. The link layer delivers whole messages; partial delivery
//! and retransmission are its problem, not ours.

pub mod commit;
pub mod relay;
pub mod status;

use crate::error::{Result, VeilError};

pub use commit::{BuildRequest, CommitRecord, WorkProof};
pub use relay::{RelayDownstream, RelayUpstream};
pub use status::{StatusCode, StatusMessage, StatusRecord};

/// Message type tags
const TAG_BUILD: u8 = 0x01;
const TAG_STATUS: u8 = 0x02;
const TAG_RELAY_UP: u8 = 0x03;
const TAG_RELAY_DOWN: u8 = 0x04;

/// A decoded link message
#[derive(Debug, Clone)]
pub enum LinkMessage {
    /// Path build request travelling toward the path's far end
    Build(BuildRequest),
    /// Status reply travelling back toward the path's creator
    Status(StatusMessage),
    /// Data/control traffic flowing away from the path's creator
    RelayUp(RelayUpstream),
    /// Data/control traffic flowing toward the path's creator
    RelayDown(RelayDownstream),
}

impl LinkMessage {
    /// Serialize with the type tag prefix
    pub fn to_bytes(&self) -> Vec<u8> {
        let (tag, body) = match self {
            LinkMessage::Build(m) => (TAG_BUILD, m.to_bytes()),
            LinkMessage::Status(m) => (TAG_STATUS, m.to_bytes()),
            LinkMessage::RelayUp(m) => (TAG_RELAY_UP, m.to_bytes()),
            LinkMessage::RelayDown(m) => (TAG_RELAY_DOWN, m.to_bytes()),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(tag);
        out.extend_from_slice(&body);
        out
    }

    /// Parse a tagged message. Unknown tags and short bodies are decode
    /// failures; the caller drops them without a reply.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| VeilError::DecodeFailure("empty link message".into()))?;
        match tag {
            TAG_BUILD => Ok(LinkMessage::Build(BuildRequest::from_bytes(body)?)),
            TAG_STATUS => Ok(LinkMessage::Status(StatusMessage::from_bytes(body)?)),
            TAG_RELAY_UP => Ok(LinkMessage::RelayUp(RelayUpstream::from_bytes(body)?)),
            TAG_RELAY_DOWN => Ok(LinkMessage::RelayDown(RelayDownstream::from_bytes(body)?)),
            other => Err(VeilError::DecodeFailure(format!(
                "unknown link message tag {other:#04x}"
            ))),
        }
    }
}
