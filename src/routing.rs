//! Routing messages
//!
//! The end-to-end control traffic carried over established paths: opaque
//! DHT relays, exit-session management, latency probes, hidden-service
//! frames and bulk traffic transfer. The set is closed (a tagged enum with
//! one dispatch arm per kind), so adding a kind is a compile-visible event
//! everywhere a handler matches.
//!
//! Before encryption a serialized message is padded with random bytes to a
//! multiple of [`PAD_SIZE`](crate::PAD_SIZE); the leading length field says
//! where the message ends.

use crate::contact::{PathId, PATH_ID_SIZE};
use crate::error::{Result, VeilError};
use crate::{crypto, PAD_SIZE};

const TAG_DHT: u8 = 0x01;
const TAG_EXIT_OPEN: u8 = 0x02;
const TAG_EXIT_UPDATE: u8 = 0x03;
const TAG_EXIT_CLOSE: u8 = 0x04;
const TAG_EXIT_GRANT: u8 = 0x05;
const TAG_EXIT_REJECT: u8 = 0x06;
const TAG_DISCARD: u8 = 0x07;
const TAG_LATENCY: u8 = 0x08;
const TAG_HIDDEN_SERVICE: u8 = 0x09;
const TAG_TRANSFER: u8 = 0x0a;

/// One end-to-end routing message, tagged with the sender's per-path
/// sequence number so replies can be correlated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMessage {
    /// Opaque DHT request/response relayed on behalf of the path owner
    DhtRelay { seq_no: u64, body: Vec<u8> },
    /// Ask the endpoint to open an exit session
    ExitOpen {
        seq_no: u64,
        flags: u64,
        token: Vec<u8>,
    },
    /// Refresh/update an exit session
    ExitUpdate { seq_no: u64, session_id: u64 },
    /// Close an exit session
    ExitClose { seq_no: u64, session_id: u64 },
    /// Endpoint granted the exit session
    ExitGrant { seq_no: u64, session_id: u64 },
    /// Endpoint rejected the exit session, with a suggested backoff
    ExitReject {
        seq_no: u64,
        session_id: u64,
        backoff_ms: u64,
    },
    /// Notification that traffic for a path was dropped
    DataDiscard { seq_no: u64, dropped: PathId },
    /// Round-trip latency probe; the endpoint echoes it unchanged
    LatencyProbe { seq_no: u64, sent_at: u64 },
    /// Opaque hidden-service protocol frame
    HiddenServiceFrame { seq_no: u64, frame: Vec<u8> },
    /// Bulk traffic handed to the endpoint for delivery
    TrafficTransfer {
        seq_no: u64,
        protocol: u8,
        data: Vec<u8>,
    },
}

impl RoutingMessage {
    pub fn seq_no(&self) -> u64 {
        match self {
            RoutingMessage::DhtRelay { seq_no, .. }
            | RoutingMessage::ExitOpen { seq_no, .. }
            | RoutingMessage::ExitUpdate { seq_no, .. }
            | RoutingMessage::ExitClose { seq_no, .. }
            | RoutingMessage::ExitGrant { seq_no, .. }
            | RoutingMessage::ExitReject { seq_no, .. }
            | RoutingMessage::DataDiscard { seq_no, .. }
            | RoutingMessage::LatencyProbe { seq_no, .. }
            | RoutingMessage::HiddenServiceFrame { seq_no, .. }
            | RoutingMessage::TrafficTransfer { seq_no, .. } => *seq_no,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            RoutingMessage::DhtRelay { .. } => TAG_DHT,
            RoutingMessage::ExitOpen { .. } => TAG_EXIT_OPEN,
            RoutingMessage::ExitUpdate { .. } => TAG_EXIT_UPDATE,
            RoutingMessage::ExitClose { .. } => TAG_EXIT_CLOSE,
            RoutingMessage::ExitGrant { .. } => TAG_EXIT_GRANT,
            RoutingMessage::ExitReject { .. } => TAG_EXIT_REJECT,
            RoutingMessage::DataDiscard { .. } => TAG_DISCARD,
            RoutingMessage::LatencyProbe { .. } => TAG_LATENCY,
            RoutingMessage::HiddenServiceFrame { .. } => TAG_HIDDEN_SERVICE,
            RoutingMessage::TrafficTransfer { .. } => TAG_TRANSFER,
        }
    }

    /// Serialize without padding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.tag());
        out.extend_from_slice(&self.seq_no().to_be_bytes());
        match self {
            RoutingMessage::DhtRelay { body, .. } => put_blob(&mut out, body),
            RoutingMessage::ExitOpen { flags, token, .. } => {
                out.extend_from_slice(&flags.to_be_bytes());
                put_blob(&mut out, token);
            }
            RoutingMessage::ExitUpdate { session_id, .. }
            | RoutingMessage::ExitClose { session_id, .. }
            | RoutingMessage::ExitGrant { session_id, .. } => {
                out.extend_from_slice(&session_id.to_be_bytes());
            }
            RoutingMessage::ExitReject {
                session_id,
                backoff_ms,
                ..
            } => {
                out.extend_from_slice(&session_id.to_be_bytes());
                out.extend_from_slice(&backoff_ms.to_be_bytes());
            }
            RoutingMessage::DataDiscard { dropped, .. } => {
                out.extend_from_slice(dropped.as_bytes());
            }
            RoutingMessage::LatencyProbe { sent_at, .. } => {
                out.extend_from_slice(&sent_at.to_be_bytes());
            }
            RoutingMessage::HiddenServiceFrame { frame, .. } => put_blob(&mut out, frame),
            RoutingMessage::TrafficTransfer { protocol, data, .. } => {
                out.push(*protocol);
                put_blob(&mut out, data);
            }
        }
        out
    }

    /// Parse a message serialized by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader { data, at: 0 };
        let tag = r.u8()?;
        let seq_no = r.u64()?;
        let msg = match tag {
            TAG_DHT => RoutingMessage::DhtRelay {
                seq_no,
                body: r.blob()?,
            },
            TAG_EXIT_OPEN => RoutingMessage::ExitOpen {
                seq_no,
                flags: r.u64()?,
                token: r.blob()?,
            },
            TAG_EXIT_UPDATE => RoutingMessage::ExitUpdate {
                seq_no,
                session_id: r.u64()?,
            },
            TAG_EXIT_CLOSE => RoutingMessage::ExitClose {
                seq_no,
                session_id: r.u64()?,
            },
            TAG_EXIT_GRANT => RoutingMessage::ExitGrant {
                seq_no,
                session_id: r.u64()?,
            },
            TAG_EXIT_REJECT => RoutingMessage::ExitReject {
                seq_no,
                session_id: r.u64()?,
                backoff_ms: r.u64()?,
            },
            TAG_DISCARD => RoutingMessage::DataDiscard {
                seq_no,
                dropped: PathId(r.array::<PATH_ID_SIZE>()?),
            },
            TAG_LATENCY => RoutingMessage::LatencyProbe {
                seq_no,
                sent_at: r.u64()?,
            },
            TAG_HIDDEN_SERVICE => RoutingMessage::HiddenServiceFrame {
                seq_no,
                frame: r.blob()?,
            },
            TAG_TRANSFER => RoutingMessage::TrafficTransfer {
                seq_no,
                protocol: r.u8()?,
                data: r.blob()?,
            },
            other => {
                return Err(VeilError::DecodeFailure(format!(
                    "unknown routing message tag {other:#04x}"
                )))
            }
        };
        Ok(msg)
    }

    /// Serialize with a length prefix and random padding to a multiple of
    /// [`PAD_SIZE`](crate::PAD_SIZE), the form that gets onion-encrypted
    pub fn to_padded_bytes(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let inner = 4 + body.len();
        let padded = inner.div_ceil(PAD_SIZE) * PAD_SIZE;
        let mut out = vec![0u8; padded];
        out[..4].copy_from_slice(&(body.len() as u32).to_be_bytes());
        out[4..inner].copy_from_slice(&body);
        crypto::randombytes(&mut out[inner..]);
        out
    }

    /// Parse the padded form
    pub fn from_padded_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || data.len() % PAD_SIZE != 0 {
            return Err(VeilError::DecodeFailure("bad padded message size".into()));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if 4 + len > data.len() {
            return Err(VeilError::DecodeFailure("padded length out of range".into()));
        }
        Self::from_bytes(&data[4..4 + len])
    }
}

fn put_blob(out: &mut Vec<u8>, blob: &[u8]) {
    debug_assert!(blob.len() <= u16::MAX as usize);
    out.extend_from_slice(&(blob.len() as u16).to_be_bytes());
    out.extend_from_slice(blob);
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.at + n > self.data.len() {
            return Err(VeilError::DecodeFailure("routing message truncated".into()));
        }
        let slice = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut b = [0u8; N];
        b.copy_from_slice(self.take(N)?);
        Ok(b)
    }

    fn blob(&mut self) -> Result<Vec<u8>> {
        let mut l = [0u8; 2];
        l.copy_from_slice(self.take(2)?);
        Ok(self.take(u16::from_be_bytes(l) as usize)?.to_vec())
    }
}

/// Dispatch target for routing messages arriving at a path endpoint.
///
/// One method per message kind; implementations override what they serve
/// and leave the rest on the defaults, which drop the message with a debug
/// log line. `reply` sends a message back down the path the request came
/// in on.
pub trait RoutingHandler: Send + Sync {
    fn on_dht(&self, from: PathId, seq_no: u64, body: &[u8], reply: &mut dyn FnMut(RoutingMessage)) {
        let _ = (seq_no, body, reply);
        log::debug!("dropping dht relay from path {from}");
    }

    fn on_exit_open(
        &self,
        from: PathId,
        seq_no: u64,
        flags: u64,
        token: &[u8],
        reply: &mut dyn FnMut(RoutingMessage),
    ) {
        let _ = (seq_no, flags, token, reply);
        log::debug!("dropping exit open from path {from}");
    }

    fn on_exit_update(
        &self,
        from: PathId,
        seq_no: u64,
        session_id: u64,
        reply: &mut dyn FnMut(RoutingMessage),
    ) {
        let _ = (seq_no, session_id, reply);
        log::debug!("dropping exit update from path {from}");
    }

    fn on_exit_close(
        &self,
        from: PathId,
        seq_no: u64,
        session_id: u64,
        reply: &mut dyn FnMut(RoutingMessage),
    ) {
        let _ = (seq_no, session_id, reply);
        log::debug!("dropping exit close from path {from}");
    }

    fn on_data_discard(&self, from: PathId, seq_no: u64, dropped: PathId) {
        let _ = (seq_no, dropped);
        log::debug!("dropping data discard from path {from}");
    }

    fn on_hidden_service_frame(
        &self,
        from: PathId,
        seq_no: u64,
        frame: &[u8],
        reply: &mut dyn FnMut(RoutingMessage),
    ) {
        let _ = (seq_no, frame, reply);
        log::debug!("dropping hidden service frame from path {from}");
    }

    fn on_traffic_transfer(&self, from: PathId, seq_no: u64, protocol: u8, data: &[u8]) {
        let _ = (seq_no, protocol, data);
        log::debug!("dropping traffic transfer from path {from}");
    }
}

/// Exhaustively route one inbound message to its handler method.
///
/// Latency probes are answered here: the endpoint echoes them without
/// involving the handler. Exit grant/reject only travel creator-ward and
/// are never dispatched at an endpoint; one arriving here is a peer bug.
pub fn dispatch(
    handler: &dyn RoutingHandler,
    from: PathId,
    msg: RoutingMessage,
    reply: &mut dyn FnMut(RoutingMessage),
) {
    match msg {
        RoutingMessage::DhtRelay { seq_no, body } => handler.on_dht(from, seq_no, &body, reply),
        RoutingMessage::ExitOpen {
            seq_no,
            flags,
            token,
        } => handler.on_exit_open(from, seq_no, flags, &token, reply),
        RoutingMessage::ExitUpdate { seq_no, session_id } => {
            handler.on_exit_update(from, seq_no, session_id, reply)
        }
        RoutingMessage::ExitClose { seq_no, session_id } => {
            handler.on_exit_close(from, seq_no, session_id, reply)
        }
        RoutingMessage::ExitGrant { .. } | RoutingMessage::ExitReject { .. } => {
            log::warn!("exit grant/reject arrived at an endpoint, dropping (path {from})");
        }
        RoutingMessage::DataDiscard { seq_no, dropped } => {
            handler.on_data_discard(from, seq_no, dropped)
        }
        RoutingMessage::LatencyProbe { seq_no, sent_at } => {
            reply(RoutingMessage::LatencyProbe { seq_no, sent_at })
        }
        RoutingMessage::HiddenServiceFrame { seq_no, frame } => {
            handler.on_hidden_service_frame(from, seq_no, &frame, reply)
        }
        RoutingMessage::TrafficTransfer {
            seq_no,
            protocol,
            data,
        } => handler.on_traffic_transfer(from, seq_no, protocol, &data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_roundtrip() {
        let msg = RoutingMessage::ExitOpen {
            seq_no: 42,
            flags: 1,
            token: vec![1, 2, 3],
        };
        let padded = msg.to_padded_bytes();
        assert_eq!(padded.len() % PAD_SIZE, 0);
        assert_eq!(RoutingMessage::from_padded_bytes(&padded).unwrap(), msg);
    }

    #[test]
    fn test_padding_hides_size_of_small_messages() {
        let small = RoutingMessage::LatencyProbe {
            seq_no: 1,
            sent_at: 99,
        };
        let bigger = RoutingMessage::DhtRelay {
            seq_no: 2,
            body: vec![0u8; 64],
        };
        assert_eq!(
            small.to_padded_bytes().len(),
            bigger.to_padded_bytes().len()
        );
    }

    #[test]
    fn test_all_kinds_roundtrip() {
        let msgs = vec![
            RoutingMessage::DhtRelay {
                seq_no: 1,
                body: vec![7; 10],
            },
            RoutingMessage::ExitUpdate {
                seq_no: 2,
                session_id: 9,
            },
            RoutingMessage::ExitReject {
                seq_no: 3,
                session_id: 9,
                backoff_ms: 5_000,
            },
            RoutingMessage::DataDiscard {
                seq_no: 4,
                dropped: PathId::random(),
            },
            RoutingMessage::TrafficTransfer {
                seq_no: 5,
                protocol: 2,
                data: vec![1; 300],
            },
        ];
        for msg in msgs {
            assert_eq!(RoutingMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
        }
    }

    #[test]
    fn test_latency_probe_echoed_by_dispatch() {
        struct Nop;
        impl RoutingHandler for Nop {}

        let mut replies = Vec::new();
        dispatch(
            &Nop,
            PathId::random(),
            RoutingMessage::LatencyProbe {
                seq_no: 7,
                sent_at: 123,
            },
            &mut |m| replies.push(m),
        );
        assert_eq!(
            replies,
            vec![RoutingMessage::LatencyProbe {
                seq_no: 7,
                sent_at: 123
            }]
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = RoutingMessage::LatencyProbe {
            seq_no: 1,
            sent_at: 2,
        }
        .to_bytes();
        bytes[0] = 0x7f;
        assert!(RoutingMessage::from_bytes(&bytes).is_err());
    }
}
