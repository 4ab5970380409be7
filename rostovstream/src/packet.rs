//! Wire codec for the six packet kinds.
//!
//! Binary layout after the link layer's magic token (all integers
//! big-endian):
//!
//! ```text
//! packet := type(1) payload
//!   CONNECT : no payload
//!   CONNACK : no payload
//!   INFO    : length(2) seq(4) body(length)
//!   ACK     : seq(4)
//!   FIN     : no payload
//!   FINACK  : no payload
//! ```
//!
//! The type byte is the ASCII digit `'0'..='5'`, one per kind in
//! declaration order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rostovlink::MuxStream;

use crate::error::{RdtError, Result};

const TYPE_CONNECT: u8 = b'0';
const TYPE_CONNACK: u8 = b'1';
const TYPE_INFO: u8 = b'2';
const TYPE_ACK: u8 = b'3';
const TYPE_FIN: u8 = b'4';
const TYPE_FINACK: u8 = b'5';

/// Width of the sequence-number field; defines the 2^32 sequence space.
pub const SEQ_BYTES: usize = 4;
/// Width of the INFO body-length field.
pub const LEN_BYTES: usize = 2;
/// Largest INFO body: 65527 (max UDP payload) minus the 6-byte magic
/// token, 1-byte type and 6-byte INFO header.
pub const MAX_BODY: usize = 65_514;

/// One reliable-transport packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect,
    Connack,
    Info { seq: u32, body: Bytes },
    Ack { seq: u32 },
    Fin,
    Finack,
}

impl Packet {
    /// Human-readable kind tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Connect => "CONNECT",
            Packet::Connack => "CONNACK",
            Packet::Info { .. } => "INFO",
            Packet::Ack { .. } => "ACK",
            Packet::Fin => "FIN",
            Packet::Finack => "FINACK",
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Packet::Connect => TYPE_CONNECT,
            Packet::Connack => TYPE_CONNACK,
            Packet::Info { .. } => TYPE_INFO,
            Packet::Ack { .. } => TYPE_ACK,
            Packet::Fin => TYPE_FIN,
            Packet::Finack => TYPE_FINACK,
        }
    }

    /// The total number of bytes this packet occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Packet::Info { body, .. } => LEN_BYTES + SEQ_BYTES + body.len(),
            Packet::Ack { .. } => SEQ_BYTES,
            _ => 0,
        }
    }

    /// Encode this packet into a byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.type_byte());
        match self {
            Packet::Info { seq, body } => {
                debug_assert!(body.len() <= MAX_BODY);
                buf.put_u16(body.len() as u16);
                buf.put_u32(*seq);
                buf.put_slice(body);
            }
            Packet::Ack { seq } => {
                buf.put_u32(*seq);
            }
            _ => {}
        }
        buf.freeze()
    }

    /// Decode one packet from a byte slice.
    pub fn decode(data: &[u8]) -> Result<Packet> {
        let (&ty, rest) = data
            .split_first()
            .ok_or_else(|| RdtError::Protocol("empty packet".into()))?;
        match ty {
            TYPE_CONNECT => Ok(Packet::Connect),
            TYPE_CONNACK => Ok(Packet::Connack),
            TYPE_INFO => {
                Self::ensure_len(rest, LEN_BYTES + SEQ_BYTES, "INFO header")?;
                let mut header = rest;
                let len = header.get_u16() as usize;
                let seq = header.get_u32();
                let body = &rest[LEN_BYTES + SEQ_BYTES..];
                Self::ensure_len(body, len, "INFO body")?;
                Ok(Packet::Info {
                    seq,
                    body: Bytes::copy_from_slice(&body[..len]),
                })
            }
            TYPE_ACK => {
                Self::ensure_len(rest, SEQ_BYTES, "ACK")?;
                let mut rest = rest;
                Ok(Packet::Ack {
                    seq: rest.get_u32(),
                })
            }
            TYPE_FIN => Ok(Packet::Fin),
            TYPE_FINACK => Ok(Packet::Finack),
            other => Err(RdtError::UnknownPacketType(other)),
        }
    }

    /// Read one packet from a mux stream.
    ///
    /// Blocks according to the stream's timeout and blocking mode for the
    /// type byte; the remaining fields arrived in the same datagram, so
    /// they are already buffered and never block.
    pub fn read_from(stream: &MuxStream) -> Result<Packet> {
        let ty = stream.recv_exact(1)?;
        match ty[0] {
            TYPE_CONNECT => Ok(Packet::Connect),
            TYPE_CONNACK => Ok(Packet::Connack),
            TYPE_INFO => {
                let header = stream.recv_exact(LEN_BYTES + SEQ_BYTES)?;
                let mut header = &header[..];
                let len = header.get_u16() as usize;
                let seq = header.get_u32();
                let body = if len == 0 {
                    Bytes::new()
                } else {
                    stream.recv_exact(len)?
                };
                Ok(Packet::Info { seq, body })
            }
            TYPE_ACK => {
                let raw = stream.recv_exact(SEQ_BYTES)?;
                Ok(Packet::Ack {
                    seq: (&raw[..]).get_u32(),
                })
            }
            TYPE_FIN => Ok(Packet::Fin),
            TYPE_FINACK => Ok(Packet::Finack),
            other => Err(RdtError::UnknownPacketType(other)),
        }
    }

    fn ensure_len(data: &[u8], needed: usize, context: &str) -> Result<()> {
        if data.len() < needed {
            Err(RdtError::Protocol(format!(
                "truncated {context}: expected at least {needed} bytes, got {}",
                data.len()
            )))
        } else {
            Ok(())
        }
    }
}

/// Split a buffer into INFO-sized bodies of at most `mss` bytes each.
/// Concatenating the fragments yields the original buffer; an empty
/// buffer yields no fragments.
pub fn fragment(buffer: &[u8], mss: usize) -> Vec<Bytes> {
    buffer.chunks(mss).map(Bytes::copy_from_slice).collect()
}
