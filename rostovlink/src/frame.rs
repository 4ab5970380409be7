//! Magic-token framing.
//!
//! Every datagram on the wire starts with a fixed 6-byte token. The mux
//! layer prepends it on egress and strips it on ingress; datagrams that do
//! not carry it are foreign traffic and are dropped with a warning.

use bytes::{BufMut, Bytes, BytesMut};

/// Six-byte token prefixed to every datagram.
pub const MAGIC: &[u8; 6] = b"ROSTOV";

/// Largest datagram the receive workers will accept. The maximum UDP
/// payload is 65527 bytes; rounding the buffer up to 65535 costs nothing.
pub const MAX_DATAGRAM: usize = 65_535;

/// Prefix `payload` with the magic token, producing a wire-ready datagram.
pub fn seal(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAGIC.len() + payload.len());
    buf.put_slice(MAGIC);
    buf.put_slice(payload);
    buf.freeze()
}

/// Strip and validate the magic token.
///
/// Returns `None` for datagrams that do not start with the token; the
/// caller must discard them.
pub fn strip(datagram: &[u8]) -> Option<Bytes> {
    if datagram.len() < MAGIC.len() || &datagram[..MAGIC.len()] != MAGIC {
        tracing::warn!(
            len = datagram.len(),
            "dropping datagram without magic token"
        );
        return None;
    }
    Some(Bytes::copy_from_slice(&datagram[MAGIC.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_strip_roundtrip() {
        let sealed = seal(b"payload");
        assert_eq!(&sealed[..6], b"ROSTOV");
        let stripped = strip(&sealed).unwrap();
        assert_eq!(&stripped[..], b"payload");
    }

    #[test]
    fn empty_payload() {
        let sealed = seal(b"");
        assert_eq!(sealed.len(), 6);
        let stripped = strip(&sealed).unwrap();
        assert!(stripped.is_empty());
    }

    #[test]
    fn foreign_traffic_rejected() {
        assert!(strip(b"GOSSIP-and-more").is_none());
        assert!(strip(b"ROS").is_none());
        assert!(strip(b"").is_none());
    }
}
