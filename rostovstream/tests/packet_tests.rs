//! Packet encode/decode round-trip tests.

use bytes::Bytes;
use rostovstream::packet::{fragment, Packet, MAX_BODY};

const SEQ_EDGES: [u32; 3] = [0, 1, u32::MAX];

#[test]
fn connect_roundtrip() {
    let p = Packet::Connect;
    assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
}

#[test]
fn connack_roundtrip() {
    let p = Packet::Connack;
    assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
}

#[test]
fn fin_and_finack_roundtrip() {
    for p in [Packet::Fin, Packet::Finack] {
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }
}

#[test]
fn ack_roundtrip_at_sequence_edges() {
    for seq in SEQ_EDGES {
        let p = Packet::Ack { seq };
        let encoded = p.encode();
        assert_eq!(encoded.len(), 5);
        assert_eq!(Packet::decode(&encoded).unwrap(), p);
    }
}

#[test]
fn info_roundtrip_at_sequence_edges() {
    for seq in SEQ_EDGES {
        let p = Packet::Info {
            seq,
            body: Bytes::from_static(b"body"),
        };
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }
}

#[test]
fn info_roundtrip_body_sizes() {
    for size in [0usize, 1, MAX_BODY] {
        let body = Bytes::from(vec![0xA5u8; size]);
        let p = Packet::Info { seq: 42, body };
        let encoded = p.encode();
        assert_eq!(encoded.len(), 1 + 2 + 4 + size);
        assert_eq!(Packet::decode(&encoded).unwrap(), p);
    }
}

#[test]
fn encoded_len_matches_encoding() {
    let packets = [
        Packet::Connect,
        Packet::Connack,
        Packet::Info {
            seq: 7,
            body: Bytes::from_static(b"xyz"),
        },
        Packet::Ack { seq: 7 },
        Packet::Fin,
        Packet::Finack,
    ];
    for p in packets {
        assert_eq!(p.encode().len(), p.encoded_len());
    }
}

#[test]
fn fragment_then_concat_is_identity() {
    let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 256) as u8).collect();
    for mss in [1usize, 997, 62_000] {
        let fragments = fragment(&data, mss);
        assert!(fragments.iter().all(|f| !f.is_empty() && f.len() <= mss));
        let glued: Vec<u8> = fragments.iter().flat_map(|f| f.iter().copied()).collect();
        assert_eq!(glued, data, "mss {mss}");
    }
}

#[test]
fn garbage_is_rejected_not_mangled() {
    assert!(Packet::decode(b"").is_err());
    assert!(Packet::decode(b"\xFF").is_err());
    assert!(Packet::decode(b"9").is_err());
    // ACK missing its sequence field.
    assert!(Packet::decode(b"3\x00\x00").is_err());
}
