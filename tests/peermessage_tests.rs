use bytes::{BufMut, Bytes, BytesMut};
use peerwire::{
    bitfield::Bitfield,
    message::{
        Frame, HANDSHAKE_LEN, Handshake, MessageDecoder, ParseLimits, Parsed, PeerMessage,
        ProtocolError, generate_peer_id,
    },
};

fn roundtrip(msg: PeerMessage, limits: &ParseLimits) -> PeerMessage {
    let encoded = msg.encode();
    match PeerMessage::parse(&encoded, limits).unwrap() {
        Parsed::Complete(Frame::Message(decoded), consumed) => {
            assert_eq!(consumed, encoded.len());
            decoded
        }
        other => panic!("expected a complete message, got {:?}", other),
    }
}

#[test]
fn test_keepalive() {
    let encoded = PeerMessage::keep_alive();
    assert_eq!(&encoded[..], &[0, 0, 0, 0]);

    let parsed = PeerMessage::parse(&encoded, &ParseLimits::new(1)).unwrap();
    assert_eq!(parsed, Parsed::Complete(Frame::KeepAlive, 4));
}

#[test]
fn test_simple_messages() {
    let limits = ParseLimits::new(1);
    let msgs = [
        (PeerMessage::Choke, 0u8),
        (PeerMessage::Unchoke, 1),
        (PeerMessage::Interested, 2),
        (PeerMessage::NotInterested, 3),
    ];

    for (msg, id) in msgs {
        let encoded = msg.serialize();
        assert_eq!(&encoded[..], &[0, 0, 0, 1, id]);
        assert_eq!(roundtrip(msg.clone(), &limits), msg);
    }
}

#[test]
fn test_have() {
    let msg = PeerMessage::Have(42);
    assert_eq!(&msg.encode()[..], &[0, 0, 0, 5, 4, 0, 0, 0, 42]);
    assert_eq!(roundtrip(msg.clone(), &ParseLimits::new(100)), msg);
}

#[test]
fn test_have_max_index() {
    let limits = ParseLimits::new(u32::MAX as usize + 1);
    let msg = PeerMessage::Have(u32::MAX);
    assert_eq!(roundtrip(msg.clone(), &limits), msg);
}

#[test]
fn test_max_values_roundtrip() {
    let limits = ParseLimits::new(u32::MAX as usize + 1);
    let msgs = [
        PeerMessage::Request((u32::MAX, u32::MAX, 16_384)),
        PeerMessage::Cancel((u32::MAX, u32::MAX, 16_384)),
        PeerMessage::Piece((u32::MAX, u32::MAX, Bytes::from_static(b"tail"))),
        PeerMessage::Request((0, u32::MAX, 0)),
    ];

    for msg in msgs {
        assert_eq!(roundtrip(msg.clone(), &limits), msg);
    }
}

#[test]
fn test_request() {
    let msg = PeerMessage::Request((1, 16_384, 16_384));
    assert_eq!(msg.encode().len(), 17);
    assert_eq!(roundtrip(msg.clone(), &ParseLimits::new(2)), msg);
}

#[test]
fn test_cancel() {
    let msg = PeerMessage::Cancel((3, 0, 16_384));
    assert_eq!(msg.id(), Some(8));
    assert_eq!(roundtrip(msg.clone(), &ParseLimits::new(4)), msg);
}

#[test]
fn test_piece() {
    let block = Bytes::from_static(b"hello world");
    let msg = PeerMessage::Piece((7, 0, block.clone()));

    let encoded = msg.encode();
    assert_eq!(encoded.len(), 4 + 1 + 4 + 4 + block.len());

    match roundtrip(msg, &ParseLimits::new(8)) {
        PeerMessage::Piece((i, b, data)) => {
            assert_eq!(i, 7);
            assert_eq!(b, 0);
            assert_eq!(data, block);
        }
        other => panic!("expected Piece, got {}", other),
    }
}

#[test]
fn test_full_size_block_piece() {
    let block = Bytes::from(vec![0x5a; 0x4000]);
    let msg = PeerMessage::Piece((2, 0x4000, block));

    let encoded = msg.serialize();
    assert_eq!(encoded.len(), 4 + 1 + 4 + 4 + 0x4000);
    assert_eq!(&encoded[..5], &[0, 0, 0x40, 0x09, 7]);
    assert_eq!(roundtrip(msg.clone(), &ParseLimits::new(3)), msg);
}

#[test]
fn test_empty_piece() {
    let msg = PeerMessage::Piece((0, 0, Bytes::new()));
    assert_eq!(msg.encode().len(), 13);
    assert_eq!(roundtrip(msg.clone(), &ParseLimits::new(1)), msg);
}

#[test]
fn test_bitfield_roundtrip() {
    let total_pieces = 10;
    let mut bf = Bitfield::new(total_pieces);
    bf.set(0);
    bf.set(3);
    bf.set(9);

    let msg = PeerMessage::Bitfield(bf.clone());
    assert_eq!(&msg.encode()[..], &[0, 0, 0, 3, 5, 0b1001_0000, 0b0100_0000]);

    match roundtrip(msg, &ParseLimits::new(total_pieces)) {
        PeerMessage::Bitfield(decoded) => assert_eq!(decoded, bf),
        other => panic!("expected Bitfield, got {}", other),
    }
}

#[test]
fn test_handshake_roundtrip() {
    let info_hash = [7u8; 20];
    let peer_id = generate_peer_id();
    let handshake = Handshake::new(info_hash, peer_id);

    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");

    let parsed = Handshake::parse(&encoded).unwrap();
    assert_eq!(parsed, Parsed::Complete(handshake.clone(), HANDSHAKE_LEN));
    assert_eq!(PeerMessage::Handshake(handshake).id(), None);
}

#[test]
fn test_handshake_incomplete() {
    let encoded = Handshake::new([1; 20], [2; 20]).encode();
    for n in 0..HANDSHAKE_LEN {
        assert_eq!(Handshake::parse(&encoded[..n]).unwrap(), Parsed::Incomplete);
    }
}

#[test]
fn test_handshake_bad_protocol() {
    let mut encoded = BytesMut::from(&Handshake::new([1; 20], [2; 20]).encode()[..]);
    encoded[5] = b'X';
    assert!(matches!(
        Handshake::parse(&encoded),
        Err(ProtocolError::InvalidHandshake(_))
    ));

    assert!(matches!(
        Handshake::parse(&[18]),
        Err(ProtocolError::InvalidHandshake(_))
    ));
}

#[test]
fn test_generate_peer_id() {
    let id = generate_peer_id();
    assert_eq!(&id[..8], b"-PW0100-");
    assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
}

#[test]
fn test_incomplete_frames() {
    let limits = ParseLimits::new(10);
    let encoded = PeerMessage::Request((1, 2, 3)).encode();
    for n in 0..encoded.len() {
        assert_eq!(
            PeerMessage::parse(&encoded[..n], &limits).unwrap(),
            Parsed::Incomplete
        );
    }
}

#[test]
fn test_parse_consumes_only_first_message() {
    let limits = ParseLimits::new(10);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&PeerMessage::Have(1).encode());
    buf.extend_from_slice(&PeerMessage::Unchoke.encode());

    match PeerMessage::parse(&buf, &limits).unwrap() {
        Parsed::Complete(Frame::Message(PeerMessage::Have(1)), 9) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_decoder_byte_by_byte() {
    let limits = ParseLimits::new(16);
    let decoder = MessageDecoder::new(limits);
    let handshake = Handshake::new([9; 20], [8; 20]);

    let mut wire = BytesMut::new();
    wire.extend_from_slice(&handshake.encode());
    let msgs = vec![
        PeerMessage::Bitfield(Bitfield::full(16)),
        PeerMessage::Interested,
        PeerMessage::Piece((3, 16_384, Bytes::from_static(b"block"))),
    ];
    for msg in &msgs {
        wire.extend_from_slice(&msg.encode());
    }
    wire.extend_from_slice(&PeerMessage::keep_alive());

    let mut buf = BytesMut::new();
    let mut got_handshake = None;
    let mut frames = Vec::new();
    for byte in wire.iter() {
        buf.put_u8(*byte);
        if got_handshake.is_none() {
            got_handshake = decoder.decode_handshake(&mut buf).unwrap();
            continue;
        }
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
    }

    assert_eq!(got_handshake, Some(handshake));
    assert!(buf.is_empty());
    let mut expected: Vec<Frame> = msgs.into_iter().map(Frame::Message).collect();
    expected.push(Frame::KeepAlive);
    assert_eq!(frames, expected);
}

#[test]
fn test_invalid_bitfield_length() {
    // 10 pieces need 2 bytes
    let payload = [0, 0, 0, 2, 5, 0xff];
    let err = PeerMessage::parse(&payload, &ParseLimits::new(10)).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::InvalidPayloadLength {
            id: 5,
            expected: 2,
            actual: 1
        }
    );
}

#[test]
fn test_bitfield_spare_bits() {
    let payload = [0, 0, 0, 3, 5, 0xff, 0xff];
    let err = PeerMessage::parse(&payload, &ParseLimits::new(10)).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidBitfield(_)));
}

#[test]
fn test_unknown_message_id() {
    let err = PeerMessage::parse(&[0, 0, 0, 1, 99], &ParseLimits::new(1)).unwrap_err();
    assert_eq!(err, ProtocolError::UnknownMessageId(99));
}

#[test]
fn test_port_message_rejected() {
    let err = PeerMessage::parse(&[0, 0, 0, 3, 9, 0x1a, 0xe1], &ParseLimits::new(1)).unwrap_err();
    assert_eq!(err, ProtocolError::UnknownMessageId(9));
}

#[test]
fn test_wrong_payload_length() {
    let err = PeerMessage::parse(&[0, 0, 0, 2, 0, 0], &ParseLimits::new(1)).unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::InvalidPayloadLength { id: 0, .. }
    ));
}

#[test]
fn test_piece_index_out_of_range() {
    let encoded = PeerMessage::Have(10).encode();
    let err = PeerMessage::parse(&encoded, &ParseLimits::new(10)).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::PieceIndexOutOfRange {
            index: 10,
            piece_count: 10
        }
    );
}

#[test]
fn test_block_too_large() {
    let limits = ParseLimits::new(4).with_max_block_len(16);
    let encoded = PeerMessage::Request((0, 0, 17)).encode();
    let err = PeerMessage::parse(&encoded, &limits).unwrap_err();
    assert!(matches!(err, ProtocolError::BlockTooLarge { length: 17, .. }));
}

#[test]
fn test_frame_too_large() {
    let limits = ParseLimits::new(4).with_max_block_len(16);
    let mut buf = BytesMut::new();
    buf.put_u32(limits.max_frame_len() as u32 + 1);
    let err = PeerMessage::parse(&buf, &limits).unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
}

#[test]
fn test_display_summarizes_blocks() {
    let msg = PeerMessage::Piece((1, 2, Bytes::from(vec![0u8; 300])));
    assert_eq!(msg.to_string(), "PeerMessage::Piece(1, 2, 300)");
}
