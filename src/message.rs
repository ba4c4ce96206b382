use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{Rng, distr::Alphanumeric};

use crate::bitfield::{Bitfield, BitfieldError};

/// Protocol string carried by every handshake.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
/// Size of the fixed handshake layout.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;
/// Largest block accepted in `request`, `cancel` and `piece` unless configured
/// otherwise.
pub const DEFAULT_MAX_BLOCK_LEN: u32 = 128 * 1024;

const LENGTH_PREFIX: usize = 4;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

/// Reasons a peer's bytes cannot be accepted. Any of these is fatal to the
/// connection that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    UnknownMessageId(u8),
    InvalidPayloadLength {
        id: u8,
        expected: usize,
        actual: usize,
    },
    FrameTooLarge {
        length: usize,
        max: usize,
    },
    PieceIndexOutOfRange {
        index: u32,
        piece_count: usize,
    },
    BlockTooLarge {
        length: usize,
        max: u32,
    },
    InvalidBitfield(BitfieldError),
    InvalidHandshake(&'static str),
    UnexpectedBitfield,
    /// The peer has more blocks waiting in our send queue than allowed.
    TooManyRequests {
        max: usize,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownMessageId(id) => write!(f, "unknown message id: {}", id),
            ProtocolError::InvalidPayloadLength {
                id,
                expected,
                actual,
            } => write!(
                f,
                "invalid payload length for message {}: expected {}, got {}",
                id, expected, actual
            ),
            ProtocolError::FrameTooLarge { length, max } => {
                write!(f, "frame of {} bytes exceeds limit of {}", length, max)
            }
            ProtocolError::PieceIndexOutOfRange { index, piece_count } => {
                write!(f, "piece index {} out of range ({} pieces)", index, piece_count)
            }
            ProtocolError::BlockTooLarge { length, max } => {
                write!(f, "block of {} bytes exceeds limit of {}", length, max)
            }
            ProtocolError::InvalidBitfield(e) => write!(f, "invalid bitfield: {}", e),
            ProtocolError::InvalidHandshake(reason) => write!(f, "invalid handshake: {}", reason),
            ProtocolError::UnexpectedBitfield => {
                write!(f, "bitfield is only allowed right after the handshake")
            }
            ProtocolError::TooManyRequests { max } => {
                write!(f, "too many queued requests (limit {})", max)
            }
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::InvalidBitfield(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BitfieldError> for ProtocolError {
    fn from(value: BitfieldError) -> Self {
        ProtocolError::InvalidBitfield(value)
    }
}

/// Bounds a decoder enforces on incoming messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Number of pieces in the torrent. Piece indices must be below it and
    /// bitfield payloads must be exactly `ceil(piece_count / 8)` bytes.
    pub piece_count: usize,
    /// Largest block length accepted in `request`, `cancel` and `piece`.
    pub max_block_len: u32,
}

impl ParseLimits {
    pub fn new(piece_count: usize) -> Self {
        Self {
            piece_count,
            max_block_len: DEFAULT_MAX_BLOCK_LEN,
        }
    }

    pub fn with_max_block_len(mut self, max_block_len: u32) -> Self {
        self.max_block_len = max_block_len;
        self
    }

    /// Largest value a length prefix may carry.
    pub fn max_frame_len(&self) -> usize {
        let piece = 1 + 8 + self.max_block_len as usize;
        let bitfield = 1 + self.piece_count.div_ceil(8);
        piece.max(bitfield).max(13)
    }

    fn check_index(&self, index: u32) -> Result<(), ProtocolError> {
        if index as usize >= self.piece_count {
            return Err(ProtocolError::PieceIndexOutOfRange {
                index,
                piece_count: self.piece_count,
            });
        }
        Ok(())
    }

    fn check_block(&self, length: usize) -> Result<(), ProtocolError> {
        if length > self.max_block_len as usize {
            return Err(ProtocolError::BlockTooLarge {
                length,
                max: self.max_block_len,
            });
        }
        Ok(())
    }
}

/// Outcome of a parse attempt over a buffer that may hold a partial message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// One value was decoded from the first `usize` bytes of the buffer.
    Complete(T, usize),
    /// More bytes are needed. Nothing was consumed.
    Incomplete,
}

/// Opening message of every connection. It has neither a length prefix nor
/// a type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn protocol(&self) -> &'static [u8] {
        PROTOCOL
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Parses a handshake from the start of `buf`.
    ///
    /// A wrong protocol length byte is rejected as soon as it arrives; the
    /// protocol string is checked once the whole handshake is buffered.
    pub fn parse(buf: &[u8]) -> Result<Parsed<Handshake>, ProtocolError> {
        if let Some(&pstrlen) = buf.first() {
            if pstrlen as usize != PROTOCOL.len() {
                return Err(ProtocolError::InvalidHandshake("bad protocol length"));
            }
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(Parsed::Incomplete);
        }
        if &buf[1..20] != PROTOCOL {
            return Err(ProtocolError::InvalidHandshake("unknown protocol"));
        }

        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);

        Ok(Parsed::Complete(handshake, HANDSHAKE_LEN))
    }
}

/// Represents a message exchanged between BitTorrent peers
/// according to the standard peer wire protocol.
///
/// Each variant corresponds to one of the standard messages a peer
/// can send. Some messages carry additional data (like piece index
/// or a block of data), while others are simple notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Opens the connection. Framed separately from every other message.
    Handshake(Handshake),

    /// Tells the receiving peer that it is **choked**.
    /// No data will be sent until an `Unchoke` message is received.
    Choke,

    /// Tells the receiving peer that it is **unchoked** and may
    /// request pieces.
    Unchoke,

    /// Indicates that the sending peer is **interested** in downloading pieces.
    Interested,

    /// Indicates that the sending peer is **not interested** in downloading pieces.
    NotInterested,

    /// Announces that the sending peer has successfully downloaded
    /// the piece at the given index.
    Have(u32),

    /// Sends the bitfield of the pieces the sending peer has.
    Bitfield(Bitfield),

    /// Requests a block of data from the receiving peer.
    ///
    /// # Fields
    ///
    /// * `index` - Piece index being requested.
    /// * `begin` - Offset within the piece.
    /// * `length` - Length of the requested block in bytes.
    Request((u32, u32, u32)),

    /// Sends a block of data in response to a `Request` message.
    ///
    /// # Fields
    ///
    /// * `index` - Piece index of the block.
    /// * `begin` - Offset within the piece.
    /// * `block` - The actual bytes of data being sent.
    Piece((u32, u32, Bytes)),

    /// Cancels a previously sent `Request`.
    ///
    /// # Fields
    ///
    /// * `index` - Piece index of the canceled block.
    /// * `begin` - Offset within the piece.
    /// * `length` - Length of the canceled block in bytes.
    Cancel((u32, u32, u32)),
}

/// A decoded unit of the framed message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A zero-length frame. Signals liveness only.
    KeepAlive,
    Message(PeerMessage),
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::Handshake(h) => {
                write!(f, "PeerMessage::Handshake({})", to_hex(&h.info_hash))
            }
            PeerMessage::Bitfield(bitfield) => {
                write!(f, "PeerMessage::Bitfield({})", bitfield.len())
            }
            PeerMessage::Choke => write!(f, "PeerMessage::Choke"),
            PeerMessage::Unchoke => write!(f, "PeerMessage::Unchoke"),
            PeerMessage::Interested => write!(f, "PeerMessage::Interested"),
            PeerMessage::NotInterested => write!(f, "PeerMessage::NotInterested"),
            PeerMessage::Have(i) => write!(f, "PeerMessage::Have({})", i),
            PeerMessage::Request((i, b, l)) => {
                write!(f, "PeerMessage::Request({}, {}, {})", i, b, l)
            }
            PeerMessage::Piece((i, b, d)) => {
                write!(f, "PeerMessage::Piece({}, {}, {})", i, b, d.len())
            }
            PeerMessage::Cancel((i, b, l)) => write!(f, "PeerMessage::Cancel({}, {}, {})", i, b, l),
        }
    }
}

impl PeerMessage {
    /// Type byte on the wire, `None` for the handshake.
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            PeerMessage::Handshake(_) => return None,
            PeerMessage::Choke => ID_CHOKE,
            PeerMessage::Unchoke => ID_UNCHOKE,
            PeerMessage::Interested => ID_INTERESTED,
            PeerMessage::NotInterested => ID_NOT_INTERESTED,
            PeerMessage::Have(_) => ID_HAVE,
            PeerMessage::Bitfield(_) => ID_BITFIELD,
            PeerMessage::Request(_) => ID_REQUEST,
            PeerMessage::Piece(_) => ID_PIECE,
            PeerMessage::Cancel(_) => ID_CANCEL,
        };
        Some(id)
    }

    /// Same as [`PeerMessage::encode`].
    pub fn serialize(&self) -> Bytes {
        self.encode()
    }

    pub fn encode(&self) -> Bytes {
        let buf = match self {
            PeerMessage::Handshake(handshake) => return handshake.encode(),
            PeerMessage::Choke => Self::simple(ID_CHOKE),
            PeerMessage::Unchoke => Self::simple(ID_UNCHOKE),
            PeerMessage::Interested => Self::simple(ID_INTERESTED),
            PeerMessage::NotInterested => Self::simple(ID_NOT_INTERESTED),
            PeerMessage::Have(index) => {
                let mut b = BytesMut::with_capacity(9);
                b.put_u32(5);
                b.put_u8(ID_HAVE);
                b.put_u32(*index);
                b
            }
            PeerMessage::Bitfield(bitfield) => {
                let bytes = bitfield.as_bytes();
                let total_len = 1 + bytes.len();
                let mut b = BytesMut::with_capacity(LENGTH_PREFIX + total_len);
                b.put_u32(total_len as u32);
                b.put_u8(ID_BITFIELD);
                b.put_slice(bytes);
                b
            }
            PeerMessage::Request(block) => Self::block_ref(ID_REQUEST, block),
            PeerMessage::Cancel(block) => Self::block_ref(ID_CANCEL, block),
            PeerMessage::Piece((index, begin, block)) => {
                let total_len = 1 + 8 + block.len();
                let mut b = BytesMut::with_capacity(LENGTH_PREFIX + total_len);
                b.put_u32(total_len as u32);
                b.put_u8(ID_PIECE);
                b.put_u32(*index);
                b.put_u32(*begin);
                b.put_slice(block);
                b
            }
        };

        buf.freeze()
    }

    /// Encoded keep-alive frame.
    pub fn keep_alive() -> Bytes {
        Bytes::from_static(&[0, 0, 0, 0])
    }

    fn simple(id: u8) -> BytesMut {
        let mut b = BytesMut::with_capacity(5);
        b.put_u32(1);
        b.put_u8(id);
        b
    }

    fn block_ref(id: u8, (index, begin, length): &(u32, u32, u32)) -> BytesMut {
        let mut b = BytesMut::with_capacity(17);
        b.put_u32(13);
        b.put_u8(id);
        b.put_u32(*index);
        b.put_u32(*begin);
        b.put_u32(*length);
        b
    }

    /// Parses the first framed message in `buf`.
    ///
    /// `buf` may hold less than a message, in which case
    /// [`Parsed::Incomplete`] is returned, or more than one, in which case
    /// only the first is decoded and its size reported.
    pub fn parse(buf: &[u8], limits: &ParseLimits) -> Result<Parsed<Frame>, ProtocolError> {
        let Some(total) = frame_len(buf, limits)? else {
            return Ok(Parsed::Incomplete);
        };
        let body = Bytes::copy_from_slice(&buf[LENGTH_PREFIX..total]);
        let frame = decode_body(body, limits)?;

        Ok(Parsed::Complete(frame, total))
    }
}

/// Incremental decoder over a connection's receive buffer.
///
/// Every successful call removes exactly one frame from the front of the
/// buffer; an incomplete frame is left in place until more bytes arrive.
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    limits: ParseLimits,
}

impl MessageDecoder {
    pub fn new(limits: ParseLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    pub fn decode_handshake(&self, buf: &mut BytesMut) -> Result<Option<Handshake>, ProtocolError> {
        match Handshake::parse(buf)? {
            Parsed::Complete(handshake, consumed) => {
                buf.advance(consumed);
                Ok(Some(handshake))
            }
            Parsed::Incomplete => Ok(None),
        }
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let Some(total) = frame_len(buf, &self.limits)? else {
            return Ok(None);
        };
        let mut frame = buf.split_to(total);
        frame.advance(LENGTH_PREFIX);

        decode_body(frame.freeze(), &self.limits).map(Some)
    }
}

/// Total size of the first frame in `buf`, prefix included, once it is
/// fully buffered.
fn frame_len(buf: &[u8], limits: &ParseLimits) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let max = limits.max_frame_len();
    if length > max {
        return Err(ProtocolError::FrameTooLarge { length, max });
    }
    let total = LENGTH_PREFIX + length;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some(total))
}

/// Decodes `[type][payload]` of a frame whose length prefix was stripped.
fn decode_body(mut body: Bytes, limits: &ParseLimits) -> Result<Frame, ProtocolError> {
    if body.is_empty() {
        return Ok(Frame::KeepAlive);
    }

    let id = body.get_u8();
    let msg = match id {
        ID_CHOKE | ID_UNCHOKE | ID_INTERESTED | ID_NOT_INTERESTED => {
            expect_len(id, &body, 0)?;
            match id {
                ID_CHOKE => PeerMessage::Choke,
                ID_UNCHOKE => PeerMessage::Unchoke,
                ID_INTERESTED => PeerMessage::Interested,
                _ => PeerMessage::NotInterested,
            }
        }
        ID_HAVE => {
            expect_len(id, &body, 4)?;
            let index = body.get_u32();
            limits.check_index(index)?;
            PeerMessage::Have(index)
        }
        ID_BITFIELD => {
            expect_len(id, &body, limits.piece_count.div_ceil(8))?;
            PeerMessage::Bitfield(Bitfield::from_bytes(body.to_vec(), limits.piece_count)?)
        }
        ID_REQUEST | ID_CANCEL => {
            expect_len(id, &body, 12)?;
            let index = body.get_u32();
            let begin = body.get_u32();
            let length = body.get_u32();
            limits.check_index(index)?;
            limits.check_block(length as usize)?;
            if id == ID_REQUEST {
                PeerMessage::Request((index, begin, length))
            } else {
                PeerMessage::Cancel((index, begin, length))
            }
        }
        ID_PIECE => {
            if body.len() < 8 {
                return Err(ProtocolError::InvalidPayloadLength {
                    id,
                    expected: 8,
                    actual: body.len(),
                });
            }
            let index = body.get_u32();
            let begin = body.get_u32();
            limits.check_index(index)?;
            limits.check_block(body.len())?;
            PeerMessage::Piece((index, begin, body))
        }
        _ => return Err(ProtocolError::UnknownMessageId(id)),
    };

    Ok(Frame::Message(msg))
}

fn expect_len(id: u8, payload: &Bytes, expected: usize) -> Result<(), ProtocolError> {
    if payload.len() != expected {
        return Err(ProtocolError::InvalidPayloadLength {
            id,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Generates an Azureus-style peer id: client prefix followed by random
/// alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];

    let prefix = b"-PW0100-";
    peer_id[..prefix.len()].copy_from_slice(prefix);

    let mut rng = rand::rng();
    for byte in peer_id[prefix.len()..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }

    peer_id
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
