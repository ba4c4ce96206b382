use std::fmt;

/// A `Bitfield` represents which pieces a BitTorrent peer has downloaded.
///
/// Each piece is represented by a single bit: `1` if the piece is available,
/// `0` if not. Bits are stored **most-significant-bit first** within each byte,
/// as in the BitTorrent wire format, so the backing
/// storage can be written to the wire as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    length: usize,
}

/// Returned by [`Bitfield::from_bytes`] when raw bytes do not describe a
/// bitfield of the requested length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitfieldError {
    /// The byte count does not match `ceil(length / 8)`.
    InvalidLength { expected: usize, actual: usize },
    /// Bits past `length` in the last byte are set.
    SpareBitsSet,
}

impl fmt::Display for BitfieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitfieldError::InvalidLength { expected, actual } => {
                write!(f, "invalid bitfield length: expected {} bytes, got {}", expected, actual)
            }
            BitfieldError::SpareBitsSet => write!(f, "bitfield has spare bits set"),
        }
    }
}

impl std::error::Error for BitfieldError {}

impl Bitfield {
    /// Creates a new `Bitfield` of the given length (number of pieces),
    /// with all bits initialized to `false` (no pieces).
    pub fn new(length: usize) -> Self {
        Bitfield {
            bits: vec![0; length.div_ceil(8)],
            length,
        }
    }

    /// Creates a `Bitfield` with every piece marked as available.
    pub fn full(length: usize) -> Self {
        let mut bf = Bitfield {
            bits: vec![0xff; length.div_ceil(8)],
            length,
        };
        if let Some(last) = bf.bits.last_mut() {
            *last &= last_byte_mask(length);
        }
        bf
    }

    /// Constructs a `Bitfield` from its wire representation.
    ///
    /// `bytes` must hold exactly `(length + 7) / 8` bytes and every bit past
    /// `length` must be zero.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>, length: usize) -> Result<Self, BitfieldError> {
        let bits = bytes.into();
        let expected = length.div_ceil(8);
        if bits.len() != expected {
            return Err(BitfieldError::InvalidLength {
                expected,
                actual: bits.len(),
            });
        }
        if let Some(last) = bits.last() {
            if last & !last_byte_mask(length) != 0 {
                return Err(BitfieldError::SpareBitsSet);
            }
        }

        Ok(Bitfield { bits, length })
    }

    /// Marks the piece at `index` as available. Setting an already set bit
    /// is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn set(&mut self, index: usize) {
        let (byte, mask) = self.locate(index);
        self.bits[byte] |= mask;
    }

    /// Marks the piece at `index` as missing. Clearing an unset bit is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn unset(&mut self, index: usize) {
        let (byte, mask) = self.locate(index);
        self.bits[byte] &= !mask;
    }

    /// Returns `true` if the piece at the given index is present.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn bit(&self, index: usize) -> bool {
        let (byte, mask) = self.locate(index);
        self.bits[byte] & mask != 0
    }

    /// Returns the raw packed byte at `index`, exactly as it appears on the wire.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below `ceil(len() / 8)`.
    pub fn byte(&self, index: usize) -> u8 {
        assert!(
            index < self.bits.len(),
            "byte index {} out of range for bitfield of {} bytes",
            index,
            self.bits.len()
        );
        self.bits[index]
    }

    /// Number of pieces tracked.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the underlying bytes of the bitfield, ready to be sent in a
    /// bitfield message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of pieces marked as available.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// `true` when every piece is available.
    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.length
    }

    /// `true` when at least one piece is missing.
    pub fn has_any_zero(&self) -> bool {
        !self.is_complete()
    }

    /// Iterates over the indices of the available pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.length).filter(move |&i| self.bit(i))
    }

    /// Returns `true` if `other` has at least one piece that `self` is
    /// missing. Both bitfields must describe the same torrent.
    pub fn interesting(&self, other: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(ours, theirs)| theirs & !ours != 0)
    }

    fn locate(&self, index: usize) -> (usize, u8) {
        assert!(
            index < self.length,
            "bit index {} out of range for bitfield of {} bits",
            index,
            self.length
        );
        (index / 8, 0x80 >> (index % 8))
    }
}

fn last_byte_mask(length: usize) -> u8 {
    match length % 8 {
        0 => 0xff,
        rem => 0xff << (8 - rem),
    }
}
