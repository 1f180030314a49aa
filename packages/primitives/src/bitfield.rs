//! Semantic bit set of exactly `piece_count` bits, MSB-first within each
//! packed byte (the wire representation BEP 3 uses for the `bitfield`
//! message), with round-trip conversions to and from packed bytes and hex.

use thiserror::Error;

/// A fixed-size (`piece_count`-bit) bit set describing piece completion.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BitField {
    piece_count: usize,
    bytes: Vec<u8>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitFieldError {
    #[error("bitfield has {actual} bytes, expected {expected} for {piece_count} pieces")]
    WrongByteLength {
        actual: usize,
        expected: usize,
        piece_count: usize,
    },
    #[error("index {index} out of range for a bitfield with {piece_count} pieces")]
    IndexOutOfRange { index: usize, piece_count: usize },
    #[error("invalid hex string for bitfield")]
    InvalidHex,
    #[error("bitfields of different piece counts cannot be combined: {a} vs {b}")]
    MismatchedLength { a: usize, b: usize },
}

fn packed_len(piece_count: usize) -> usize {
    (piece_count + 7) / 8
}

impl BitField {
    /// Creates a new all-zero bitfield with `piece_count` bits.
    #[must_use]
    pub fn new(piece_count: usize) -> Self {
        Self {
            piece_count,
            bytes: vec![0u8; packed_len(piece_count)],
        }
    }

    /// Builds a bitfield from its packed wire representation. The tail bits
    /// beyond `piece_count` within the last byte are ignored on read but are
    /// required to be present (i.e. `bytes.len()` must equal the expected
    /// packed length) and are left untouched on write.
    pub fn from_bytes(piece_count: usize, bytes: &[u8]) -> Result<Self, BitFieldError> {
        let expected = packed_len(piece_count);
        if bytes.len() != expected {
            return Err(BitFieldError::WrongByteLength {
                actual: bytes.len(),
                expected,
                piece_count,
            });
        }
        Ok(Self {
            piece_count,
            bytes: bytes.to_vec(),
        })
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = vec![0u8; self.bytes.len() * 2];
        if self.bytes.is_empty() {
            return String::new();
        }
        binascii::bin2hex(&self.bytes, &mut out).expect("buffer sized for exact hex length");
        String::from_utf8(out).expect("hex output is always valid utf-8")
    }

    pub fn from_hex(piece_count: usize, hex: &str) -> Result<Self, BitFieldError> {
        let expected_bytes = packed_len(piece_count);
        if hex.is_empty() && expected_bytes == 0 {
            return Ok(Self::new(piece_count));
        }
        if hex.len() != expected_bytes * 2 {
            return Err(BitFieldError::InvalidHex);
        }
        let mut bytes = vec![0u8; expected_bytes];
        binascii::hex2bin(hex.as_bytes(), &mut bytes).map_err(|_| BitFieldError::InvalidHex)?;
        Ok(Self { piece_count, bytes })
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte = self.bytes[index / 8];
        let mask = 0x80 >> (index % 8);
        byte & mask != 0
    }

    /// # Errors
    ///
    /// Returns [`BitFieldError::IndexOutOfRange`] if `index >= piece_count`.
    pub fn set(&mut self, index: usize, value: bool) -> Result<(), BitFieldError> {
        if index >= self.piece_count {
            return Err(BitFieldError::IndexOutOfRange {
                index,
                piece_count: self.piece_count,
            });
        }
        let mask = 0x80 >> (index % 8);
        if value {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
        Ok(())
    }

    /// Bitwise AND against another bitfield of the same piece count.
    pub fn and(&self, other: &BitField) -> Result<BitField, BitFieldError> {
        self.combine(other, |a, b| a & b)
    }

    /// Bitwise OR against another bitfield of the same piece count.
    pub fn or(&self, other: &BitField) -> Result<BitField, BitFieldError> {
        self.combine(other, |a, b| a | b)
    }

    fn combine(&self, other: &BitField, op: impl Fn(u8, u8) -> u8) -> Result<BitField, BitFieldError> {
        if self.piece_count != other.piece_count {
            return Err(BitFieldError::MismatchedLength {
                a: self.piece_count,
                b: other.piece_count,
            });
        }
        let bytes = self.bytes.iter().zip(&other.bytes).map(|(a, b)| op(*a, *b)).collect();
        Ok(BitField {
            piece_count: self.piece_count,
            bytes,
        })
    }

    /// Iterates over the indices of all set bits.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::BitField;

    #[test]
    fn should_round_trip_through_hex() {
        let mut bf = BitField::new(10);
        bf.set(0, true).unwrap();
        bf.set(1, true).unwrap();
        bf.set(5, true).unwrap();
        let hex = bf.to_hex();
        let restored = BitField::from_hex(10, &hex).unwrap();
        assert_eq!(bf, restored);
    }

    #[test]
    fn should_round_trip_through_packed_bytes() {
        let mut bf = BitField::new(17);
        bf.set(16, true).unwrap();
        let bytes = bf.as_bytes().to_vec();
        let restored = BitField::from_bytes(17, &bytes).unwrap();
        assert_eq!(bf, restored);
    }

    #[test]
    fn should_count_set_bits() {
        let mut bf = BitField::new(100);
        bf.set(0, true).unwrap();
        bf.set(1, true).unwrap();
        bf.set(5, true).unwrap();
        assert_eq!(bf.count(), 3);
    }

    #[test]
    fn should_be_msb_first_within_a_byte() {
        let mut bf = BitField::new(8);
        bf.set(0, true).unwrap();
        assert_eq!(bf.as_bytes()[0], 0b1000_0000);
    }

    #[test]
    fn should_reject_out_of_range_index() {
        let mut bf = BitField::new(3);
        assert!(bf.set(3, true).is_err());
        assert!(!bf.get(3));
    }

    #[test]
    fn should_and_and_or_equally_sized_fields() {
        let mut a = BitField::new(4);
        a.set(0, true).unwrap();
        a.set(1, true).unwrap();
        let mut b = BitField::new(4);
        b.set(1, true).unwrap();
        b.set(2, true).unwrap();

        let anded = a.and(&b).unwrap();
        assert!(!anded.get(0));
        assert!(anded.get(1));
        assert!(!anded.get(2));

        let ored = a.or(&b).unwrap();
        assert!(ored.get(0));
        assert!(ored.get(1));
        assert!(ored.get(2));
    }

    #[test]
    fn should_reject_wrong_byte_length() {
        assert!(BitField::from_bytes(9, &[0u8]).is_err());
    }
}
