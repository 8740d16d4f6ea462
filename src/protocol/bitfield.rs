//! Piece bitfield
//!
//! MSB-first bit set as carried by the `bitfield` message: bit 7 of byte 0
//! is piece 0.

use anyhow::Result;
use bitvec::prelude::*;

use crate::error::TorrentError;

/// Set of piece indices, sized to the torrent's piece count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// Create an empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; len],
        }
    }

    /// Create a bitfield with every piece set
    pub fn full(len: usize) -> Self {
        let mut bitfield = Self::new(len);
        // only live bits; the spare tail of the last byte stays zero
        bitfield.bits.fill(true);
        bitfield
    }

    /// Parse a bitfield received from a peer.
    ///
    /// The payload must be exactly `ceil(len / 8)` bytes and the spare
    /// trailing bits must be zero.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid bitfield length",
                format!("expected {} bytes, got {}", expected, bytes.len()),
            ).into());
        }

        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        if bits[len..].any() {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid bitfield",
                "spare bits set",
            ).into());
        }
        bits.truncate(len);

        Ok(Self { bits })
    }

    /// Number of pieces this bitfield covers
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the bitfield covers zero pieces
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Check if a piece is set
    pub fn has(&self, index: usize) -> bool {
        index < self.bits.len() && self.bits[index]
    }

    /// Set a piece. Out of range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, true);
        }
    }

    /// Clear a piece
    pub fn clear(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, false);
        }
    }

    /// Number of pieces set
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Whether every piece is set
    pub fn is_full(&self) -> bool {
        self.bits.all()
    }

    /// Iterate over the set piece indices in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Raw wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_layout() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(9);
        assert_eq!(bitfield.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(9));
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut bitfield = Bitfield::new(3);
        bitfield.set(8);
        assert_eq!(bitfield.count(), 0);
        assert!(!bitfield.has(100));
    }

    #[test]
    fn test_full_and_clear() {
        let mut bitfield = Bitfield::full(9);
        assert!(bitfield.is_full());
        assert_eq!(bitfield.as_bytes(), &[0xff, 0x80]);
        bitfield.clear(4);
        assert!(!bitfield.is_full());
        assert_eq!(bitfield.iter_set().collect::<Vec<_>>(), vec![0, 1, 2, 3, 5, 6, 7, 8]);
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        assert!(Bitfield::from_bytes(&[0xff], 9).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0x80, 0x00], 9).is_err());
    }

    #[test]
    fn test_from_bytes_spare_bits() {
        assert!(Bitfield::from_bytes(&[0xff, 0x80], 9).is_ok());
        assert!(Bitfield::from_bytes(&[0xff, 0x40], 9).is_err());
        // Exact multiple of eight has no spare bits
        assert!(Bitfield::from_bytes(&[0xff], 8).is_ok());
    }

    #[test]
    fn test_parsed_bytes_survive_edits() {
        let mut bitfield = Bitfield::from_bytes(&[0b1010_0000, 0b1000_0000], 9).unwrap();
        assert_eq!(bitfield.iter_set().collect::<Vec<_>>(), vec![0, 2, 8]);
        bitfield.set(1);
        bitfield.clear(8);
        assert_eq!(bitfield.as_bytes(), &[0b1110_0000, 0x00]);
        assert_eq!(Bitfield::from_bytes(bitfield.as_bytes(), 9).unwrap(), bitfield);
    }

    #[test]
    fn test_empty_bitfield() {
        let bitfield = Bitfield::new(0);
        assert!(bitfield.is_empty());
        assert!(bitfield.as_bytes().is_empty());
        assert!(Bitfield::from_bytes(&[], 0).is_ok());
    }
}
