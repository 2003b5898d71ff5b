//! Byte collections with escaping and CRC-8 for the eBUS wire codec.
//!
//! This module implements [`Sequence`], an ordered container of *unescaped*
//! bytes. Escaping only happens at the [`Device`](crate::device::Device)
//! boundary: [`Sequence::escape`] produces the wire form and
//! [`Sequence::unescape`] recovers the unescaped form the rest of the codec
//! operates on.

use std::fmt;

use crate::{EXT, SYN};

/// Errors produced while escaping, unescaping, or parsing a [`Sequence`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// An `EXT` byte was followed by something other than `0x00`/`0x01`, or
    /// was the final byte of the sequence.
    #[error("EXT byte not followed by a valid escape continuation")]
    BadEscape,
    /// [`Sequence::from_hex`] was given input that isn't whitespace-separated
    /// hex byte pairs.
    #[error("not a valid hex byte sequence")]
    BadHex,
}

/// An ordered, unescaped byte buffer.
///
/// All three codec operations beyond push/get work on unescaped bytes:
/// escaping and unescaping convert between this representation and the wire
/// form, and [`Sequence::crc`] is computed over the unescaped bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    bytes: Vec<u8>,
}

impl Sequence {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sequence from already-unescaped bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Parses a sequence from a string of whitespace-separated hex byte
    /// pairs, e.g. `"10 FE 07 04 00 CE"`. Not part of the wire codec; a
    /// convenience for tests and debugging.
    pub fn from_hex(s: &str) -> Result<Self, SequenceError> {
        let mut bytes = Vec::new();
        for tok in s.split_whitespace() {
            let b = u8::from_str_radix(tok, 16).map_err(|_| SequenceError::BadHex)?;
            bytes.push(b);
        }
        Ok(Self { bytes })
    }

    /// Appends a single unescaped byte.
    pub fn push(&mut self, b: u8) {
        self.bytes.push(b);
    }

    /// Appends many unescaped bytes.
    pub fn extend(&mut self, bytes: impl IntoIterator<Item = u8>) {
        self.bytes.extend(bytes);
    }

    /// Returns the byte at `i`, if in range.
    pub fn at(&self, i: usize) -> Option<u8> {
        self.bytes.get(i).copied()
    }

    /// The number of unescaped bytes held.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the sequence holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Empties the sequence in place.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Borrows the unescaped bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Produces the wire form: `SYN` → `EXT 0x01`, `EXT` → `EXT 0x00`.
    pub fn escape(&self) -> Sequence {
        let mut out = Vec::with_capacity(self.bytes.len());
        for &b in &self.bytes {
            match b {
                SYN => {
                    out.push(EXT);
                    out.push(0x01);
                }
                EXT => {
                    out.push(EXT);
                    out.push(0x00);
                }
                other => out.push(other),
            }
        }
        Sequence { bytes: out }
    }

    /// Recovers the unescaped form of a wire sequence. Fails with
    /// [`SequenceError::BadEscape`] if an `EXT` is not followed by `0x00` or
    /// `0x01`, or if `EXT` is the final byte.
    pub fn unescape(&self) -> Result<Sequence, SequenceError> {
        let mut out = Vec::with_capacity(self.bytes.len());
        let mut iter = self.bytes.iter().copied();
        while let Some(b) = iter.next() {
            if b == EXT {
                match iter.next() {
                    Some(0x00) => out.push(EXT),
                    Some(0x01) => out.push(SYN),
                    _ => return Err(SequenceError::BadEscape),
                }
            } else {
                out.push(b);
            }
        }
        Ok(Sequence { bytes: out })
    }

    /// CRC-8 of the unescaped bytes, polynomial `0x9B`, seed `0`.
    pub fn crc(&self) -> u8 {
        let mut crc: u8 = 0;
        for &byte in &self.bytes {
            crc = crc_update(crc, byte);
        }
        crc
    }

    /// Renders the sequence as uppercase hex pairs separated by spaces,
    /// matching the wire-trace convention used by eBUS tooling.
    pub fn to_hex_string(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Updates a running CRC-8 (polynomial `0x9B`) with one byte, processing
/// bits high to low.
fn crc_update(mut crc: u8, byte: u8) -> u8 {
    for i in (0..8).rev() {
        let bit = (byte >> i) & 1;
        let top = (crc & 0x80) != 0;
        crc <<= 1;
        if top {
            crc ^= 0x9B;
        }
        crc ^= bit;
    }
    crc
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_string())
    }
}

impl FromIterator<u8> for Sequence {
    fn from_iter<T: IntoIterator<Item = u8>>(iter: T) -> Self {
        Sequence {
            bytes: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_then_unescape_round_trips() {
        let original = Sequence::from_bytes(vec![0x10, SYN, 0x20, EXT, 0x30]);
        let escaped = original.escape();
        assert_eq!(escaped.as_slice(), &[0x10, EXT, 0x01, 0x20, EXT, 0x00, 0x30]);
        assert_eq!(escaped.unescape().unwrap(), original);
    }

    #[test]
    fn no_escapes_needed_round_trips_identically() {
        let original = Sequence::from_bytes(vec![0x01, 0x02, 0x03]);
        assert_eq!(original.escape(), original);
    }

    #[test]
    fn unescape_rejects_ext_as_final_byte() {
        let wire = Sequence::from_bytes(vec![0x10, EXT]);
        assert_eq!(wire.unescape().unwrap_err(), SequenceError::BadEscape);
    }

    #[test]
    fn unescape_rejects_bad_escape_continuation() {
        let wire = Sequence::from_bytes(vec![EXT, 0x02]);
        assert_eq!(wire.unescape().unwrap_err(), SequenceError::BadEscape);
    }

    #[test]
    fn crc_of_known_zero_vector_is_zero() {
        // A single zero byte CRCs to zero under this seed/polynomial.
        let seq = Sequence::from_bytes(vec![0x00]);
        assert_eq!(seq.crc(), 0x00);
    }

    #[test]
    fn crc_matches_golden_table() {
        // (bytes, expected CRC) pairs computed from the §8 polynomial/seed.
        let cases: &[(&[u8], u8)] = &[
            (&[0x00], 0x00),
            (&[0xFF], 0xFF),
            (&[0x10, 0xFE, 0x07, 0x04, 0x00], 0xD2),
        ];
        for (bytes, expected) in cases {
            let seq = Sequence::from_bytes(bytes.to_vec());
            assert_eq!(seq.crc(), *expected, "crc of {bytes:02X?}");
        }
    }

    #[test]
    fn from_hex_parses_whitespace_separated_pairs() {
        let seq = Sequence::from_hex("10 FE 07 04 00").unwrap();
        assert_eq!(seq.as_slice(), &[0x10, 0xFE, 0x07, 0x04, 0x00]);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert_eq!(Sequence::from_hex("zz").unwrap_err(), SequenceError::BadHex);
    }

    #[test]
    fn to_hex_string_is_uppercase_space_separated() {
        let seq = Sequence::from_bytes(vec![0x0a, 0xfe]);
        assert_eq!(seq.to_hex_string(), "0A FE");
    }
}
