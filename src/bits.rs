//! Bit-field codec.
//!
//! Stateless helpers for pulling N-bit fields out of the three shapes a bit
//! pattern arrives in (bit string, 0/1 array, integer) and for building the
//! byte-wide registers the boards expect.
//!
//! Bit positions are always counted from the most-significant end of the
//! declared width: position 0 is the MSB. Callers must keep
//! `start + len <= width`; this is checked with `debug_assert!` only.

use std::fmt;

/// A bit pattern in one of its accepted input shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitSource<'a> {
    /// Big-endian string of `'0'`/`'1'` characters. Width is the string length.
    Text(&'a str),
    /// One element per bit, element 0 is the MSB. Any non-zero element is a 1.
    Bits(&'a [u8]),
    /// Integer, zero-padded (or truncated to its low bits) to the declared width.
    Word(u64),
}

impl<'a> BitSource<'a> {
    /// Natural width of the source, if it has one.
    ///
    /// Integers carry no width of their own and return `None`.
    pub fn natural_width(&self) -> Option<usize> {
        match self {
            Self::Text(s) => Some(s.len()),
            Self::Bits(b) => Some(b.len()),
            Self::Word(_) => None,
        }
    }

    /// Read `len` bits starting at `start`, counted from the MSB of a
    /// `width`-bit representation.
    pub fn extract(&self, start: usize, len: usize, width: usize) -> u64 {
        extract_field(*self, start, len, width)
    }

    /// Whole value of a source that carries its own width.
    pub fn value(&self) -> u64 {
        match self.natural_width() {
            Some(width) => extract_field(*self, 0, width, width),
            None => match self {
                Self::Word(v) => *v,
                _ => 0,
            },
        }
    }
}

impl<'a> From<&'a str> for BitSource<'a> {
    fn from(s: &'a str) -> Self {
        Self::Text(s)
    }
}

impl<'a> From<&'a [u8]> for BitSource<'a> {
    fn from(b: &'a [u8]) -> Self {
        Self::Bits(b)
    }
}

impl From<u64> for BitSource<'_> {
    fn from(v: u64) -> Self {
        Self::Word(v)
    }
}

impl From<u32> for BitSource<'_> {
    fn from(v: u32) -> Self {
        Self::Word(u64::from(v))
    }
}

impl fmt::Display for BitSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Bits(b) => {
                for bit in *b {
                    write!(f, "{}", u8::from(*bit != 0))?;
                }
                Ok(())
            }
            Self::Word(v) => write!(f, "{v:b}"),
        }
    }
}

fn mask(len: usize) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

/// Extract `len` bits starting at `start` (from the MSB) of a `width`-bit pattern.
pub fn extract_field(source: BitSource<'_>, start: usize, len: usize, width: usize) -> u64 {
    debug_assert!(start + len <= width, "bit field {start}+{len} exceeds width {width}");
    debug_assert!(len <= 64);

    match source {
        BitSource::Text(s) => s
            .bytes()
            .skip(start)
            .take(len)
            .fold(0u64, |acc, c| (acc << 1) | u64::from(c == b'1')),
        BitSource::Bits(bits) => bits
            .iter()
            .skip(start)
            .take(len)
            .fold(0u64, |acc, b| (acc << 1) | u64::from(*b != 0)),
        BitSource::Word(v) => {
            let v = v & mask(width);
            let shift = width.saturating_sub(start + len);
            if shift >= 64 {
                0
            } else {
                (v >> shift) & mask(len)
            }
        }
    }
}

/// Inverse of [`extract_field`] for integer patterns: write `value` into the
/// `len`-bit field at `start` of a `width`-bit word.
pub fn insert_field(word: u64, start: usize, len: usize, width: usize, value: u64) -> u64 {
    debug_assert!(start + len <= width, "bit field {start}+{len} exceeds width {width}");
    let shift = width - start - len;
    let field_mask = mask(len) << shift;
    (word & !field_mask) | ((value & mask(len)) << shift)
}

/// Set or clear one bit of a byte.
///
/// `offset` addresses position `7 - offset` of the MSB-first bit string, which
/// is integer bit `offset`.
pub fn pack_bit(byte: u8, offset: u8, bit: bool) -> u8 {
    debug_assert!(offset < 8);
    if bit {
        byte | (1 << offset)
    } else {
        byte & !(1 << offset)
    }
}

/// Read one bit of a byte, addressed like [`pack_bit`].
pub fn bit_at(byte: u8, offset: u8) -> bool {
    debug_assert!(offset < 8);
    (byte >> offset) & 1 == 1
}

/// Fixed-width, zero-padded binary rendering. Values wider than `width`
/// keep their low `width` bits.
pub fn to_bit_string(value: u64, width: usize) -> String {
    let s = format!("{value:0width$b}");
    s[s.len() - width..].to_string()
}
