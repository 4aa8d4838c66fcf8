//! Fixed-capacity bit packing.
//!
//! A [`BitPacker`] is a `WORDS * 32`-bit integer addressed by bit position,
//! where position 0 is the least-significant bit of the record. Storage word
//! 0 holds the most-significant 32 bits, so the word array reads "reversed"
//! relative to output memory order. [`BitPacker::to_le_bytes`] is the single
//! place that undoes this: it emits the words big-endian and then reverses
//! the whole byte string, so byte `i` of the output carries bits
//! `[8i, 8i + 8)`.

use crate::error::{EncodeError, EncodeResult};

/// Bit container holding `WORDS` 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitPacker<const WORDS: usize> {
    words: [u32; WORDS],
}

/// One 128-byte cache line.
pub type LinePacker = BitPacker<32>;

impl<const WORDS: usize> Default for BitPacker<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> BitPacker<WORDS> {
    /// Capacity in bits.
    pub const BITS: usize = WORDS * 32;

    /// Capacity in bytes.
    pub const BYTES: usize = WORDS * 4;

    /// Create a zeroed container.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    fn check(start: usize, size: usize) -> EncodeResult<()> {
        if size > 64 || start.checked_add(size).is_none_or(|end| end > Self::BITS) {
            return Err(EncodeError::OutOfRange {
                field: "bit packer",
                start,
                size,
                capacity: Self::BITS,
            });
        }
        Ok(())
    }

    /// Storage index of the word containing bit `position`.
    const fn word_index(position: usize) -> usize {
        WORDS - 1 - position / 32
    }

    /// Write the low `size` bits of `value` at bit offset `start`.
    ///
    /// Bits of `value` above `size` are ignored.
    pub fn set_bits(&mut self, start: usize, size: usize, value: u64) -> EncodeResult<()> {
        Self::check(start, size)?;
        self.set_bits_unchecked(start, size, value);
        Ok(())
    }

    fn set_bits_unchecked(&mut self, start: usize, size: usize, value: u64) {
        if size == 0 {
            return;
        }

        let offset = start % 32;
        let low = size.min(32 - offset);
        let mask = (((1u64 << low) - 1) as u32) << offset;
        let word = &mut self.words[Self::word_index(start)];
        *word = (*word & !mask) | (((value as u32) << offset) & mask);

        // Whatever did not fit continues at the bottom of the next word.
        if size > low {
            self.set_bits_unchecked(start + low, size - low, value >> low);
        }
    }

    /// Read `size` bits starting at bit offset `start`.
    pub fn get_bits(&self, start: usize, size: usize) -> EncodeResult<u64> {
        Self::check(start, size)?;
        Ok(self.get_bits_unchecked(start, size))
    }

    fn get_bits_unchecked(&self, start: usize, size: usize) -> u64 {
        if size == 0 {
            return 0;
        }

        let offset = start % 32;
        let low = size.min(32 - offset);
        let word = self.words[Self::word_index(start)];
        let part = u64::from(word >> offset) & ((1u64 << low) - 1);

        if size > low {
            part | (self.get_bits_unchecked(start + low, size - low) << low)
        } else {
            part
        }
    }

    /// Write a single bit.
    pub fn set_bit(&mut self, index: usize, value: bool) -> EncodeResult<()> {
        self.set_bits(index, 1, u64::from(value))
    }

    /// Read a single bit.
    pub fn get_bit(&self, index: usize) -> EncodeResult<bool> {
        Ok(self.get_bits(index, 1)? != 0)
    }

    /// Write an `f32` as its raw bit pattern.
    pub fn set_f32(&mut self, start: usize, value: f32) -> EncodeResult<()> {
        self.set_bits(start, 32, u64::from(value.to_bits()))
    }

    /// Read an `f32` from its raw bit pattern.
    pub fn get_f32(&self, start: usize) -> EncodeResult<f32> {
        Ok(f32::from_bits(self.get_bits(start, 32)? as u32))
    }

    /// Write a signed value as `size`-bit two's complement.
    pub fn set_signed(&mut self, start: usize, size: usize, value: i64) -> EncodeResult<()> {
        Self::check(start, size)?;
        if size == 0 {
            return Err(EncodeError::OutOfRange {
                field: "signed field",
                start,
                size,
                capacity: Self::BITS,
            });
        }
        let min = -(1i128 << (size - 1));
        let max = (1i128 << (size - 1)) - 1;
        if !(min..=max).contains(&i128::from(value)) {
            return Err(EncodeError::OutOfRange {
                field: "signed field",
                start,
                size,
                capacity: Self::BITS,
            });
        }
        self.set_bits(start, size, value as u64)
    }

    /// Read a `size`-bit two's complement value.
    pub fn get_signed(&self, start: usize, size: usize) -> EncodeResult<i64> {
        let raw = self.get_bits(start, size)?;
        if size == 0 || size == 64 {
            return Ok(raw as i64);
        }
        let shift = 64 - size;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// Finalize into little-endian output order.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_be_bytes()).collect();
        bytes.reverse();
        bytes
    }

    /// Finalize directly into `out`, which must be exactly [`Self::BYTES`] long.
    pub fn write_le_bytes(&self, out: &mut [u8]) -> EncodeResult<()> {
        if out.len() != Self::BYTES {
            return Err(EncodeError::EncodingMismatch {
                field: "packed record length",
                expected: Self::BYTES as u64,
                actual: out.len() as u64,
            });
        }
        out.copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    /// Inverse of [`Self::to_le_bytes`].
    pub fn from_le_bytes(bytes: &[u8]) -> EncodeResult<Self> {
        if bytes.len() < Self::BYTES {
            return Err(EncodeError::Truncated {
                needed: Self::BYTES,
                actual: bytes.len(),
            });
        }

        let mut packer = Self::new();
        for (storage, chunk) in bytes[..Self::BYTES].chunks_exact(4).rev().enumerate() {
            packer.words[storage] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(packer)
    }
}

/// Minimum number of bits needed to hold `value` (0 for 0).
#[must_use]
pub const fn bit_width(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}
