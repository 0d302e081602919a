//! Helpers for the packed, LSB-first bit vectors that every layer passes around.  Bit `i` of a
//! vector lives in byte `i / 8` at position `i % 8`.
use core::fmt;

use bitvec::prelude::*;

/// Number of bytes needed to hold `bits` bits.
pub const fn byte_len(bits: usize) -> usize {
    (bits + 7) / 8
}

/// Check that `data` holds at least `bits` bits.
pub fn check_len(data: &[u8], bits: usize) -> crate::Result<()> {
    let needed = byte_len(bits);
    if data.len() < needed {
        return Err(crate::Error::BufferTooShort {
            bits,
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

pub fn get_bit(data: &[u8], index: usize) -> bool {
    (data[index / 8] >> (index % 8)) & 1 != 0
}

/// Copy bits `begin..end` of `src` into a fresh vector starting at bit 0.
pub fn extract(src: &[u8], begin: usize, end: usize) -> Vec<u8> {
    let src = src.view_bits::<Lsb0>();
    let mut out = BitVec::<u8, Lsb0>::repeat(false, end - begin);
    out.copy_from_bitslice(&src[begin..end]);
    out.into_vec()
}

/// Copy the first `end - begin` bits of `src` into bits `begin..end` of `dst`.
pub fn paste(dst: &mut [u8], begin: usize, end: usize, src: &[u8]) {
    let len = end - begin;
    let dst = dst.view_bits_mut::<Lsb0>();
    dst[begin..end].copy_from_bitslice(&src.view_bits::<Lsb0>()[..len]);
}

/// Renders a bit vector as `0110...(0x06)`: bits in clocking order, then the raw bytes with the
/// most significant byte first.
pub struct BitDisplay<'a> {
    data: &'a [u8],
    bits: usize,
}

impl<'a> BitDisplay<'a> {
    pub fn new(data: &'a [u8], bits: usize) -> Self {
        Self { data, bits }
    }
}

impl fmt::Display for BitDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits {
            f.write_str(if get_bit(self.data, i) { "1" } else { "0" })?;
        }
        f.write_str("(0x")?;
        for byte in self.data[..byte_len(self.bits)].iter().rev() {
            write!(f, "{:02X}", byte)?;
        }
        f.write_str(")")
    }
}
