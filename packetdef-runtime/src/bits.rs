// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Integer chunk codec.
//!
//! Consecutive bit-fields are packed least significant bit first into
//! a chunk of at most 8 bytes. The chunk is then written as a single
//! integer in the byte order of the definition, which lets a field
//! straddle a byte boundary without any special casing.

use bytes::{Buf, BufMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Return the mask selecting the `width` low bits of a value.
pub fn mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1 << width) - 1
    }
}

/// Read an unsigned integer spanning the whole input slice.
/// The slice must not be longer than 8 bytes.
pub fn get_uint(order: ByteOrder, mut buf: &[u8]) -> u64 {
    let nbytes = buf.len();
    assert!(nbytes <= 8, "chunk of {nbytes} bytes is too large");
    if nbytes == 0 {
        return 0;
    }
    match order {
        ByteOrder::LittleEndian => buf.get_uint_le(nbytes),
        ByteOrder::BigEndian => buf.get_uint(nbytes),
    }
}

/// Write the `nbytes` low bytes of `value`.
pub fn put_uint(order: ByteOrder, value: u64, nbytes: usize, buf: &mut impl BufMut) {
    assert!(nbytes <= 8, "chunk of {nbytes} bytes is too large");
    match order {
        ByteOrder::LittleEndian => buf.put_uint_le(value, nbytes),
        ByteOrder::BigEndian => buf.put_uint(value, nbytes),
    }
}

/// Extract the bit-field of `width` bits located at bit `shift` of a chunk.
pub fn extract(chunk: u64, shift: usize, width: usize) -> u64 {
    chunk.checked_shr(shift as u32).unwrap_or(0) & mask(width)
}

/// Accumulates bit-fields into a chunk, least significant bit first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BitPacker {
    value: u64,
    width: usize,
}

impl BitPacker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append the `width` low bits of `value` above the bits already packed.
    pub fn push(&mut self, value: u64, width: usize) {
        assert!(self.width + width <= 64, "bit-field chunk exceeds 64 bits");
        self.value |= (value & mask(width)).checked_shl(self.width as u32).unwrap_or(0);
        self.width += width;
    }

    pub fn is_aligned(&self) -> bool {
        self.width % 8 == 0
    }

    /// Write the packed chunk and reset the packer.
    pub fn flush(&mut self, order: ByteOrder, buf: &mut impl BufMut) {
        assert!(self.is_aligned(), "bit-field chunk is not an integral number of octets");
        put_uint(order, self.value, self.width / 8, buf);
        *self = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(order: ByteOrder, fields: &[(u64, usize)]) -> Vec<u8> {
        let mut packer = BitPacker::new();
        for (value, width) in fields {
            packer.push(*value, *width);
        }
        let mut buf = vec![];
        packer.flush(order, &mut buf);
        buf
    }

    #[test]
    fn straddling_fields_pack_lsb_first() {
        assert_eq!(
            pack(ByteOrder::LittleEndian, &[(0x77, 7), (0x5, 4), (0x15, 5)]),
            vec![0xf7, 0xaa]
        );
        assert_eq!(
            pack(ByteOrder::LittleEndian, &[(1, 2), (5, 4), (10, 4), (2, 4), (2, 2)]),
            vec![0x95, 0x8a]
        );
    }

    #[test]
    fn straddling_nibble_round_trips() {
        for nibble in 0..16 {
            let bytes = pack(ByteOrder::LittleEndian, &[(0x7f, 7), (nibble, 4), (0x15, 5)]);
            let chunk = get_uint(ByteOrder::LittleEndian, &bytes);
            assert_eq!(extract(chunk, 0, 7), 0x7f);
            assert_eq!(extract(chunk, 7, 4), nibble);
            assert_eq!(extract(chunk, 11, 5), 0x15);
        }
    }

    #[test]
    fn big_endian_chunk() {
        let bytes = pack(ByteOrder::BigEndian, &[(0x3, 4), (0x123, 12)]);
        assert_eq!(bytes, vec![0x12, 0x33]);
        let chunk = get_uint(ByteOrder::BigEndian, &bytes);
        assert_eq!(extract(chunk, 0, 4), 0x3);
        assert_eq!(extract(chunk, 4, 12), 0x123);
    }

    #[test]
    fn full_width_chunk() {
        let bytes = pack(ByteOrder::LittleEndian, &[(u64::MAX, 64)]);
        assert_eq!(bytes, vec![0xff; 8]);
        assert_eq!(extract(get_uint(ByteOrder::LittleEndian, &bytes), 0, 64), u64::MAX);
    }

    #[test]
    fn push_masks_oversized_values() {
        assert_eq!(pack(ByteOrder::LittleEndian, &[(0x1ff, 4), (0, 4)]), vec![0x0f]);
    }
}
