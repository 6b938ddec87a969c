//! Bit-level I/O primitives for the chunk codecs
//!
//! All three chunk codecs (XOR, delta, RLE) are built on the two types in
//! this module. Bits are stored MSB-first (most significant bit first) within
//! each byte:
//! ```text
//! Byte: [bit0 bit1 bit2 bit3 bit4 bit5 bit6 bit7]
//!        MSB                                    LSB
//! ```
//!
//! Unlike a one-shot encoder, a chunk's `BitWriter` lives as long as the
//! chunk: its buffer *is* the chunk's byte layout (fixed header followed by
//! the bit-packed payload) and it can be appended to at any time. Readers
//! borrow or share those bytes and never mutate them.
//!
//! # Example
//! ```
//! use kuba_profstore::compression::bit_stream::{BitReader, BitWriter};
//!
//! let mut writer = BitWriter::new();
//! writer.write_bit(true);
//! writer.write_bits(0b1010, 4);
//! writer.write_varint(-42);
//!
//! let mut reader = BitReader::new(writer.bytes());
//! assert!(reader.read_bit().unwrap());
//! assert_eq!(reader.read_bits(4).unwrap(), 0b1010);
//! assert_eq!(reader.read_varint().unwrap(), -42);
//! ```

use crate::error::ChunkError;

/// Longest encoding of a u64 as LEB128 varint
const MAX_VARINT_LEN: usize = 10;

/// Appendable bit stream over an owned byte buffer
///
/// # Internal State
///
/// - `buffer`: All bytes written so far, including a partially filled last byte
/// - `free_bits`: Unused low-order bits left in the last byte (0 = byte aligned)
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    buffer: Vec<u8>,
    free_bits: u8,
}

impl BitWriter {
    /// Create an empty bit writer
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            free_bits: 0,
        }
    }

    /// Create a writer whose buffer starts with `header_len` zero bytes
    ///
    /// The header is not part of the bit stream; codecs update it in place
    /// through [`BitWriter::bytes_mut`].
    pub fn with_header(header_len: usize) -> Self {
        Self {
            buffer: vec![0; header_len],
            free_bits: 0,
        }
    }

    /// Wrap previously written bytes
    ///
    /// The writer assumes the last byte is full until [`BitWriter::truncate_bits`]
    /// tells it where the encoded payload really ends.
    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            free_bits: 0,
        }
    }

    /// Write a single bit
    pub fn write_bit(&mut self, bit: bool) {
        if self.free_bits == 0 {
            self.buffer.push(0);
            self.free_bits = 8;
        }
        if bit {
            // buffer is non-empty: a byte was pushed above if none had free bits
            let last = self.buffer.len() - 1;
            self.buffer[last] |= 1 << (self.free_bits - 1);
        }
        self.free_bits -= 1;
    }

    /// Write the low `num_bits` bits of `value`, MSB first
    ///
    /// `num_bits` greater than 64 is clamped to 64.
    pub fn write_bits(&mut self, value: u64, num_bits: u8) {
        let mut remaining = num_bits.min(64);
        while remaining > 0 {
            if self.free_bits == 0 && remaining >= 8 {
                self.buffer.push((value >> (remaining - 8)) as u8);
                remaining -= 8;
            } else {
                remaining -= 1;
                self.write_bit((value >> remaining) & 1 == 1);
            }
        }
    }

    /// Write one raw byte
    pub fn write_byte(&mut self, byte: u8) {
        self.write_bits(byte as u64, 8);
    }

    /// Write an unsigned LEB128 varint
    pub fn write_uvarint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.write_byte(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// Write a signed varint (ZigZag + LEB128)
    pub fn write_varint(&mut self, value: i64) {
        self.write_uvarint(((value << 1) ^ (value >> 63)) as u64);
    }

    /// Overwrite `num_bits` bits starting at absolute bit offset `bit_offset`
    ///
    /// The target range must already have been written.
    pub fn set_bits_at(&mut self, bit_offset: usize, value: u64, num_bits: u8) {
        debug_assert!(bit_offset + num_bits as usize <= self.bit_len());
        for i in 0..num_bits as usize {
            let bit = (value >> (num_bits as usize - 1 - i)) & 1 == 1;
            let pos = bit_offset + i;
            let mask = 1u8 << (7 - pos % 8);
            if bit {
                self.buffer[pos / 8] |= mask;
            } else {
                self.buffer[pos / 8] &= !mask;
            }
        }
    }

    /// Cut the stream back to exactly `bit_len` bits
    ///
    /// Trailing bits of the new last byte are zeroed so subsequent writes can
    /// OR into them.
    pub fn truncate_bits(&mut self, bit_len: usize) {
        self.buffer.truncate(bit_len.div_ceil(8));
        let used = (bit_len % 8) as u8;
        if used == 0 {
            self.free_bits = 0;
        } else {
            self.free_bits = 8 - used;
            if let Some(last) = self.buffer.last_mut() {
                *last &= !((1u8 << self.free_bits) - 1);
            }
        }
    }

    /// Number of bits written, header included
    pub fn bit_len(&self) -> usize {
        self.buffer.len() * 8 - self.free_bits as usize
    }

    /// The written bytes; a partial last byte is zero padded
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access to the written bytes, for in-place header updates
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Drop everything and start again with a zeroed header
    pub fn reset(&mut self, header_len: usize) {
        self.buffer.clear();
        self.buffer.resize(header_len, 0);
        self.free_bits = 0;
    }

    /// Release spare capacity if it exceeds `threshold` bytes
    ///
    /// Returns true if the buffer was shrunk.
    pub fn compact(&mut self, threshold: usize) -> bool {
        if self.buffer.capacity() - self.buffer.len() > threshold {
            self.buffer.shrink_to_fit();
            return true;
        }
        false
    }

    /// Allocated capacity of the backing buffer
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Buffer size in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing (not even a header) has been written
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Sequential bit reader
///
/// Generic over its backing storage so the same decoder works on a chunk's
/// borrowed bytes and on a shared `bytes::Bytes` snapshot.
///
/// Reads past the end of the buffer fail with [`ChunkError::Decode`].
#[derive(Debug, Clone)]
pub struct BitReader<B> {
    buffer: B,
    byte_position: usize,
    bit_position: u8,
}

impl<B: AsRef<[u8]>> BitReader<B> {
    /// Create a reader positioned at the first bit of `buffer`
    pub fn new(buffer: B) -> Self {
        Self::with_offset(buffer, 0)
    }

    /// Create a reader positioned at byte `byte_offset` (e.g. past a header)
    pub fn with_offset(buffer: B, byte_offset: usize) -> Self {
        Self {
            buffer,
            byte_position: byte_offset,
            bit_position: 0,
        }
    }

    /// Read a single bit
    pub fn read_bit(&mut self) -> Result<bool, ChunkError> {
        let byte = *self
            .buffer
            .as_ref()
            .get(self.byte_position)
            .ok_or_else(ChunkError::truncated)?;

        let bit = (byte >> (7 - self.bit_position)) & 1 == 1;

        self.bit_position += 1;
        if self.bit_position == 8 {
            self.byte_position += 1;
            self.bit_position = 0;
        }

        Ok(bit)
    }

    /// Read `num_bits` bits (0-64) into the low end of a u64
    ///
    /// Whole bytes are consumed directly while the cursor is byte aligned;
    /// anything else falls back to single-bit reads. Both paths produce the
    /// same result.
    pub fn read_bits(&mut self, num_bits: u8) -> Result<u64, ChunkError> {
        if num_bits > 64 {
            return Err(ChunkError::Decode(format!(
                "cannot read more than 64 bits (requested: {})",
                num_bits
            )));
        }

        let mut value: u64 = 0;
        let mut remaining = num_bits;
        while remaining > 0 {
            if self.bit_position == 0 && remaining >= 8 {
                let byte = *self
                    .buffer
                    .as_ref()
                    .get(self.byte_position)
                    .ok_or_else(ChunkError::truncated)?;
                value = (value << 8) | byte as u64;
                self.byte_position += 1;
                remaining -= 8;
            } else {
                value = (value << 1) | self.read_bit()? as u64;
                remaining -= 1;
            }
        }

        Ok(value)
    }

    /// Read one raw byte
    pub fn read_byte(&mut self) -> Result<u8, ChunkError> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Read an unsigned LEB128 varint
    pub fn read_uvarint(&mut self) -> Result<u64, ChunkError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_byte()?;
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ChunkError::Decode("varint overflows 64 bits".to_string()))
    }

    /// Read a signed varint (ZigZag + LEB128)
    pub fn read_varint(&mut self) -> Result<i64, ChunkError> {
        let unsigned = self.read_uvarint()?;
        let value = (unsigned >> 1) as i64;
        Ok(if unsigned & 1 != 0 { !value } else { value })
    }

    /// Absolute bit offset of the cursor
    pub fn bit_offset(&self) -> usize {
        self.byte_position * 8 + self.bit_position as usize
    }

    /// Check if every byte of the buffer has been consumed
    pub fn is_at_end(&self) -> bool {
        self.byte_position >= self.buffer.as_ref().len()
    }
}
