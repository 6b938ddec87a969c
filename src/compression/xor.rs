//! Gorilla XOR chunk for integer sample values
//!
//! Consecutive profile values for one stack node tend to repeat or change in
//! few bits, so each sample is stored as the XOR against its predecessor:
//!
//! ```text
//! Previous: 0x0000_0000_0000_1F40   (8000)
//! Current:  0x0000_0000_0000_1F58   (8024)
//! XOR:      0x0000_0000_0000_0018   <- 59 leading, 3 trailing zeros
//! ```
//!
//! # Encoding
//!
//! - First sample: raw 64 bits
//! - `0`: value unchanged (XOR = 0)
//! - `10` + meaningful bits: XOR fits inside the previous leading/trailing window
//! - `11` + 5-bit leading + 6-bit length + meaningful bits: new window
//!
//! The leading-zero count is clamped to 31 so it fits 5 bits, and a length of
//! 64 is written as 0. Until the first window is declared the appender holds
//! [`NO_WINDOW`], which forces the first non-zero XOR to open one.
//!
//! # References
//!
//! - Paper: "Gorilla: A Fast, Scalable, In-Memory Time Series Database"
//! - URL: <http://www.vldb.org/pvldb/vol8/p1816-teller.pdf>

use super::bit_stream::{BitReader, BitWriter};
use super::{
    check_header, read_u16, write_u16, Chunk, ChunkAppender, ChunkIterator, Encoding,
    COMPACT_CAPACITY_THRESHOLD, MAX_SAMPLES_PER_CHUNK,
};
use crate::error::ChunkError;

/// Header: big-endian u16 sample count
const HEADER_LEN: usize = 2;

/// Leading-zero marker meaning "no window declared yet"
pub const NO_WINDOW: u8 = 0xff;

/// XOR-encoded chunk
#[derive(Debug, Clone)]
pub struct XorChunk {
    stream: BitWriter,
}

impl XorChunk {
    /// Create an empty chunk
    pub fn new() -> Self {
        Self {
            stream: BitWriter::with_header(HEADER_LEN),
        }
    }

    /// Wrap bytes previously obtained from [`Chunk::bytes`]
    pub fn from_data(data: Vec<u8>) -> Result<Self, ChunkError> {
        check_header(&data, HEADER_LEN)?;
        Ok(Self {
            stream: BitWriter::from_bytes(data),
        })
    }
}

impl Default for XorChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunk for XorChunk {
    fn bytes(&self) -> &[u8] {
        self.stream.bytes()
    }

    fn encoding(&self) -> Encoding {
        Encoding::Xor
    }

    fn num_samples(&self) -> usize {
        read_u16(self.stream.bytes(), 0).unwrap_or(0) as usize
    }

    fn compact(&mut self) {
        self.stream.compact(COMPACT_CAPACITY_THRESHOLD);
    }

    fn appender(&mut self) -> Result<Box<dyn ChunkAppender + '_>, ChunkError> {
        let mut it = XorIterator::new(self.stream.bytes());
        while it.next().is_some() {}
        if let Some(err) = it.err() {
            return Err(err.clone());
        }
        let (num, prev, leading, trailing) = (it.read, it.value, it.leading, it.trailing);
        let end = it.reader.bit_offset();

        self.stream.truncate_bits(end);
        Ok(Box::new(XorAppender {
            stream: &mut self.stream,
            num,
            prev,
            leading,
            trailing,
        }))
    }

    fn iterator(&self) -> Box<dyn ChunkIterator + Send + '_> {
        Box::new(XorIterator::new(self.stream.bytes()))
    }

    fn reset(&mut self) {
        self.stream.reset(HEADER_LEN);
    }
}

/// Appender for [`XorChunk`]
pub struct XorAppender<'a> {
    stream: &'a mut BitWriter,
    num: usize,
    prev: u64,
    leading: u8,
    trailing: u8,
}

impl XorAppender<'_> {
    fn write_delta(&mut self, delta: u64) {
        if delta == 0 {
            self.stream.write_bit(false);
            return;
        }
        self.stream.write_bit(true);

        let mut leading = delta.leading_zeros() as u8;
        let trailing = delta.trailing_zeros() as u8;
        if leading >= 32 {
            leading = 31;
        }

        if self.leading != NO_WINDOW && leading >= self.leading && trailing >= self.trailing {
            self.stream.write_bit(false);
            let sigbits = 64 - self.leading - self.trailing;
            self.stream.write_bits(delta >> self.trailing, sigbits);
            return;
        }

        self.leading = leading;
        self.trailing = trailing;

        self.stream.write_bit(true);
        self.stream.write_bits(leading as u64, 5);
        let sigbits = 64 - leading - trailing;
        // 64 does not fit in 6 bits and is written as 0
        self.stream.write_bits((sigbits & 0x3f) as u64, 6);
        self.stream.write_bits(delta >> trailing, sigbits);
    }
}

impl ChunkAppender for XorAppender<'_> {
    fn append(&mut self, value: i64) -> Result<(), ChunkError> {
        if self.num >= MAX_SAMPLES_PER_CHUNK {
            return Err(ChunkError::CapacityExceeded {
                limit: MAX_SAMPLES_PER_CHUNK,
            });
        }

        let value = value as u64;
        if self.num == 0 {
            self.stream.write_bits(value, 64);
        } else {
            self.write_delta(value ^ self.prev);
        }

        self.prev = value;
        self.num += 1;
        write_u16(self.stream.bytes_mut(), 0, self.num as u16);
        Ok(())
    }

    fn num_samples(&self) -> usize {
        self.num
    }
}

/// Iterator for XOR chunk bytes
pub struct XorIterator<B> {
    reader: BitReader<B>,
    total: usize,
    read: usize,
    value: u64,
    leading: u8,
    trailing: u8,
    err: Option<ChunkError>,
}

impl<B: AsRef<[u8]>> XorIterator<B> {
    /// Iterate the chunk stored in `data`
    pub fn new(data: B) -> Self {
        let (total, err) = match read_u16(data.as_ref(), 0) {
            Ok(n) => (n as usize, None),
            Err(e) => (0, Some(e)),
        };
        Self {
            reader: BitReader::with_offset(data, HEADER_LEN),
            total,
            read: 0,
            value: 0,
            leading: NO_WINDOW,
            trailing: 0,
            err,
        }
    }

    fn read_value(&mut self) -> Result<u64, ChunkError> {
        if self.read == 0 {
            return self.reader.read_bits(64);
        }
        if !self.reader.read_bit()? {
            return Ok(self.value);
        }

        if self.reader.read_bit()? {
            let leading = self.reader.read_bits(5)? as u8;
            let mut sigbits = self.reader.read_bits(6)? as u8;
            if sigbits == 0 {
                sigbits = 64;
            }
            if leading + sigbits > 64 {
                return Err(ChunkError::Decode(format!(
                    "xor window of {} leading and {} significant bits exceeds 64",
                    leading, sigbits
                )));
            }
            self.leading = leading;
            self.trailing = 64 - leading - sigbits;
        } else if self.leading == NO_WINDOW {
            return Err(ChunkError::Decode(
                "xor window reused before one was declared".to_string(),
            ));
        }

        let sigbits = 64 - self.leading - self.trailing;
        let bits = self.reader.read_bits(sigbits)?;
        Ok(self.value ^ (bits << self.trailing))
    }
}

impl<B: AsRef<[u8]>> Iterator for XorIterator<B> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.err.is_some() || self.read >= self.total {
            return None;
        }
        match self.read_value() {
            Ok(v) => {
                self.value = v;
                self.read += 1;
                Some(v as i64)
            }
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }
}

impl<B: AsRef<[u8]>> ChunkIterator for XorIterator<B> {
    fn num_samples(&self) -> usize {
        self.total
    }

    fn rows_read(&self) -> usize {
        self.read
    }

    fn err(&self) -> Option<&ChunkError> {
        self.err.as_ref()
    }
}
