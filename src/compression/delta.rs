//! Delta-of-delta chunk
//!
//! Profile timestamps arrive at a near-constant scrape interval, so the
//! difference between consecutive deltas is almost always zero:
//!
//! ```text
//! Timestamps:      1000, 1010, 1020, 1030, 1041
//! Deltas:                10,   10,   10,   11
//! Delta-of-delta:               0,    0,    1    <- Highly compressible!
//! ```
//!
//! # Encoding
//!
//! - Sample 0: signed varint
//! - Sample 1: unsigned varint of the delta from sample 0
//! - Sample n >= 2: `dod = delta(n) - delta(n-1)` packed by magnitude:
//!   - `0`: dod == 0
//!   - `10` + 14 bits: dod in [-8191, 8192]
//!   - `110` + 17 bits: dod in [-65535, 65536]
//!   - `1110` + 20 bits: dod in [-524287, 524288]
//!   - `1111` + 64 bits: anything else
//!
//! Fixed-width fields hold the two's complement of dod; the decoder sign
//! extends by subtracting `1 << size` when the raw field exceeds
//! `1 << (size - 1)`. All arithmetic wraps so any `i64` sequence round-trips.

use super::bit_stream::{BitReader, BitWriter};
use super::{
    check_header, read_u16, write_u16, Chunk, ChunkAppender, ChunkIterator, Encoding,
    COMPACT_CAPACITY_THRESHOLD, MAX_SAMPLES_PER_CHUNK,
};
use crate::error::ChunkError;

/// Header: big-endian u16 sample count
const HEADER_LEN: usize = 2;

/// Delta-of-delta encoded chunk
#[derive(Debug, Clone)]
pub struct DeltaChunk {
    stream: BitWriter,
}

impl DeltaChunk {
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

impl Default for DeltaChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunk for DeltaChunk {
    fn bytes(&self) -> &[u8] {
        self.stream.bytes()
    }

    fn encoding(&self) -> Encoding {
        Encoding::Delta
    }

    fn num_samples(&self) -> usize {
        read_u16(self.stream.bytes(), 0).unwrap_or(0) as usize
    }

    fn compact(&mut self) {
        self.stream.compact(COMPACT_CAPACITY_THRESHOLD);
    }

    fn appender(&mut self) -> Result<Box<dyn ChunkAppender + '_>, ChunkError> {
        let mut it = DeltaIterator::new(self.stream.bytes());
        while it.next().is_some() {}
        if let Some(err) = it.err() {
            return Err(err.clone());
        }
        let (num, prev, prev_delta) = (it.read, it.value, it.delta);
        let end = it.reader.bit_offset();

        self.stream.truncate_bits(end);
        Ok(Box::new(DeltaAppender {
            stream: &mut self.stream,
            num,
            prev,
            prev_delta,
        }))
    }

    fn iterator(&self) -> Box<dyn ChunkIterator + Send + '_> {
        Box::new(DeltaIterator::new(self.stream.bytes()))
    }

    fn reset(&mut self) {
        self.stream.reset(HEADER_LEN);
    }
}

/// True if `x` fits the `nbits` wide bucket
fn bit_range(x: i64, nbits: u8) -> bool {
    -((1i64 << (nbits - 1)) - 1) <= x && x <= 1i64 << (nbits - 1)
}

/// Appender for [`DeltaChunk`]
pub struct DeltaAppender<'a> {
    stream: &'a mut BitWriter,
    num: usize,
    prev: i64,
    prev_delta: i64,
}

impl ChunkAppender for DeltaAppender<'_> {
    fn append(&mut self, value: i64) -> Result<(), ChunkError> {
        if self.num >= MAX_SAMPLES_PER_CHUNK {
            return Err(ChunkError::CapacityExceeded {
                limit: MAX_SAMPLES_PER_CHUNK,
            });
        }

        let mut delta = 0;
        match self.num {
            0 => self.stream.write_varint(value),
            1 => {
                delta = value.wrapping_sub(self.prev);
                self.stream.write_uvarint(delta as u64);
            }
            _ => {
                delta = value.wrapping_sub(self.prev);
                let dod = delta.wrapping_sub(self.prev_delta);
                if dod == 0 {
                    self.stream.write_bit(false);
                } else if bit_range(dod, 14) {
                    self.stream.write_bits(0b10, 2);
                    self.stream.write_bits(dod as u64, 14);
                } else if bit_range(dod, 17) {
                    self.stream.write_bits(0b110, 3);
                    self.stream.write_bits(dod as u64, 17);
                } else if bit_range(dod, 20) {
                    self.stream.write_bits(0b1110, 4);
                    self.stream.write_bits(dod as u64, 20);
                } else {
                    self.stream.write_bits(0b1111, 4);
                    self.stream.write_bits(dod as u64, 64);
                }
            }
        }

        self.prev = value;
        self.prev_delta = delta;
        self.num += 1;
        write_u16(self.stream.bytes_mut(), 0, self.num as u16);
        Ok(())
    }

    fn num_samples(&self) -> usize {
        self.num
    }
}

/// Iterator for delta chunk bytes
pub struct DeltaIterator<B> {
    reader: BitReader<B>,
    total: usize,
    read: usize,
    value: i64,
    delta: i64,
    err: Option<ChunkError>,
}

impl<B: AsRef<[u8]>> DeltaIterator<B> {
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
            delta: 0,
            err,
        }
    }

    fn read_dod(&mut self) -> Result<i64, ChunkError> {
        let mut prefix = 0u8;
        for _ in 0..4 {
            prefix <<= 1;
            if !self.reader.read_bit()? {
                break;
            }
            prefix |= 1;
        }

        let size: u8 = match prefix {
            0b0 => return Ok(0),
            0b10 => 14,
            0b110 => 17,
            0b1110 => 20,
            0b1111 => return Ok(self.reader.read_bits(64)? as i64),
            other => {
                return Err(ChunkError::Decode(format!(
                    "invalid delta-of-delta prefix {:#b}",
                    other
                )))
            }
        };

        let bits = self.reader.read_bits(size)?;
        let mut dod = bits as i64;
        if bits > 1 << (size - 1) {
            dod -= 1 << size;
        }
        Ok(dod)
    }

    fn read_value(&mut self) -> Result<(i64, i64), ChunkError> {
        match self.read {
            0 => Ok((self.reader.read_varint()?, 0)),
            1 => {
                let delta = self.reader.read_uvarint()? as i64;
                Ok((self.value.wrapping_add(delta), delta))
            }
            _ => {
                let delta = self.delta.wrapping_add(self.read_dod()?);
                Ok((self.value.wrapping_add(delta), delta))
            }
        }
    }
}

impl<B: AsRef<[u8]>> Iterator for DeltaIterator<B> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.err.is_some() || self.read >= self.total {
            return None;
        }
        match self.read_value() {
            Ok((value, delta)) => {
                self.value = value;
                self.delta = delta;
                self.read += 1;
                Some(value)
            }
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }
}

impl<B: AsRef<[u8]>> ChunkIterator for DeltaIterator<B> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[i64]) -> DeltaChunk {
        let mut chunk = DeltaChunk::new();
        {
            let mut app = chunk.appender().unwrap();
            for &v in values {
                app.append(v).unwrap();
            }
        }
        chunk
    }

    fn decode(chunk: &DeltaChunk) -> Vec<i64> {
        let mut it = chunk.iterator();
        let values: Vec<i64> = it.by_ref().collect();
        assert!(it.err().is_none(), "{:?}", it.err());
        values
    }

    #[test]
    fn test_regular_timestamps_cost_one_bit() {
        let timestamps: Vec<i64> = (0..100).map(|i| 1_700_000_000_000 + i * 10_000).collect();
        let chunk = encode(&timestamps);
        assert_eq!(decode(&chunk), timestamps);
        // varint first value, small varint delta, then 98 zero bits
        assert!(chunk.bytes().len() < 2 + 10 + 3 + 13);
    }

    #[test]
    fn test_every_bucket_boundary() {
        let dods = [
            0i64,
            1,
            -1,
            8192,
            -8191,
            8193,
            -8192,
            65536,
            -65535,
            65537,
            -65536,
            524288,
            -524287,
            524289,
            -524288,
            i64::MAX / 4,
            i64::MIN / 4,
        ];

        let mut values = vec![0i64, 100];
        let mut delta = 100i64;
        for dod in dods {
            delta = delta.wrapping_add(dod);
            let next = values[values.len() - 1].wrapping_add(delta);
            values.push(next);
        }

        let chunk = encode(&values);
        assert_eq!(decode(&chunk), values);
    }

    #[test]
    fn test_bit_range_edges() {
        assert!(bit_range(8192, 14));
        assert!(!bit_range(8193, 14));
        assert!(bit_range(-8191, 14));
        assert!(!bit_range(-8192, 14));
    }

    #[test]
    fn test_decreasing_and_extreme_values() {
        let values = vec![i64::MAX, i64::MIN, 0, -1, 1, i64::MIN, i64::MAX, 5, 5, 5];
        assert_eq!(decode(&encode(&values)), values);
    }

    #[test]
    fn test_resumed_appender_matches_single_pass() {
        let values: Vec<i64> = (0..30).map(|i| i * i * 97 - 3 * i).collect();
        let single = encode(&values);

        let mut resumed = DeltaChunk::new();
        for &v in &values {
            resumed.appender().unwrap().append(v).unwrap();
        }
        assert_eq!(single.bytes(), resumed.bytes());
    }

    #[test]
    fn test_truncated_payload_reports_error() {
        let chunk = encode(&[1, 1_000_000, 3, 5_000_000_000]);
        let data = &chunk.bytes()[..chunk.bytes().len() - 3];
        let mut it = DeltaIterator::new(data);
        let decoded: Vec<i64> = it.by_ref().collect();
        assert!(decoded.len() < 4);
        assert!(matches!(it.err(), Some(ChunkError::Decode(_))));
    }
}
