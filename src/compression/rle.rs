//! Run-length encoded chunk
//!
//! Durations and sampling periods are nearly constant for a series, so they
//! are stored as `(value, length)` runs:
//!
//! ```text
//! Samples: 10s 10s 10s 10s 15s 15s
//! Runs:    (10s, 4) (15s, 2)
//! ```
//!
//! # Encoding
//!
//! - Header: big-endian u16 sample count, big-endian u16 run count
//! - Each run: signed varint value followed by a 16-bit run length
//!
//! Appending the value of the open run rewrites its length field in place;
//! only a new value (or a full run) costs another varint. A run is capped at
//! `u16::MAX` samples.

use super::bit_stream::{BitReader, BitWriter};
use super::{
    check_header, read_u16, write_u16, Chunk, ChunkAppender, ChunkIterator, Encoding,
    COMPACT_CAPACITY_THRESHOLD, MAX_SAMPLES_PER_CHUNK,
};
use crate::error::ChunkError;

/// Header: u16 sample count + u16 run count
const HEADER_LEN: usize = 4;

/// Width of a run's length field
const RUN_LENGTH_BITS: u8 = 16;

/// Longest run a single length field can describe
const MAX_RUN_LENGTH: usize = u16::MAX as usize;

/// Run-length encoded chunk
#[derive(Debug, Clone)]
pub struct RleChunk {
    stream: BitWriter,
}

impl RleChunk {
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

    /// Number of runs, decoded from the header
    pub fn num_runs(&self) -> usize {
        read_u16(self.stream.bytes(), 2).unwrap_or(0) as usize
    }

    fn rle_appender(&mut self) -> Result<RleAppender<'_>, ChunkError> {
        let mut it = RleIterator::new(self.stream.bytes());
        let total = it.total;
        it.seek(total);
        if let Some(err) = it.err() {
            return Err(err.clone());
        }
        let num = it.read;
        let runs = it.runs_read;
        let last_value = it.value;
        let last_len = it.run_len;
        let last_len_offset = it.len_offset;
        let end = it.reader.bit_offset();

        self.stream.truncate_bits(end);
        Ok(RleAppender {
            stream: &mut self.stream,
            num,
            runs,
            last_value,
            last_len,
            last_len_offset,
        })
    }
}

impl Default for RleChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunk for RleChunk {
    fn bytes(&self) -> &[u8] {
        self.stream.bytes()
    }

    fn encoding(&self) -> Encoding {
        Encoding::Rle
    }

    fn num_samples(&self) -> usize {
        read_u16(self.stream.bytes(), 0).unwrap_or(0) as usize
    }

    fn compact(&mut self) {
        self.stream.compact(COMPACT_CAPACITY_THRESHOLD);
    }

    fn appender(&mut self) -> Result<Box<dyn ChunkAppender + '_>, ChunkError> {
        Ok(Box::new(self.rle_appender()?))
    }

    fn iterator(&self) -> Box<dyn ChunkIterator + Send + '_> {
        Box::new(RleIterator::new(self.stream.bytes()))
    }

    fn reset(&mut self) {
        self.stream.reset(HEADER_LEN);
    }

    fn append_at(&mut self, num_samples: usize, value: i64) -> Result<(), ChunkError> {
        self.rle_appender()?.append_at(num_samples, value)
    }
}

/// Appender for [`RleChunk`]
pub struct RleAppender<'a> {
    stream: &'a mut BitWriter,
    num: usize,
    runs: usize,
    last_value: i64,
    last_len: usize,
    /// Bit offset of the open run's length field
    last_len_offset: usize,
}

impl RleAppender<'_> {
    /// Append `count` copies of `value`
    pub fn append_run(&mut self, value: i64, count: usize) -> Result<(), ChunkError> {
        if self.num + count > MAX_SAMPLES_PER_CHUNK {
            return Err(ChunkError::CapacityExceeded {
                limit: MAX_SAMPLES_PER_CHUNK,
            });
        }

        let mut left = count;
        while left > 0 {
            if self.runs > 0 && self.last_value == value && self.last_len < MAX_RUN_LENGTH {
                let step = left.min(MAX_RUN_LENGTH - self.last_len);
                self.last_len += step;
                self.stream.set_bits_at(
                    self.last_len_offset,
                    self.last_len as u64,
                    RUN_LENGTH_BITS,
                );
                self.num += step;
                left -= step;
            } else {
                let step = left.min(MAX_RUN_LENGTH);
                self.stream.write_varint(value);
                self.last_len_offset = self.stream.bit_len();
                self.stream.write_bits(step as u64, RUN_LENGTH_BITS);
                self.last_value = value;
                self.last_len = step;
                self.runs += 1;
                self.num += step;
                left -= step;
            }
        }

        write_u16(self.stream.bytes_mut(), 0, self.num as u16);
        write_u16(self.stream.bytes_mut(), 2, self.runs as u16);
        Ok(())
    }

    /// Number of runs written so far
    pub fn num_runs(&self) -> usize {
        self.runs
    }
}

impl ChunkAppender for RleAppender<'_> {
    fn append(&mut self, value: i64) -> Result<(), ChunkError> {
        self.append_run(value, 1)
    }

    fn num_samples(&self) -> usize {
        self.num
    }

    /// The gap is written as a single zero run
    fn append_at(&mut self, num_samples: usize, value: i64) -> Result<(), ChunkError> {
        if num_samples <= self.num {
            return Err(ChunkError::InvalidRowIndex {
                requested: num_samples,
                current: self.num,
            });
        }
        if num_samples > MAX_SAMPLES_PER_CHUNK {
            return Err(ChunkError::CapacityExceeded {
                limit: MAX_SAMPLES_PER_CHUNK,
            });
        }
        let gap = num_samples - self.num - 1;
        if gap > 0 {
            self.append_run(0, gap)?;
        }
        self.append_run(value, 1)
    }
}

/// Iterator for RLE chunk bytes
pub struct RleIterator<B> {
    reader: BitReader<B>,
    total: usize,
    runs: usize,
    read: usize,
    runs_read: usize,
    value: i64,
    /// Stored length of the current run
    run_len: usize,
    /// Samples of the current run not yet yielded
    run_left: usize,
    len_offset: usize,
    err: Option<ChunkError>,
}

impl<B: AsRef<[u8]>> RleIterator<B> {
    /// Iterate the chunk stored in `data`
    pub fn new(data: B) -> Self {
        let header = read_u16(data.as_ref(), 0).and_then(|total| {
            read_u16(data.as_ref(), 2).map(|runs| (total as usize, runs as usize))
        });
        let (total, runs, err) = match header {
            Ok((total, runs)) => (total, runs, None),
            Err(e) => (0, 0, Some(e)),
        };
        Self {
            reader: BitReader::with_offset(data, HEADER_LEN),
            total,
            runs,
            read: 0,
            runs_read: 0,
            value: 0,
            run_len: 0,
            run_left: 0,
            len_offset: 0,
            err,
        }
    }

    /// Number of runs declared in the header
    pub fn num_runs(&self) -> usize {
        self.runs
    }

    fn read_run(&mut self) -> Result<(), ChunkError> {
        if self.runs_read >= self.runs {
            return Err(ChunkError::Decode(format!(
                "rle chunk declares {} samples but its {} runs end at {}",
                self.total, self.runs, self.read
            )));
        }
        let value = self.reader.read_varint()?;
        let len_offset = self.reader.bit_offset();
        let stored = self.reader.read_bits(RUN_LENGTH_BITS)? as usize;

        // an appender may bump the header before rewriting the open run's
        // length, so the last run always covers what the header declares
        let len = if self.runs_read + 1 == self.runs {
            self.total - self.read
        } else {
            stored
        };
        if len == 0 {
            return Err(ChunkError::Decode(format!(
                "rle run {} has zero length",
                self.runs_read
            )));
        }

        self.value = value;
        self.run_len = len;
        self.run_left = len.min(self.total - self.read);
        self.len_offset = len_offset;
        self.runs_read += 1;
        Ok(())
    }
}

impl<B: AsRef<[u8]>> Iterator for RleIterator<B> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.err.is_some() || self.read >= self.total {
            return None;
        }
        if self.run_left == 0 {
            if let Err(e) = self.read_run() {
                self.err = Some(e);
                return None;
            }
        }
        self.run_left -= 1;
        self.read += 1;
        Some(self.value)
    }
}

impl<B: AsRef<[u8]>> ChunkIterator for RleIterator<B> {
    fn num_samples(&self) -> usize {
        self.total
    }

    fn rows_read(&self) -> usize {
        self.read
    }

    fn err(&self) -> Option<&ChunkError> {
        self.err.as_ref()
    }

    /// Skips whole runs without yielding their samples
    fn seek(&mut self, index: usize) -> bool {
        if index < self.read {
            return false;
        }
        while self.err.is_none() && self.read < index && self.read < self.total {
            if self.run_left == 0 {
                if let Err(e) = self.read_run() {
                    self.err = Some(e);
                    break;
                }
            }
            let step = self.run_left.min(index - self.read);
            self.run_left -= step;
            self.read += step;
        }
        self.read == index && self.read < self.total && self.err.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[i64]) -> RleChunk {
        let mut chunk = RleChunk::new();
        {
            let mut app = chunk.appender().unwrap();
            for &v in values {
                app.append(v).unwrap();
            }
        }
        chunk
    }

    #[test]
    fn test_runs_collapse() {
        let values = vec![10, 10, 10, 10, 15, 15, -3, 10];
        let chunk = encode(&values);
        assert_eq!(chunk.num_samples(), 8);
        assert_eq!(chunk.num_runs(), 4);

        let decoded: Vec<i64> = chunk.iterator().collect();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_constant_column_is_one_run() {
        let chunk = encode(&[10_000_000_000; 1000]);
        assert_eq!(chunk.num_runs(), 1);
        // header + varint(10e9) (5 bytes) + 2 byte length
        assert_eq!(chunk.bytes().len(), HEADER_LEN + 5 + 2);
    }

    #[test]
    fn test_resumed_appender_extends_open_run() {
        let mut chunk = RleChunk::new();
        for v in [5, 5, 5, 6, 6] {
            chunk.appender().unwrap().append(v).unwrap();
        }
        assert_eq!(chunk.num_runs(), 2);
        assert_eq!(chunk.bytes(), encode(&[5, 5, 5, 6, 6]).bytes());
    }

    #[test]
    fn test_run_split_at_length_limit() {
        let mut chunk = RleChunk::new();
        chunk.rle_appender().unwrap().append_run(1, MAX_RUN_LENGTH).unwrap();
        assert_eq!(chunk.num_runs(), 1);
        assert_eq!(
            chunk.append_at(MAX_RUN_LENGTH + 1, 1),
            Err(ChunkError::CapacityExceeded {
                limit: MAX_SAMPLES_PER_CHUNK
            })
        );

        let mut chunk = RleChunk::new();
        {
            let mut app = chunk.rle_appender().unwrap();
            app.append_run(1, 100).unwrap();
            app.append_run(1, MAX_RUN_LENGTH - 100).unwrap();
            assert_eq!(app.num_runs(), 1);
        }
        assert_eq!(chunk.num_samples(), MAX_SAMPLES_PER_CHUNK);
    }

    #[test]
    fn test_sparse_append_at_writes_zero_run() {
        let mut chunk = encode(&[7, 7]);
        chunk.append_at(1000, 9).unwrap();
        assert_eq!(chunk.num_samples(), 1000);
        // (7,2) (0,997) (9,1)
        assert_eq!(chunk.num_runs(), 3);

        let values: Vec<i64> = chunk.iterator().collect();
        assert_eq!(values.len(), 1000);
        assert_eq!(&values[..2], &[7, 7]);
        assert!(values[2..999].iter().all(|&v| v == 0));
        assert_eq!(values[999], 9);
    }

    #[test]
    fn test_seek_skips_runs() {
        let mut chunk = RleChunk::new();
        {
            let mut app = chunk.rle_appender().unwrap();
            app.append_run(1, 500).unwrap();
            app.append_run(2, 500).unwrap();
            app.append_run(3, 500).unwrap();
        }

        let mut it = chunk.iterator();
        assert!(it.seek(499));
        assert_eq!(it.next(), Some(1));
        assert_eq!(it.next(), Some(2));
        assert!(it.seek(1000));
        assert_eq!(it.next(), Some(3));
        assert!(!it.seek(10));
        assert_eq!(it.rows_read(), 1001);
    }

    #[test]
    fn test_last_run_length_follows_header() {
        let chunk = encode(&[1, 1, 2]);
        let mut data = chunk.bytes().to_vec();
        // header already counts a sample whose run length is not yet rewritten
        write_u16(&mut data, 0, 4);

        let mut it = RleIterator::new(data.as_slice());
        let decoded: Vec<i64> = it.by_ref().collect();
        assert_eq!(decoded, vec![1, 1, 2, 2]);
        assert!(it.err().is_none());

        // resuming on such bytes extends the same run
        let mut chunk = RleChunk::from_data(data).unwrap();
        chunk.appender().unwrap().append(2).unwrap();
        assert_eq!(chunk.num_runs(), 2);
        let decoded: Vec<i64> = chunk.iterator().collect();
        assert_eq!(decoded, vec![1, 1, 2, 2, 2]);
        assert_eq!(chunk.bytes(), encode(&[1, 1, 2, 2, 2]).bytes());
    }

    #[test]
    fn test_missing_run_reports_error() {
        let chunk = encode(&[1, 1, 2]);
        let mut data = chunk.bytes().to_vec();
        // declare a third run the payload does not hold
        write_u16(&mut data, 0, 5);
        write_u16(&mut data, 2, 3);

        let mut it = RleIterator::new(data.as_slice());
        let decoded: Vec<i64> = it.by_ref().collect();
        assert_eq!(decoded, vec![1, 1, 2]);
        assert!(matches!(it.err(), Some(ChunkError::Decode(_))));
    }
}
