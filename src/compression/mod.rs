//! Chunk codecs
//!
//! A chunk is an appendable, iterable sequence of `i64` samples for one
//! logical column of a series. Three codecs are provided:
//!
//! - **XOR** ([`xor::XorChunk`]): Gorilla-style XOR of consecutive values, used
//!   for per-node flat/cumulative values
//! - **Delta** ([`delta::DeltaChunk`]): delta-of-delta with unary-prefixed
//!   buckets, used for timestamps
//! - **RLE** ([`rle::RleChunk`]): (value, run length) pairs, used for
//!   near-constant columns such as durations and periods
//!
//! Every chunk's byte layout is a small big-endian header holding the sample
//! count (plus the run count for RLE) followed by the bit-packed payload.
//! Appenders never persist codec state: obtaining one replays the chunk's own
//! iterator to recover the previous value, XOR window, delta or open run.
//!
//! # Example
//!
//! ```rust
//! use kuba_profstore::compression::{new_chunk, Encoding};
//!
//! let mut chunk = new_chunk(Encoding::Xor);
//! {
//!     let mut app = chunk.appender().unwrap();
//!     app.append(10).unwrap();
//!     app.append(12).unwrap();
//! }
//! // Zero-fill so the chunk holds 5 samples, the last one being 7
//! chunk.append_at(5, 7).unwrap();
//!
//! let values: Vec<i64> = chunk.iterator().collect();
//! assert_eq!(values, vec![10, 12, 0, 0, 7]);
//! ```

pub mod bit_stream;
pub mod delta;
pub mod pool;
pub mod rle;
pub mod xor;

use std::fmt;

use bytes::Bytes;

use crate::error::ChunkError;

pub use delta::DeltaChunk;
pub use pool::ChunkPool;
pub use rle::RleChunk;
pub use xor::XorChunk;

/// Maximum number of samples a chunk can hold (u16 sample header)
pub const MAX_SAMPLES_PER_CHUNK: usize = u16::MAX as usize;

/// Spare capacity (bytes) a chunk tolerates before `compact` reallocates
pub const COMPACT_CAPACITY_THRESHOLD: usize = 32;

/// Codec tag of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    /// Gorilla XOR encoding
    Xor = 1,
    /// Delta-of-delta encoding
    Delta = 2,
    /// Run-length encoding
    Rle = 3,
}

impl TryFrom<u8> for Encoding {
    type Error = ChunkError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Encoding::Xor),
            2 => Ok(Encoding::Delta),
            3 => Ok(Encoding::Rle),
            other => Err(ChunkError::InvalidEncoding(other)),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Xor => "xor",
            Encoding::Delta => "delta",
            Encoding::Rle => "rle",
        };
        f.write_str(name)
    }
}

/// An encoded, appendable, iterable column of `i64` samples
pub trait Chunk: Send + Sync + fmt::Debug {
    /// Raw chunk bytes (header followed by payload)
    fn bytes(&self) -> &[u8];

    /// Codec tag
    fn encoding(&self) -> Encoding;

    /// Number of samples, decoded from the header
    fn num_samples(&self) -> usize;

    /// Release over-allocated buffer capacity once writes are expected to stop
    fn compact(&mut self);

    /// Appender resuming after the last stored sample
    ///
    /// Fails if the existing payload cannot be decoded.
    fn appender(&mut self) -> Result<Box<dyn ChunkAppender + '_>, ChunkError>;

    /// Iterator over the stored samples
    fn iterator(&self) -> Box<dyn ChunkIterator + Send + '_>;

    /// Drop all samples, keeping the allocation for reuse
    fn reset(&mut self);

    /// Zero-fill so the chunk ends up holding `num_samples` samples, `value` last
    fn append_at(&mut self, num_samples: usize, value: i64) -> Result<(), ChunkError> {
        self.appender()?.append_at(num_samples, value)
    }
}

/// Writes samples at the tail of a chunk
pub trait ChunkAppender {
    /// Append one sample
    fn append(&mut self, value: i64) -> Result<(), ChunkError>;

    /// Number of samples in the chunk, including those appended so far
    fn num_samples(&self) -> usize;

    /// Append zeros until the chunk holds `num_samples - 1` samples, then `value`
    ///
    /// This keeps sparse columns row-aligned with a dense one: the cost is
    /// linear in the gap.
    fn append_at(&mut self, num_samples: usize, value: i64) -> Result<(), ChunkError> {
        let current = self.num_samples();
        if num_samples <= current {
            return Err(ChunkError::InvalidRowIndex {
                requested: num_samples,
                current,
            });
        }
        if num_samples > MAX_SAMPLES_PER_CHUNK {
            return Err(ChunkError::CapacityExceeded {
                limit: MAX_SAMPLES_PER_CHUNK,
            });
        }
        for _ in current + 1..num_samples {
            self.append(0)?;
        }
        self.append(value)
    }
}

/// Reads samples back from a chunk
///
/// Decode failures end iteration early; check [`ChunkIterator::err`] once
/// `next` has returned `None`.
pub trait ChunkIterator: Iterator<Item = i64> {
    /// Total samples in the chunk
    fn num_samples(&self) -> usize;

    /// Samples consumed so far
    fn rows_read(&self) -> usize;

    /// Error that stopped iteration, if any
    fn err(&self) -> Option<&ChunkError>;

    /// Advance so that the next call to `next` yields row `index`
    ///
    /// Forward only: an index behind the current position returns false
    /// without moving. An index at or past the end returns false and leaves
    /// the iterator exhausted.
    fn seek(&mut self, index: usize) -> bool {
        if index < self.rows_read() {
            return false;
        }
        while self.rows_read() < index {
            if self.next().is_none() {
                return false;
            }
        }
        self.rows_read() < self.num_samples() && self.err().is_none()
    }
}

/// Create an empty chunk for `encoding`
pub fn new_chunk(encoding: Encoding) -> Box<dyn Chunk> {
    match encoding {
        Encoding::Xor => Box::new(XorChunk::new()),
        Encoding::Delta => Box::new(DeltaChunk::new()),
        Encoding::Rle => Box::new(RleChunk::new()),
    }
}

/// Rebuild a chunk from its codec tag and raw bytes
///
/// # Errors
///
/// - `InvalidEncoding` for an unknown tag
/// - `Decode` if `data` is shorter than the codec's header
pub fn chunk_from_data(tag: u8, data: Vec<u8>) -> Result<Box<dyn Chunk>, ChunkError> {
    Ok(match Encoding::try_from(tag)? {
        Encoding::Xor => Box::new(XorChunk::from_data(data)?),
        Encoding::Delta => Box::new(DeltaChunk::from_data(data)?),
        Encoding::Rle => Box::new(RleChunk::from_data(data)?),
    })
}

/// Iterator over a shared, read-only chunk buffer
pub fn new_iterator(encoding: Encoding, data: Bytes) -> Box<dyn ChunkIterator + Send> {
    match encoding {
        Encoding::Xor => Box::new(xor::XorIterator::new(data)),
        Encoding::Delta => Box::new(delta::DeltaIterator::new(data)),
        Encoding::Rle => Box::new(rle::RleIterator::new(data)),
    }
}

/// Read a big-endian u16 header field
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, ChunkError> {
    match bytes.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(ChunkError::Decode(format!(
            "chunk of {} bytes has no header field at offset {}",
            bytes.len(),
            offset
        ))),
    }
}

/// Write a big-endian u16 header field
pub(crate) fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Check that `data` is long enough to hold a `header_len` byte header
pub(crate) fn check_header(data: &[u8], header_len: usize) -> Result<(), ChunkError> {
    if data.len() < header_len {
        return Err(ChunkError::Decode(format!(
            "chunk of {} bytes is shorter than its {} byte header",
            data.len(),
            header_len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_tags() {
        for enc in [Encoding::Xor, Encoding::Delta, Encoding::Rle] {
            assert_eq!(Encoding::try_from(enc as u8).unwrap(), enc);
            assert_eq!(new_chunk(enc).encoding(), enc);
        }
        assert_eq!(Encoding::try_from(0), Err(ChunkError::InvalidEncoding(0)));
        assert_eq!(Encoding::try_from(42), Err(ChunkError::InvalidEncoding(42)));
    }

    #[test]
    fn test_chunk_from_data_rejects_unknown_tag_and_short_data() {
        assert!(matches!(
            chunk_from_data(7, vec![0, 0]),
            Err(ChunkError::InvalidEncoding(7))
        ));
        assert!(matches!(
            chunk_from_data(Encoding::Rle as u8, vec![0, 0]),
            Err(ChunkError::Decode(_))
        ));
    }

    #[test]
    fn test_sparse_append_at() {
        for enc in [Encoding::Xor, Encoding::Delta, Encoding::Rle] {
            let mut chunk = new_chunk(enc);
            {
                let mut app = chunk.appender().unwrap();
                for i in 0..300 {
                    app.append(i + 1).unwrap();
                }
            }
            chunk.append_at(310, 42).unwrap();
            assert_eq!(chunk.num_samples(), 310);

            let values: Vec<i64> = chunk.iterator().collect();
            assert_eq!(values.len(), 310, "{}", enc);
            assert_eq!(values[299], 300);
            assert!(values[300..309].iter().all(|&v| v == 0), "{}", enc);
            assert_eq!(values[309], 42);
        }
    }

    #[test]
    fn test_append_at_rejects_rows_behind_tail() {
        let mut chunk = new_chunk(Encoding::Xor);
        chunk.append_at(3, 1).unwrap();
        assert_eq!(
            chunk.append_at(3, 2),
            Err(ChunkError::InvalidRowIndex {
                requested: 3,
                current: 3
            })
        );
        assert_eq!(chunk.num_samples(), 3);
    }

    #[test]
    fn test_seek_contract() {
        let input: Vec<i64> = (0..50).map(|i| i * i - 7).collect();
        for enc in [Encoding::Xor, Encoding::Delta, Encoding::Rle] {
            let mut chunk = new_chunk(enc);
            {
                let mut app = chunk.appender().unwrap();
                for &v in &input {
                    app.append(v).unwrap();
                }
            }

            for k in [0usize, 1, 17, 49] {
                let mut it = chunk.iterator();
                assert!(it.seek(k), "{} seek {}", enc, k);
                let rest: Vec<i64> = it.collect();
                assert_eq!(rest, input[k..].to_vec(), "{} seek {}", enc, k);
            }

            let mut it = chunk.iterator();
            assert!(!it.seek(50));
            assert_eq!(it.next(), None);

            let mut it = chunk.iterator();
            assert!(!it.seek(1000));
            assert_eq!(it.next(), None);
            assert!(it.err().is_none());
        }
    }

    #[test]
    fn test_new_iterator_over_shared_bytes() {
        let mut chunk = new_chunk(Encoding::Delta);
        {
            let mut app = chunk.appender().unwrap();
            for ts in [1000, 1010, 1020, 1035] {
                app.append(ts).unwrap();
            }
        }
        let data = Bytes::copy_from_slice(chunk.bytes());
        let values: Vec<i64> = new_iterator(Encoding::Delta, data).collect();
        assert_eq!(values, vec![1000, 1010, 1020, 1035]);
    }
}
