//! Kuba ProfStore - in-memory storage engine for continuous profiling
//!
//! This library provides the head block of a profile store:
//! - Delta, XOR and run-length chunk codecs over a shared bit stream
//! - Columnar per-series storage of profile call trees
//! - Roaring-bitmap postings with Prometheus-style label matchers
//! - Concurrent appenders and snapshot-isolated readers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compression;
pub mod error;
pub mod index;
pub mod profile;
pub mod storage;
pub mod types;

/// Prometheus metrics for the head
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

// Re-export main types
pub use config::HeadConfig;
pub use error::{Error, Result};
pub use index::{MatchType, Matcher};
pub use profile::{InstantProfile, Profile, ProfileTree, ProfileTreeBuilder, SampleLabels};
pub use storage::{Head, HeadAppender, HeadQuerier};
pub use types::{Label, Labels, ProfileMeta, SeriesId, TimeRange, ValueType};
