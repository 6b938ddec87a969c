//! Prometheus metrics for the head
//!
//! Collectors are owned by a [`HeadMetrics`] value and registered into a
//! registry the caller passes in, so several heads (or tests) never collide
//! on a process-wide default registry.
//!
//! # Example
//!
//! ```rust
//! use kuba_profstore::metrics::{gather_metrics, HeadMetrics};
//! use prometheus::Registry;
//!
//! let registry = Registry::new();
//! let metrics = HeadMetrics::register(&registry).unwrap();
//! metrics.record_series_created(1);
//!
//! let text = gather_metrics(&registry).unwrap();
//! assert!(text.contains("profstore_head_series 1"));
//! ```

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Collectors describing one head
#[derive(Debug, Clone)]
pub struct HeadMetrics {
    /// Series created since start
    pub series_created: IntCounter,

    /// Series currently held
    pub series: IntGauge,

    /// Profiles successfully appended
    pub samples_appended: IntCounter,

    /// Appends rejected for a non-increasing timestamp
    pub out_of_order_samples: IntCounter,

    /// Appends rejected for a period/sample type change
    pub schema_mismatches: IntCounter,

    /// Lowest timestamp stored
    pub min_time: IntGauge,

    /// Highest timestamp stored
    pub max_time: IntGauge,

    /// Latency of matcher resolution in `select`
    pub select_duration: Histogram,
}

impl HeadMetrics {
    /// Build collectors without registering them anywhere
    pub fn unregistered() -> Result<Self> {
        Ok(Self {
            series_created: IntCounter::new(
                "profstore_head_series_created_total",
                "Total number of series created in the head",
            )?,
            series: IntGauge::new("profstore_head_series", "Number of series in the head")?,
            samples_appended: IntCounter::new(
                "profstore_head_samples_appended_total",
                "Total number of profiles appended to the head",
            )?,
            out_of_order_samples: IntCounter::new(
                "profstore_head_out_of_order_samples_total",
                "Total number of appends rejected for out of order timestamps",
            )?,
            schema_mismatches: IntCounter::new(
                "profstore_head_schema_mismatch_total",
                "Total number of appends rejected for a period or sample type change",
            )?,
            min_time: IntGauge::new(
                "profstore_head_min_time",
                "Lowest timestamp stored in the head",
            )?,
            max_time: IntGauge::new(
                "profstore_head_max_time",
                "Highest timestamp stored in the head",
            )?,
            select_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "profstore_head_select_duration_seconds",
                    "Time spent resolving matchers for a select in seconds",
                )
                .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]),
            )?,
        })
    }

    /// Build collectors and register them into `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.series_created.clone()))?;
        registry.register(Box::new(metrics.series.clone()))?;
        registry.register(Box::new(metrics.samples_appended.clone()))?;
        registry.register(Box::new(metrics.out_of_order_samples.clone()))?;
        registry.register(Box::new(metrics.schema_mismatches.clone()))?;
        registry.register(Box::new(metrics.min_time.clone()))?;
        registry.register(Box::new(metrics.max_time.clone()))?;
        registry.register(Box::new(metrics.select_duration.clone()))?;
        Ok(metrics)
    }

    /// Record a new series; `total` is the series count afterwards
    #[inline]
    pub fn record_series_created(&self, total: usize) {
        self.series_created.inc();
        self.series.set(total as i64);
    }

    /// Record a successful append and the head's time bounds after it
    #[inline]
    pub fn record_append(&self, min_time: i64, max_time: i64) {
        self.samples_appended.inc();
        self.min_time.set(min_time);
        self.max_time.set(max_time);
    }

    /// Record an out-of-order rejection
    #[inline]
    pub fn record_out_of_order(&self) {
        self.out_of_order_samples.inc();
    }

    /// Record a schema mismatch rejection
    #[inline]
    pub fn record_schema_mismatch(&self) {
        self.schema_mismatches.inc();
    }

    /// Record how long a select spent resolving matchers
    #[inline]
    pub fn observe_select(&self, duration_secs: f64) {
        self.select_duration.observe(duration_secs);
    }
}

/// Get the metrics of `registry` in Prometheus text format
pub fn gather_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];

    encoder.encode(&registry.gather(), &mut buffer)?;

    String::from_utf8(buffer)
        .map_err(|e| Error::Configuration(format!("Metrics contain invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = HeadMetrics::register(&registry).unwrap();
        metrics.record_append(100, 200);
        metrics.record_out_of_order();

        let text = gather_metrics(&registry).unwrap();
        assert!(text.contains("profstore_head_samples_appended_total 1"));
        assert!(text.contains("profstore_head_out_of_order_samples_total 1"));
        assert!(text.contains("profstore_head_max_time 200"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        HeadMetrics::register(&registry).unwrap();
        assert!(matches!(
            HeadMetrics::register(&registry),
            Err(Error::Metrics(_))
        ));
    }

    #[test]
    fn test_separate_registries_are_independent() {
        let a = Registry::new();
        let b = Registry::new();
        let ma = HeadMetrics::register(&a).unwrap();
        HeadMetrics::register(&b).unwrap();

        ma.record_series_created(3);
        assert!(gather_metrics(&a).unwrap().contains("profstore_head_series 3"));
        assert!(gather_metrics(&b).unwrap().contains("profstore_head_series 0"));
    }
}
