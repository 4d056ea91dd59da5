//! Timing measurements.
//!
//! The limiter reports how long every dispatched call took through a
//! [`MetricsSink`]. Exporting those measurements is up to the sink.

use std::time::Duration;

use tracing::debug;

/// Name of the timing recorded for every dispatched `allow` call.
pub const ALLOW_TIMING: &str = "ratekeeper.allow";

/// Tags attached to a timing measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingTags<'a> {
    pub key: &'a str,
    pub algorithm: &'static str,
    pub rate: u64,
    pub window: u64,
}

/// Receives timing measurements.
pub trait MetricsSink: Send + Sync {
    fn record_timing(&self, name: &'static str, tags: &TimingTags<'_>, elapsed: Duration);
}

/// Discards every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_timing(&self, _name: &'static str, _tags: &TimingTags<'_>, _elapsed: Duration) {}
}

/// Emits every measurement as a `tracing` event on the
/// `ratekeeper::metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_timing(&self, name: &'static str, tags: &TimingTags<'_>, elapsed: Duration) {
        debug!(
            target: "ratekeeper::metrics",
            name,
            key = %tags.key,
            algorithm = tags.algorithm,
            rate = tags.rate,
            window = tags.window,
            elapsed_us = elapsed.as_micros() as u64,
            "timing"
        );
    }
}
