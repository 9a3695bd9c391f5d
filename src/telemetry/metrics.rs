//! Metric instrument factories for backlog-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter configured these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("backlog-rs")
}

/// Counter: features created.
/// Labels: `source` ("single" | "bulk").
pub fn features_created() -> Counter<u64> {
    meter()
        .u64_counter("backlog.features.created")
        .with_description("Number of features created")
        .build()
}

/// Counter: feature state transitions.
/// Labels: `from`, `to`.
pub fn feature_transitions() -> Counter<u64> {
    meter()
        .u64_counter("backlog.features.transitions")
        .with_description("Number of feature state transitions")
        .build()
}

/// Counter: failures reported by session drivers.
/// Labels: `threshold_exceeded`.
pub fn feature_failures() -> Counter<u64> {
    meter()
        .u64_counter("backlog.features.failures")
        .with_description("Number of recorded feature failures")
        .build()
}

/// Counter: guarded updates that lost a race.
/// Labels: `operation`.
pub fn feature_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("backlog.features.conflicts")
        .with_description("Number of conflicting feature updates")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("backlog.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
