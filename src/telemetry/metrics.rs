//! Metric instrument factories for leaseq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"leaseq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for leaseq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("leaseq")
}

/// Counter: successful fetches.
/// Labels: `queue`.
pub fn fetches() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.fetch.count")
        .with_description("Number of work items moved to in-flight")
        .build()
}

/// Counter: how leases ended.
/// Labels: `queue`, `outcome` ("acknowledged" | "requeued" | "abandoned").
pub fn lease_settlements() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.lease.settlements")
        .with_description("Number of settled leases")
        .build()
}

/// Counter: items returned to pending by the watcher.
/// Labels: `queue`, `reason` ("fetched_timeout" | "checked_timeout").
pub fn watcher_requeues() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.watcher.requeues")
        .with_description("In-flight items requeued by the visibility watcher")
        .build()
}

/// Counter: unstamped in-flight items the watcher marked `Checked`.
/// Labels: `queue`.
pub fn watcher_checked() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.watcher.checked")
        .with_description("In-flight items stamped as checked")
        .build()
}

/// Counter: lock acquisition attempts.
/// Labels: `result` ("acquired" | "reentered" | "timeout").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.lock.acquisitions")
        .with_description("Distributed lock acquisition results")
        .build()
}

/// Histogram: time spent waiting for a lock, in milliseconds.
/// Labels: `result`.
pub fn lock_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leaseq.lock.wait_ms")
        .with_description("Time spent acquiring a distributed lock")
        .with_unit("ms")
        .build()
}

/// Counter: transaction commit attempts rejected by a concurrent write.
pub fn transaction_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.transaction.conflicts")
        .with_description("Optimistic transaction commits that hit a conflict")
        .build()
}
