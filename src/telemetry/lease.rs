//! Lease span helpers.
//!
//! A lease span covers one item from fetch to acknowledge/requeue, so the
//! worker's own spans nest under it when it enters the span.

use tracing::Span;

/// Start a span for a leased work item.
///
/// The `lease.outcome` field is declared empty and filled in by
/// [`record_lease_outcome`].
pub fn start_lease_span(queue: &str, job_id: &str) -> Span {
    tracing::info_span!(
        "lease",
        "lease.queue" = queue,
        "lease.job_id" = job_id,
        "lease.outcome" = tracing::field::Empty,
    )
}

/// Record how the lease ended and emit an event inside its span.
pub fn record_lease_outcome(span: &Span, outcome: &str) {
    span.record("lease.outcome", outcome);
    span.in_scope(|| {
        tracing::info!(outcome = outcome, "lease settled");
    });
}
