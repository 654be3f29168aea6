//! In-flight leases.
//!
//! A lease is the fetcher's receipt for one id sitting in a queue's
//! in-flight list. Settling it either drops the id (acknowledge) or moves
//! it back to pending (requeue); both clear `Fetched` and `Checked` in the
//! same atomic batch. An unsettled lease requeues itself when dropped.

use crate::error::Result;
use crate::keys::{CHECKED, FETCHED, KeySpace};
use crate::store::{Batch, Mutation, Store};
use crate::telemetry::lease::record_lease_outcome;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{Span, debug, warn};

fn clear_in_flight(batch: &mut Batch, keys: &KeySpace, queue: &str, job_id: &str) {
    batch.push_mutation(Mutation::ListRemove {
        key: keys.dequeued(queue),
        count: 1,
        value: job_id.to_string(),
    });
    for field in [FETCHED, CHECKED] {
        batch.push_mutation(Mutation::HashDelete {
            key: keys.job(job_id),
            field: field.to_string(),
        });
    }
}

/// Batch that removes `job_id` from in-flight and clears its flags.
pub(crate) fn acknowledge_batch(keys: &KeySpace, queue: &str, job_id: &str) -> Batch {
    let mut batch = Batch::new();
    clear_in_flight(&mut batch, keys, queue, job_id);
    batch
}

/// Batch that moves `job_id` from in-flight back to pending.
///
/// The id is pushed on the end the fetcher pops from, so it is the next
/// one handed out for that queue.
pub(crate) fn requeue_batch(keys: &KeySpace, queue: &str, job_id: &str) -> Batch {
    let mut batch = Batch::new().then(Mutation::ListRightPush {
        key: keys.pending(queue),
        value: job_id.to_string(),
    });
    clear_in_flight(&mut batch, keys, queue, job_id);
    batch
}

/// A work item leased to this worker.
pub struct InFlightLease {
    store: Arc<dyn Store>,
    keys: KeySpace,
    job_id: String,
    queue: String,
    span: Span,
    settled: bool,
}

impl InFlightLease {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        job_id: String,
        queue: String,
        span: Span,
    ) -> Self {
        Self {
            store,
            keys,
            job_id,
            queue,
            span,
            settled: false,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Span covering this lease. Enter it to nest processing spans.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// True once acknowledged or requeued.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Mark the item done: remove it from in-flight and clear its flags.
    ///
    /// No-op if the lease is already settled. On error the lease stays
    /// unsettled and may be retried.
    pub async fn acknowledge(&mut self) -> Result<()> {
        if self.settled {
            return Ok(());
        }
        let batch = acknowledge_batch(&self.keys, &self.queue, &self.job_id);
        self.store.execute(&batch).await?;
        self.settle("acknowledged");
        Ok(())
    }

    /// Return the item to the pending list.
    pub async fn requeue(&mut self) -> Result<()> {
        if self.settled {
            return Ok(());
        }
        let batch = requeue_batch(&self.keys, &self.queue, &self.job_id);
        self.store.execute(&batch).await?;
        self.settle("requeued");
        Ok(())
    }

    fn settle(&mut self, outcome: &'static str) {
        self.settled = true;
        record_settlement(&self.span, &self.queue, outcome);
    }
}

fn record_settlement(span: &Span, queue: &str, outcome: &'static str) {
    metrics::lease_settlements().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
    record_lease_outcome(span, outcome);
}

impl std::fmt::Debug for InFlightLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightLease")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                job_id = %self.job_id,
                queue = %self.queue,
                "lease dropped outside a runtime, the watcher will requeue it"
            );
            return;
        };
        let store = Arc::clone(&self.store);
        let batch = requeue_batch(&self.keys, &self.queue, &self.job_id);
        let span = self.span.clone();
        let queue = std::mem::take(&mut self.queue);
        let job_id = std::mem::take(&mut self.job_id);
        runtime.spawn(async move {
            match store.execute(&batch).await {
                Ok(_) => {
                    debug!(%job_id, %queue, "abandoned lease requeued");
                    record_settlement(&span, &queue, "abandoned");
                }
                Err(e) => {
                    warn!(%job_id, %queue, "requeue of abandoned lease failed, the watcher will retry: {e}")
                }
            }
        });
    }
}
