//! Visibility watcher: returns abandoned in-flight items to pending.
//!
//! Two timeouts drive recovery. An item stamped `Fetched` is requeued once
//! the stamp is older than the invisibility timeout. An item with no stamp
//! at all (its worker died between the move and the stamp) first gets a
//! `Checked` stamp, and is requeued once that is older than the checked
//! timeout.
//!
//! Every write is conditioned on the flags the pass just read, so any number
//! of watchers can run against the same store.

use crate::error::{Error, Result};
use crate::keys::{CHECKED, FETCHED, KeySpace, format_timestamp, parse_timestamp};
use crate::lease::requeue_batch;
use crate::lock::DistributedLock;
use crate::store::{Batch, Condition, Mutation, Store};
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watcher timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherOptions {
    /// How long a `Fetched` item may stay unacknowledged.
    pub invisibility_timeout: Duration,
    /// Grace period for items that were never stamped `Fetched`.
    pub checked_timeout: Duration,
    /// How long to wait for another watcher's per-queue lock.
    pub lock_timeout: Duration,
    /// Pause between passes in [`VisibilityWatcher::run`].
    pub sleep_interval: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            invisibility_timeout: Duration::from_secs(30 * 60),
            checked_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(60),
            sleep_interval: Duration::from_secs(60),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Queues reconciled.
    pub queues: usize,
    pub requeued: usize,
    pub checked: usize,
    /// In-flight ids left in place because their job record is unreadable.
    pub skipped: usize,
    /// Queues whose reconciliation failed partway; retried next pass.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    Fetched,
    Checked,
}

impl Expiry {
    fn reason(self) -> &'static str {
        match self {
            Expiry::Fetched => "fetched_timeout",
            Expiry::Checked => "checked_timeout",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Keep,
    Stamp,
    Requeue(Expiry),
}

/// True when `raw` is older than `timeout`. Unparseable stamps count as
/// expired.
fn is_expired(now: DateTime<Utc>, raw: &str, timeout: Duration) -> bool {
    match parse_timestamp(raw) {
        Some(at) => (now - at).to_std().is_ok_and(|age| age > timeout),
        None => true,
    }
}

fn decide(
    now: DateTime<Utc>,
    fetched: Option<&str>,
    checked: Option<&str>,
    options: &WatcherOptions,
) -> Verdict {
    match (fetched, checked) {
        (Some(raw), _) if is_expired(now, raw, options.invisibility_timeout) => {
            Verdict::Requeue(Expiry::Fetched)
        }
        (Some(_), _) => Verdict::Keep,
        (None, None) => Verdict::Stamp,
        (None, Some(raw)) if is_expired(now, raw, options.checked_timeout) => {
            Verdict::Requeue(Expiry::Checked)
        }
        (None, Some(_)) => Verdict::Keep,
    }
}

pub struct VisibilityWatcher {
    store: Arc<dyn Store>,
    keys: KeySpace,
    lock: DistributedLock,
    lock_owner: String,
    options: WatcherOptions,
}

impl VisibilityWatcher {
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if any timeout in `options` is zero.
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        options: WatcherOptions,
        lock_owner: impl Into<String>,
    ) -> Result<Self> {
        for (name, value) in [
            ("invisibility timeout", options.invisibility_timeout),
            ("checked timeout", options.checked_timeout),
            ("lock timeout", options.lock_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidArgument(format!("{name} must be positive")));
            }
        }

        Ok(Self {
            lock: DistributedLock::new(Arc::clone(&store), keys.clone()),
            store,
            keys,
            lock_owner: lock_owner.into(),
            options,
        })
    }

    pub fn options(&self) -> &WatcherOptions {
        &self.options
    }

    /// Reconcile every known queue once.
    ///
    /// A queue whose lock is held by another watcher for longer than the
    /// lock timeout is skipped for this pass. A queue that fails is logged
    /// and counted in [`PassReport::failed`]; the remaining queues are still
    /// reconciled.
    ///
    /// # Errors
    ///
    /// Only when the queue registry itself cannot be read.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let queues = self.store.zrange(&self.keys.queues(), 0, -1).await?;
        let mut report = PassReport::default();

        for queue in &queues {
            match self.reconcile_locked(queue, &mut report).await {
                Ok(true) => report.queues += 1,
                Ok(false) => debug!(%queue, "queue busy with another watcher, skipped"),
                Err(e) => {
                    report.failed += 1;
                    error!(%queue, "queue reconciliation failed: {e}");
                }
            }
        }

        Ok(report)
    }

    /// Reconcile `queue` under its lock. `Ok(false)` when the lock was busy.
    async fn reconcile_locked(&self, queue: &str, report: &mut PassReport) -> Result<bool> {
        let resource = KeySpace::dequeued_lock_resource(queue);
        let guard = match self
            .lock
            .acquire(&resource, &self.lock_owner, self.options.lock_timeout)
            .await
        {
            Ok(guard) => guard,
            Err(Error::LockTimeout { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let reconciled = self.reconcile_queue(queue, report).await;
        let released = guard.release().await;
        reconciled?;
        released?;
        Ok(true)
    }

    async fn reconcile_queue(&self, queue: &str, report: &mut PassReport) -> Result<()> {
        let in_flight = self
            .store
            .lrange(&self.keys.dequeued(queue), 0, -1)
            .await?;
        let now = Utc::now();

        for job_id in &in_flight {
            match self.reconcile_item(queue, job_id, now, report).await {
                Ok(()) => {}
                Err(e) if e.is_wrong_type() => {
                    report.skipped += 1;
                    warn!(%queue, %job_id, "job record unreadable, left in flight: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn reconcile_item(
        &self,
        queue: &str,
        job_id: &str,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<()> {
        let job_key = self.keys.job(job_id);
        let mut flags = self
            .store
            .hmget(&job_key, &[FETCHED, CHECKED])
            .await?
            .into_iter();
        let fetched = flags.next().flatten();
        let checked = flags.next().flatten();

        match decide(now, fetched.as_deref(), checked.as_deref(), &self.options) {
            Verdict::Keep => {}
            Verdict::Stamp => {
                let batch = Batch::new()
                    .when(Condition::HashFieldNotExists {
                        key: job_key.clone(),
                        field: FETCHED.to_string(),
                    })
                    .when(Condition::HashFieldNotExists {
                        key: job_key.clone(),
                        field: CHECKED.to_string(),
                    })
                    .then(Mutation::HashSet {
                        key: job_key.clone(),
                        fields: vec![(CHECKED.to_string(), format_timestamp(now))],
                    });
                if self.store.execute(&batch).await? {
                    report.checked += 1;
                    metrics::watcher_checked().add(1, &[KeyValue::new("queue", queue.to_string())]);
                    debug!(%queue, %job_id, "unstamped in-flight item marked checked");
                }
            }
            Verdict::Requeue(expiry) => {
                let mut batch = requeue_batch(&self.keys, queue, job_id);
                match (expiry, fetched, checked) {
                    (Expiry::Fetched, Some(raw), _) => {
                        batch.push_condition(Condition::HashFieldEqual {
                            key: job_key.clone(),
                            field: FETCHED.to_string(),
                            value: raw,
                        });
                    }
                    (Expiry::Checked, _, Some(raw)) => {
                        batch.push_condition(Condition::HashFieldNotExists {
                            key: job_key.clone(),
                            field: FETCHED.to_string(),
                        });
                        batch.push_condition(Condition::HashFieldEqual {
                            key: job_key.clone(),
                            field: CHECKED.to_string(),
                            value: raw,
                        });
                    }
                    _ => {}
                }
                if self.store.execute(&batch).await? {
                    report.requeued += 1;
                    metrics::watcher_requeues().add(
                        1,
                        &[
                            KeyValue::new("queue", queue.to_string()),
                            KeyValue::new("reason", expiry.reason()),
                        ],
                    );
                    warn!(%queue, %job_id, reason = expiry.reason(), "abandoned item requeued");
                }
            }
        }
        Ok(())
    }

    /// Run passes until `cancel` fires. A failed pass is logged and retried
    /// after the usual interval.
    pub async fn run(&self, cancel: &CancellationToken) {
        info!(
            interval_secs = self.options.sleep_interval.as_secs(),
            "visibility watcher started"
        );
        while !cancel.is_cancelled() {
            match self.run_pass().await {
                Ok(report) => debug!(
                    queues = report.queues,
                    requeued = report.requeued,
                    checked = report.checked,
                    skipped = report.skipped,
                    failed = report.failed,
                    "watcher pass complete"
                ),
                Err(e) => error!("watcher pass failed: {e}"),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.sleep_interval) => {}
            }
        }
        info!("visibility watcher stopped");
    }
}
