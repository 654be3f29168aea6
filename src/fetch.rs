//! Priority fetch across queues.
//!
//! Queues are scanned in the caller's order and the first non-empty one
//! wins. When every queue is empty the fetcher blocks on the notification
//! channel, with an optional poll interval as a backstop for lost publishes.

use crate::error::{Error, Result};
use crate::keys::{FETCHED, KeySpace, format_timestamp};
use crate::lease::InFlightLease;
use crate::signal::NotificationChannel;
use crate::store::Store;
use crate::telemetry::lease::start_lease_span;
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fetcher tuning.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Re-scan the queues this often even without a signal. `None` waits
    /// for signals only.
    pub poll_interval: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Some(Duration::from_secs(30)),
        }
    }
}

pub struct WorkQueueFetcher {
    store: Arc<dyn Store>,
    keys: KeySpace,
    channel: Arc<NotificationChannel>,
    options: FetchOptions,
}

impl WorkQueueFetcher {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        channel: Arc<NotificationChannel>,
        options: FetchOptions,
    ) -> Self {
        Self {
            store,
            keys,
            channel,
            options,
        }
    }

    /// Lease the next item from the highest-priority non-empty queue,
    /// blocking until one is available.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when `cancel` fires while waiting, and
    /// [`Error::InvalidArgument`] for an empty queue list.
    pub async fn fetch_next<S: AsRef<str>>(
        &self,
        queues: &[S],
        cancel: &CancellationToken,
    ) -> Result<InFlightLease> {
        if queues.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one queue name is required".to_string(),
            ));
        }

        let mut waiter = self.channel.waiter();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            waiter.mark_seen();
            if let Some(lease) = self.try_fetch(queues).await? {
                return Ok(lease);
            }

            debug!(queues = queues.len(), "queues empty, waiting for work");
            match self.options.poll_interval {
                Some(interval) => {
                    tokio::select! {
                        waited = waiter.wait(cancel) => waited?,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                None => waiter.wait(cancel).await?,
            }
        }
    }

    /// One pass over `queues` without blocking.
    pub async fn try_fetch<S: AsRef<str>>(&self, queues: &[S]) -> Result<Option<InFlightLease>> {
        for queue in queues {
            let queue = queue.as_ref();
            let moved = self
                .store
                .rpoplpush(&self.keys.pending(queue), &self.keys.dequeued(queue))
                .await?;
            let Some(job_id) = moved else {
                continue;
            };

            let span = start_lease_span(queue, &job_id);
            // Built before stamping: if the stamp fails, dropping the lease
            // puts the item back.
            let lease = InFlightLease::new(
                Arc::clone(&self.store),
                self.keys.clone(),
                job_id.clone(),
                queue.to_string(),
                span.clone(),
            );
            self.store
                .hset(&self.keys.job(&job_id), FETCHED, &format_timestamp(Utc::now()))
                .await?;

            metrics::fetches().add(1, &[KeyValue::new("queue", queue.to_string())]);
            span.in_scope(|| debug!("item leased"));
            return Ok(Some(lease));
        }
        Ok(None)
    }
}
