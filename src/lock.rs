//! Reentrant distributed lock.
//!
//! A lock is two keys: `<prefix><resource>` holds the holder token and
//! `<prefix><resource>:c` counts nested acquisitions. Both carry the TTL of
//! the most generous acquisition so a crashed holder frees the resource on
//! its own.
//!
//! The lock hands out no fencing token. A holder that stalls past its TTL
//! and then resumes can overlap with the next holder; protected sections
//! that cannot tolerate that must fence their own writes.

use crate::error::{Error, Result};
use crate::keys::KeySpace;
use crate::store::{Batch, Condition, Mutation, Store};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(8);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Randomized, capped exponential delay for the given retry attempt.
fn backoff(attempt: u32) -> Duration {
    let ceiling = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(BACKOFF_MAX);
    let factor: f64 = rand::rng().random_range(0.5..=1.0);
    ceiling.mul_f64(factor)
}

/// The keys and holder of one lock.
#[derive(Debug, Clone)]
struct Held {
    resource: String,
    key: String,
    counter: String,
    owner: String,
}

/// Acquires named locks against a store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Block until `owner` holds `resource` or `timeout` elapses.
    ///
    /// The lock's TTL is `timeout`. If `owner` already holds the lock the
    /// call re-enters it: the counter goes up and the TTL is raised to
    /// `timeout` if that is longer than what remains.
    pub async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<LockGuard> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "lock timeout must be positive".to_string(),
            ));
        }

        let held = Held {
            resource: resource.to_string(),
            key: self.keys.lock(resource),
            counter: self.keys.lock_counter(resource),
            owner: owner.to_string(),
        };
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempt: u32 = 0;

        loop {
            if self.try_create(&held, timeout).await? {
                record_acquisition("acquired", started);
                debug!(resource, "lock acquired");
                return Ok(LockGuard::new(Arc::clone(&self.store), held));
            }
            if self.try_reenter(&held, timeout).await? {
                record_acquisition("reentered", started);
                debug!(resource, "lock re-entered");
                return Ok(LockGuard::new(Arc::clone(&self.store), held));
            }

            let now = Instant::now();
            if now >= deadline {
                record_acquisition("timeout", started);
                return Err(Error::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(backoff(attempt).min(deadline - now)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn try_create(&self, held: &Held, ttl: Duration) -> Result<bool> {
        // The counter is set, not incremented, so a stale counter left by an
        // expired holder cannot skew the new one.
        let batch = Batch::new()
            .when(Condition::KeyNotExists(held.key.clone()))
            .then(Mutation::Set {
                key: held.key.clone(),
                value: held.owner.clone(),
                ttl: Some(ttl),
            })
            .then(Mutation::Set {
                key: held.counter.clone(),
                value: "1".to_string(),
                ttl: Some(ttl),
            });
        self.store.execute(&batch).await
    }

    async fn try_reenter(&self, held: &Held, requested: Duration) -> Result<bool> {
        let holder = self.store.get(&held.key).await?;
        if holder.as_deref() != Some(held.owner.as_str()) {
            return Ok(false);
        }

        let mut batch = Batch::new()
            .when(Condition::StringEqual {
                key: held.key.clone(),
                value: held.owner.clone(),
            })
            .then(Mutation::IncrBy {
                key: held.counter.clone(),
                delta: 1,
            });
        // Only ever extend. A persistent key (no TTL) is left as is.
        if let Some(remaining) = self.store.ttl(&held.key).await? {
            let ttl = remaining.max(requested);
            batch.push_mutation(Mutation::Expire {
                key: held.key.clone(),
                ttl,
            });
            batch.push_mutation(Mutation::Expire {
                key: held.counter.clone(),
                ttl,
            });
        }
        self.store.execute(&batch).await
    }
}

fn record_acquisition(result: &'static str, started: Instant) {
    let labels = [KeyValue::new("result", result)];
    metrics::lock_acquisitions().add(1, &labels);
    metrics::lock_wait_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);
}

/// Decrement the counter and delete both keys once it reaches zero.
///
/// Every write is conditioned on the holder token, so releasing a lock that
/// already expired (and maybe passed to someone else) changes nothing.
async fn release_held(store: &dyn Store, held: &Held) -> Result<()> {
    let holder_matches = Condition::StringEqual {
        key: held.key.clone(),
        value: held.owner.clone(),
    };

    let decremented = store
        .execute(
            &Batch::new()
                .when(holder_matches.clone())
                .then(Mutation::IncrBy {
                    key: held.counter.clone(),
                    delta: -1,
                }),
        )
        .await?;
    if !decremented {
        debug!(resource = %held.resource, "lock no longer held by this owner, release skipped");
        return Ok(());
    }

    let remaining = store.get(&held.counter).await?;
    let count = remaining
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(0);
    if count > 0 {
        return Ok(());
    }

    let mut batch = Batch::new().when(holder_matches);
    if let Some(raw) = remaining {
        batch.push_condition(Condition::StringEqual {
            key: held.counter.clone(),
            value: raw,
        });
    }
    batch.push_mutation(Mutation::Delete(held.key.clone()));
    batch.push_mutation(Mutation::Delete(held.counter.clone()));
    if store.execute(&batch).await? {
        debug!(resource = %held.resource, "lock released");
    }
    Ok(())
}

/// A held lock. Release it with [`LockGuard::release`]; dropping the guard
/// releases it in the background.
pub struct LockGuard {
    store: Arc<dyn Store>,
    held: Held,
    released: bool,
}

impl LockGuard {
    fn new(store: Arc<dyn Store>, held: Held) -> Self {
        Self {
            store,
            held,
            released: false,
        }
    }

    pub fn resource(&self) -> &str {
        &self.held.resource
    }

    pub fn owner(&self) -> &str {
        &self.held.owner
    }

    /// Release one level of the lock.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_held(self.store.as_ref(), &self.held).await
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.held.resource)
            .field("owner", &self.held.owner)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                resource = %self.held.resource,
                "lock guard dropped outside a runtime, lock will lapse at its TTL"
            );
            return;
        };
        let store = Arc::clone(&self.store);
        let held = self.held.clone();
        runtime.spawn(async move {
            if let Err(e) = release_held(store.as_ref(), &held).await {
                warn!(resource = %held.resource, "background lock release failed: {e}");
            }
        });
    }
}
