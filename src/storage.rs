//! Storage instance: one store connection and everything built on it.
//!
//! A `Storage` owns the key space, the notification subscription and the
//! lock owner token for its lifetime. Nothing is process-global; two
//! instances over the same store behave like two separate servers.

use crate::config::StorageOptions;
use crate::error::Result;
use crate::fetch::WorkQueueFetcher;
use crate::keys::{CREATED_AT, KeySpace, STATE, format_timestamp};
use crate::lock::{DistributedLock, LockGuard};
use crate::server::{ServerContext, ServerRegistry};
use crate::signal::NotificationChannel;
use crate::state::StateHandlerRegistry;
use crate::store::{Batch, MemoryStore, Mutation, RedisStore, Store};
use crate::transaction::{JobState, REASON, TransactionalWriter};
use crate::watcher::VisibilityWatcher;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct Storage {
    store: Arc<dyn Store>,
    keys: KeySpace,
    channel: Arc<NotificationChannel>,
    lock_owner: String,
    options: StorageOptions,
}

impl Storage {
    /// Connect to Redis at `url` and open a storage instance on it.
    pub async fn connect(url: &str, options: StorageOptions) -> Result<Self> {
        let store = RedisStore::connect(url).await?;
        Self::open(Arc::new(store), options).await
    }

    /// Open a storage instance over any store backend.
    pub async fn open(store: Arc<dyn Store>, options: StorageOptions) -> Result<Self> {
        let keys = KeySpace::new(options.prefix.clone());
        let channel = NotificationChannel::open(Arc::clone(&store), options.channel.clone()).await?;
        let lock_owner = Uuid::new_v4().to_string();
        info!(
            prefix = %options.prefix,
            channel = %options.channel,
            %lock_owner,
            "storage opened"
        );
        Ok(Self {
            store,
            keys,
            channel: Arc::new(channel),
            lock_owner,
            options,
        })
    }

    /// Storage over a fresh [`MemoryStore`] with default options.
    pub async fn in_memory() -> Result<Self> {
        Self::open(Arc::new(MemoryStore::new()), StorageOptions::default()).await
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn channel(&self) -> &Arc<NotificationChannel> {
        &self.channel
    }

    /// Holder token used by [`acquire_lock`](Self::acquire_lock).
    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn fetcher(&self) -> WorkQueueFetcher {
        WorkQueueFetcher::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            Arc::clone(&self.channel),
            self.options.fetch.clone(),
        )
    }

    /// Start staging a transaction.
    pub fn begin(&self) -> TransactionalWriter {
        TransactionalWriter::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            Some(Arc::clone(&self.channel)),
            self.options.commit_attempts,
        )
    }

    pub fn watcher(&self) -> Result<VisibilityWatcher> {
        VisibilityWatcher::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            self.options.watcher.clone(),
            self.lock_owner.clone(),
        )
    }

    pub fn lock(&self) -> DistributedLock {
        DistributedLock::new(Arc::clone(&self.store), self.keys.clone())
    }

    /// Acquire `resource` on behalf of this instance. Nested calls from the
    /// same instance re-enter.
    pub async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<LockGuard> {
        self.lock().acquire(resource, &self.lock_owner, timeout).await
    }

    /// Acquire `resource` with an explicit holder token.
    pub async fn acquire_lock_as(
        &self,
        resource: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<LockGuard> {
        self.lock().acquire(resource, owner, timeout).await
    }

    /// Create a job record that expires after `expire_in`; returns its id.
    pub async fn create_job<I, K, V>(&self, fields: I, expire_in: Duration) -> Result<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let id = Uuid::new_v4().to_string();
        let key = self.keys.job(&id);
        let mut fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        fields.push((CREATED_AT.to_string(), format_timestamp(Utc::now())));

        let batch = Batch::new()
            .then(Mutation::HashSet {
                key: key.clone(),
                fields,
            })
            .then(Mutation::Expire {
                key,
                ttl: expire_in,
            });
        self.store.execute(&batch).await?;
        Ok(id)
    }

    pub async fn job_fields(&self, job_id: &str) -> Result<HashMap<String, String>> {
        self.store.hgetall(&self.keys.job(job_id)).await
    }

    pub async fn set_job_parameter(&self, job_id: &str, name: &str, value: &str) -> Result<()> {
        self.store.hset(&self.keys.job(job_id), name, value).await
    }

    pub async fn job_parameter(&self, job_id: &str, name: &str) -> Result<Option<String>> {
        self.store.hget(&self.keys.job(job_id), name).await
    }

    /// Push `job_id` onto `queue` and signal waiting fetchers.
    pub async fn enqueue(&self, queue: &str, job_id: &str) -> Result<()> {
        let mut tx = self.begin();
        tx.add_to_queue(queue, job_id);
        tx.commit().await
    }

    /// Move a job to `new_state` if its current state is still `expected`,
    /// running the registered handlers in the same batch.
    pub async fn transition_job(
        &self,
        registry: &StateHandlerRegistry,
        job_id: &str,
        expected: Option<&str>,
        new_state: &JobState,
    ) -> Result<()> {
        let mut tx = self.begin();
        tx.expect_job_state(job_id, expected);
        registry.apply_transition(&mut tx, job_id, expected, new_state);
        tx.commit().await
    }

    /// Known queue names.
    pub async fn queues(&self) -> Result<Vec<String>> {
        self.store.zrange(&self.keys.queues(), 0, -1).await
    }

    pub async fn pending_count(&self, queue: &str) -> Result<u64> {
        self.store.llen(&self.keys.pending(queue)).await
    }

    pub async fn in_flight_count(&self, queue: &str) -> Result<u64> {
        self.store.llen(&self.keys.dequeued(queue)).await
    }

    /// Current state of a job as last written by
    /// [`set_job_state`](TransactionalWriter::set_job_state), or `None` when
    /// the job has no state record.
    pub async fn state_data(&self, job_id: &str) -> Result<Option<JobState>> {
        let mut data = self.store.hgetall(&self.keys.job_state(job_id)).await?;
        if data.is_empty() {
            return Ok(None);
        }
        let recorded = data.remove(STATE);
        let name = match self.store.hget(&self.keys.job(job_id), STATE).await? {
            Some(name) => name,
            None => recorded.unwrap_or_default(),
        };
        let reason = data.remove(REASON);
        Ok(Some(JobState {
            name,
            reason,
            data: data.into_iter().collect(),
        }))
    }

    /// Lowest-scored member of sorted set `name` with a score in
    /// `from..=to`.
    pub async fn first_by_lowest_score(
        &self,
        name: &str,
        from: f64,
        to: f64,
    ) -> Result<Option<String>> {
        let mut first = self
            .store
            .zrangebyscore(&self.keys.key(name), from, to, 1)
            .await?;
        Ok(first.pop())
    }

    pub fn servers(&self) -> ServerRegistry {
        ServerRegistry::new(Arc::clone(&self.store), self.keys.clone())
    }

    pub async fn announce_server(&self, server_id: &str, context: &ServerContext) -> Result<()> {
        self.servers().announce(server_id, context).await
    }

    pub async fn heartbeat(&self, server_id: &str) -> Result<()> {
        self.servers().heartbeat(server_id).await
    }

    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        self.servers().remove(server_id).await
    }

    /// Sweep servers silent for longer than `timeout`; returns the count.
    pub async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<usize> {
        self.servers().remove_timed_out(timeout).await
    }
}
