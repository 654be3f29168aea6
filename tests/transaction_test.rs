//! Integration tests for the transactional writer.

use leaseq::config::StorageOptions;
use leaseq::error::{Error, Result};
use leaseq::keys::{CREATED_AT, STATE};
use leaseq::storage::Storage;
use leaseq::store::{Batch, MemoryStore, Store, Subscription};
use leaseq::transaction::JobState;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reports a conflict for the first `conflicts` batches, then delegates.
struct Flaky {
    inner: MemoryStore,
    conflicts: u32,
    executes: AtomicU32,
}

impl Flaky {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts,
            executes: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Store for Flaky {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.ttl(key).await
    }
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.inner.hget(key, field).await
    }
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        self.inner.hmget(key, fields).await
    }
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.inner.hset(key, field, value).await
    }
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.inner.lrange(key, start, stop).await
    }
    async fn llen(&self, key: &str) -> Result<u64> {
        self.inner.llen(key).await
    }
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.inner.zrange(key, start, stop).await
    }
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.inner.zrangebyscore(key, min, max, limit).await
    }
    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.smembers(key).await
    }
    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        self.inner.rpoplpush(source, destination).await
    }
    async fn execute(&self, batch: &Batch) -> Result<bool> {
        let n = self.executes.fetch_add(1, Ordering::SeqCst);
        if n < self.conflicts {
            return Ok(false);
        }
        self.inner.execute(batch).await
    }
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.inner.publish(channel, message).await
    }
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.inner.subscribe(channel).await
    }
}

async fn storage_over(store: Arc<dyn Store>) -> Storage {
    Storage::open(store, StorageOptions::default())
        .await
        .expect("failed to open storage")
}

// ---------------------------------------------------------------------------
// Retry bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_conflicts_are_retried() {
    let store = Arc::new(Flaky::new(2));
    let storage = storage_over(store.clone()).await;

    let mut tx = storage.begin();
    tx.increment_counter("stats:succeeded");
    tx.commit().await.unwrap();

    assert_eq!(store.executes.load(Ordering::SeqCst), 3);
    assert_eq!(
        store.inner.get("hangfire:stats:succeeded").await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn persistent_conflict_fails_after_three_attempts() {
    let store = Arc::new(Flaky::new(u32::MAX));
    let storage = storage_over(store.clone()).await;

    let mut tx = storage.begin();
    tx.increment_counter("stats:succeeded");
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, Error::CommitConflict { attempts: 3 }));
    assert_eq!(store.executes.load(Ordering::SeqCst), 3);
    assert_eq!(store.inner.get("hangfire:stats:succeeded").await.unwrap(), None);
}

#[tokio::test]
async fn changed_watched_value_rejects_the_whole_batch() {
    let storage = Storage::in_memory().await.unwrap();
    let mut setup = storage.begin();
    setup.increment_counter("version");
    setup.commit().await.unwrap();

    let mut tx = storage.begin();
    tx.watch_value("version", Some("0"))
        .add_to_queue("default", "job-1")
        .insert_to_list("audit", "job-1");
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, Error::CommitConflict { .. }));
    assert_eq!(storage.pending_count("default").await.unwrap(), 0);
    assert!(storage.queues().await.unwrap().is_empty());
}

#[tokio::test]
async fn matching_watch_commits() {
    let storage = Storage::in_memory().await.unwrap();
    storage.set_job_parameter("job-1", STATE, "Enqueued").await.unwrap();

    let mut tx = storage.begin();
    tx.watch_value("missing", None)
        .watch_hash_field("job:job-1", STATE, Some("Enqueued"))
        .insert_to_list("audit", "ok");
    tx.commit().await.unwrap();

    let audit = storage.keys().key("audit");
    assert_eq!(storage.store().llen(&audit).await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Signal ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signal_is_sent_only_after_a_successful_commit() {
    let store = Arc::new(Flaky::new(3));
    let storage = storage_over(store).await;
    let cancel = CancellationToken::new();
    let mut waiter = storage.channel().waiter();
    waiter.mark_seen();

    let mut tx = storage.begin();
    tx.add_to_queue("default", "job-1");
    assert!(tx.commit().await.is_err());
    let silent = tokio::time::timeout(Duration::from_millis(100), waiter.wait(&cancel)).await;
    assert!(silent.is_err(), "a failed commit must not signal");

    let mut tx = storage.begin();
    tx.add_to_queue("default", "job-1");
    tx.commit().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter.wait(&cancel))
        .await
        .expect("successful commit did not signal")
        .unwrap();
}

#[tokio::test]
async fn add_to_queue_registers_the_queue() {
    let storage = Storage::in_memory().await.unwrap();
    let mut tx = storage.begin();
    tx.add_to_queue("critical", "a").add_to_queue("default", "b");
    assert_eq!(tx.len(), 4);
    tx.commit().await.unwrap();

    assert_eq!(storage.queues().await.unwrap(), vec!["critical", "default"]);
}

// ---------------------------------------------------------------------------
// Job records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn set_job_state_writes_state_and_history() {
    let storage = Storage::in_memory().await.unwrap();
    let state = JobState::new("Failed")
        .with_reason("boom")
        .with_data("ExceptionType", "Timeout");

    let mut tx = storage.begin();
    tx.set_job_state("job-1", &state);
    tx.commit().await.unwrap();

    assert_eq!(
        storage.job_parameter("job-1", STATE).await.unwrap().as_deref(),
        Some("Failed")
    );

    let keys = storage.keys();
    let current = storage.store().hgetall(&keys.job_state("job-1")).await.unwrap();
    assert_eq!(current.get(STATE).map(String::as_str), Some("Failed"));
    assert_eq!(current.get("Reason").map(String::as_str), Some("boom"));
    assert_eq!(current.get("ExceptionType").map(String::as_str), Some("Timeout"));

    let history = storage
        .store()
        .lrange(&keys.job_history("job-1"), 0, -1)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(&history[0]).unwrap();
    assert_eq!(entry[STATE], "Failed");
    assert_eq!(entry["Reason"], "boom");
    assert!(entry[CREATED_AT].is_string());
}

#[tokio::test]
async fn set_job_state_replaces_previous_state_data() {
    let storage = Storage::in_memory().await.unwrap();
    let mut tx = storage.begin();
    tx.set_job_state("job-1", &JobState::new("Failed").with_data("Exception", "x"));
    tx.set_job_state("job-1", &JobState::new("Enqueued"));
    tx.commit().await.unwrap();

    let keys = storage.keys();
    let current = storage.store().hgetall(&keys.job_state("job-1")).await.unwrap();
    assert!(!current.contains_key("Exception"));
    assert_eq!(
        storage.store().llen(&keys.job_history("job-1")).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn state_data_reads_back_the_current_state() {
    let storage = Storage::in_memory().await.unwrap();
    assert_eq!(storage.state_data("job-1").await.unwrap(), None);

    let state = JobState::new("Failed")
        .with_reason("boom")
        .with_data("ExceptionType", "Timeout");
    let mut tx = storage.begin();
    tx.set_job_state("job-1", &JobState::new("Processing"))
        .set_job_state("job-1", &state);
    tx.commit().await.unwrap();

    assert_eq!(storage.state_data("job-1").await.unwrap(), Some(state));
}

#[tokio::test]
async fn expire_and_persist_cover_all_job_keys() {
    let storage = Storage::in_memory().await.unwrap();
    let keys = storage.keys().clone();

    let mut tx = storage.begin();
    tx.set_job_state("job-1", &JobState::new("Succeeded"))
        .expire_job("job-1", Duration::from_secs(3600));
    tx.commit().await.unwrap();
    for key in [keys.job("job-1"), keys.job_state("job-1"), keys.job_history("job-1")] {
        assert!(storage.store().ttl(&key).await.unwrap().is_some(), "{key} has no ttl");
    }

    let mut tx = storage.begin();
    tx.persist_job("job-1");
    tx.commit().await.unwrap();
    for key in [keys.job("job-1"), keys.job_state("job-1"), keys.job_history("job-1")] {
        assert_eq!(storage.store().ttl(&key).await.unwrap(), None, "{key} still expires");
    }
}

#[tokio::test]
async fn create_job_stores_fields_with_expiry() {
    let storage = Storage::in_memory().await.unwrap();
    let id = storage
        .create_job([("Type", "Email"), ("Args", "[]")], Duration::from_secs(60))
        .await
        .unwrap();

    let fields = storage.job_fields(&id).await.unwrap();
    assert_eq!(fields.get("Type").map(String::as_str), Some("Email"));
    assert!(fields.contains_key(CREATED_AT));
    let ttl = storage.store().ttl(&storage.keys().job(&id)).await.unwrap();
    assert!(ttl.is_some());
}

// ---------------------------------------------------------------------------
// Counters, sets, lists, hashes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counters_sets_lists_and_hashes() {
    let storage = Storage::in_memory().await.unwrap();
    let mut tx = storage.begin();
    tx.increment_counter("c")
        .increment_counter("c")
        .decrement_counter_with_expiry("d", Duration::from_secs(60))
        .add_to_set("s", "b")
        .add_to_set_with_score("s", "a", 5.0)
        .remove_from_set("s", "missing")
        .insert_to_list("l", "x")
        .insert_to_list("l", "y")
        .insert_to_list("l", "x")
        .remove_from_list("l", "x")
        .set_range_in_hash("h", [("k1", "v1"), ("k2", "v2")])
        .set_range_in_hash("gone", [("k", "v")])
        .remove_hash("gone");
    tx.commit().await.unwrap();

    let store = storage.store();
    let keys = storage.keys();
    assert_eq!(store.get(&keys.key("c")).await.unwrap().as_deref(), Some("2"));
    assert_eq!(store.get(&keys.key("d")).await.unwrap().as_deref(), Some("-1"));
    assert!(store.ttl(&keys.key("d")).await.unwrap().is_some());
    assert_eq!(store.zrange(&keys.key("s"), 0, -1).await.unwrap(), vec!["b", "a"]);
    assert_eq!(store.lrange(&keys.key("l"), 0, -1).await.unwrap(), vec!["y"]);
    assert_eq!(store.hgetall(&keys.key("h")).await.unwrap().len(), 2);
    assert!(store.hgetall(&keys.key("gone")).await.unwrap().is_empty());
}

#[tokio::test]
async fn first_by_lowest_score_honours_the_score_window() {
    let storage = Storage::in_memory().await.unwrap();
    let mut tx = storage.begin();
    let scored = [
        ("Key1", 0.2),
        ("Key2", 0.3),
        ("Key3", 0.7),
        ("Key4", 0.4),
        ("Key5", 0.5),
    ];
    for (member, score) in scored {
        tx.add_to_set_with_score("some-set", member, score);
    }
    tx.commit().await.unwrap();

    let first = |from: f64, to: f64| storage.first_by_lowest_score("some-set", from, to);
    assert_eq!(first(0.25, 1.0).await.unwrap().as_deref(), Some("Key2"));
    assert_eq!(first(0.0, 1.0).await.unwrap().as_deref(), Some("Key1"));
    assert_eq!(first(0.8, 1.0).await.unwrap(), None);
    assert_eq!(
        storage.first_by_lowest_score("missing", 0.0, 1.0).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn trim_list_keeps_the_requested_window() {
    let storage = Storage::in_memory().await.unwrap();
    let mut tx = storage.begin();
    for i in 0..5 {
        tx.insert_to_list("recent", &i.to_string());
    }
    tx.trim_list("recent", 0, 2);
    tx.commit().await.unwrap();

    let recent = storage
        .store()
        .lrange(&storage.keys().key("recent"), 0, -1)
        .await
        .unwrap();
    assert_eq!(recent, vec!["4", "3", "2"]);
}

#[tokio::test]
async fn empty_commit_touches_nothing() {
    let store = Arc::new(Flaky::new(0));
    let storage = storage_over(store.clone()).await;
    let tx = storage.begin();
    assert!(tx.is_empty());
    tx.commit().await.unwrap();
    assert_eq!(store.executes.load(Ordering::SeqCst), 0);
}
