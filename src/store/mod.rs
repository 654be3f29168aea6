//! Store adapter: the atomic key-value primitives everything else is built on.
//!
//! Two backends implement [`Store`]: [`RedisStore`] against a Redis server,
//! and [`MemoryStore`] in process memory. Higher layers only hold an
//! `Arc<dyn Store>`, so the backend is injected at open time.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::Result;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// Stream of pub/sub message payloads for one channel.
pub type Subscription = BoxStream<'static, String>;

/// A precondition checked immediately before a batch is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    KeyNotExists(String),
    StringEqual {
        key: String,
        value: String,
    },
    HashFieldEqual {
        key: String,
        field: String,
        value: String,
    },
    HashFieldNotExists {
        key: String,
        field: String,
    },
}

impl Condition {
    /// The key this condition reads.
    pub fn key(&self) -> &str {
        match self {
            Condition::KeyNotExists(key)
            | Condition::StringEqual { key, .. }
            | Condition::HashFieldEqual { key, .. }
            | Condition::HashFieldNotExists { key, .. } => key,
        }
    }
}

/// One write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    IncrBy {
        key: String,
        delta: i64,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Persist(String),
    Delete(String),
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HashDelete {
        key: String,
        field: String,
    },
    ListLeftPush {
        key: String,
        value: String,
    },
    ListRightPush {
        key: String,
        value: String,
    },
    /// Remove `count` occurrences from the head; 0 removes all.
    ListRemove {
        key: String,
        count: i64,
        value: String,
    },
    ListTrim {
        key: String,
        start: i64,
        stop: i64,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    SortedSetAdd {
        key: String,
        member: String,
        score: f64,
    },
    SortedSetRemove {
        key: String,
        member: String,
    },
}

/// Conditions plus mutations, applied all-or-nothing by [`Store::execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    conditions: Vec<Condition>,
    mutations: Vec<Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition.
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add a mutation.
    pub fn then(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn push_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn push_mutation(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// The minimal set of atomic primitives the coordination layer needs.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remaining time to live. `None` when the key is absent or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Set one hash field as a single atomic write.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Inclusive range; negative indexes count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    async fn llen(&self, key: &str) -> Result<u64>;

    /// Sorted set members by rank, inclusive.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// At most `limit` sorted set members with `min <= score <= max`, lowest
    /// score first.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// All members of a plain set, in no particular order.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically pop the tail of `source` and push it onto the head of
    /// `destination`.
    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>>;

    /// Apply the batch atomically. Returns `false` without applying anything
    /// when a condition fails or a concurrent write aborted the transaction.
    async fn execute(&self, batch: &Batch) -> Result<bool>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to a channel. Messages published after this returns are
    /// delivered on the stream.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
