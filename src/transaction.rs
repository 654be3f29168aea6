//! Staged, atomic multi-key writes with optimistic retry.
//!
//! A [`TransactionalWriter`] collects mutations (and optional preconditions)
//! and applies them as one batch on [`commit`](TransactionalWriter::commit).
//! Key names passed to the writer are relative to the storage prefix.

use crate::error::{Error, Result};
use crate::keys::{CREATED_AT, KeySpace, STATE, format_timestamp};
use crate::signal::NotificationChannel;
use crate::store::{Batch, Condition, Mutation, Store};
use crate::telemetry::metrics;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on commit attempts.
pub const DEFAULT_COMMIT_ATTEMPTS: u32 = 3;

/// State hash field holding the transition reason.
pub const REASON: &str = "Reason";

/// A job state as written by [`TransactionalWriter::set_job_state`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobState {
    pub name: String,
    pub reason: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl JobState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// State data plus the `State` and `Reason` fields.
    fn fields(&self) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push((STATE.to_string(), self.name.clone()));
        if let Some(reason) = &self.reason {
            fields.push((REASON.to_string(), reason.clone()));
        }
        fields
    }
}

pub struct TransactionalWriter {
    store: Arc<dyn Store>,
    keys: KeySpace,
    channel: Option<Arc<NotificationChannel>>,
    max_attempts: u32,
    batch: Batch,
    announce: bool,
}

impl TransactionalWriter {
    /// `channel` receives a signal after a commit that enqueued something.
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        channel: Option<Arc<NotificationChannel>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            keys,
            channel,
            max_attempts: max_attempts.max(1),
            batch: Batch::new(),
            announce: false,
        }
    }

    fn stage(&mut self, mutation: Mutation) -> &mut Self {
        self.batch.push_mutation(mutation);
        self
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.batch.mutations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Require the string at `name` to equal `expected` (or be absent for
    /// `None`) when the batch is applied.
    pub fn watch_value(&mut self, name: &str, expected: Option<&str>) -> &mut Self {
        let key = self.keys.key(name);
        self.batch.push_condition(match expected {
            Some(value) => Condition::StringEqual {
                key,
                value: value.to_string(),
            },
            None => Condition::KeyNotExists(key),
        });
        self
    }

    /// Require hash field `field` of `name` to equal `expected` (or be
    /// absent for `None`) when the batch is applied.
    pub fn watch_hash_field(&mut self, name: &str, field: &str, expected: Option<&str>) -> &mut Self {
        let key = self.keys.key(name);
        let field = field.to_string();
        self.batch.push_condition(match expected {
            Some(value) => Condition::HashFieldEqual {
                key,
                field,
                value: value.to_string(),
            },
            None => Condition::HashFieldNotExists { key, field },
        });
        self
    }

    /// Require the job's `State` field to be `expected` at commit.
    pub fn expect_job_state(&mut self, job_id: &str, expected: Option<&str>) -> &mut Self {
        self.watch_hash_field(&format!("job:{job_id}"), STATE, expected)
    }

    /// Register `queue` and push `job_id` onto its pending list. A
    /// successful commit then signals waiting fetchers.
    pub fn add_to_queue(&mut self, queue: &str, job_id: &str) -> &mut Self {
        self.announce = true;
        self.stage(Mutation::SortedSetAdd {
            key: self.keys.queues(),
            member: queue.to_string(),
            score: 0.0,
        });
        self.stage(Mutation::ListLeftPush {
            key: self.keys.pending(queue),
            value: job_id.to_string(),
        })
    }

    /// Expire the job record together with its state and history.
    pub fn expire_job(&mut self, job_id: &str, ttl: Duration) -> &mut Self {
        for key in self.job_keys(job_id) {
            self.stage(Mutation::Expire { key, ttl });
        }
        self
    }

    /// Remove any expiry from the job record, state and history.
    pub fn persist_job(&mut self, job_id: &str) -> &mut Self {
        for key in self.job_keys(job_id) {
            self.stage(Mutation::Persist(key));
        }
        self
    }

    fn job_keys(&self, job_id: &str) -> [String; 3] {
        [
            self.keys.job(job_id),
            self.keys.job_history(job_id),
            self.keys.job_state(job_id),
        ]
    }

    /// Make `state` the job's current state and append it to the history.
    pub fn set_job_state(&mut self, job_id: &str, state: &JobState) -> &mut Self {
        self.stage(Mutation::HashSet {
            key: self.keys.job(job_id),
            fields: vec![(STATE.to_string(), state.name.clone())],
        });
        self.stage(Mutation::Delete(self.keys.job_state(job_id)));
        self.stage(Mutation::HashSet {
            key: self.keys.job_state(job_id),
            fields: state.fields(),
        });
        self.add_job_state(job_id, state)
    }

    /// Append `state` to the job history without changing the current state.
    pub fn add_job_state(&mut self, job_id: &str, state: &JobState) -> &mut Self {
        let mut entry: Map<String, Value> = state
            .fields()
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        entry.insert(
            CREATED_AT.to_string(),
            Value::String(format_timestamp(Utc::now())),
        );
        self.stage(Mutation::ListRightPush {
            key: self.keys.job_history(job_id),
            value: Value::Object(entry).to_string(),
        })
    }

    pub fn increment_counter(&mut self, name: &str) -> &mut Self {
        self.counter(name, 1, None)
    }

    pub fn increment_counter_with_expiry(&mut self, name: &str, ttl: Duration) -> &mut Self {
        self.counter(name, 1, Some(ttl))
    }

    pub fn decrement_counter(&mut self, name: &str) -> &mut Self {
        self.counter(name, -1, None)
    }

    pub fn decrement_counter_with_expiry(&mut self, name: &str, ttl: Duration) -> &mut Self {
        self.counter(name, -1, Some(ttl))
    }

    fn counter(&mut self, name: &str, delta: i64, ttl: Option<Duration>) -> &mut Self {
        let key = self.keys.key(name);
        self.stage(Mutation::IncrBy {
            key: key.clone(),
            delta,
        });
        if let Some(ttl) = ttl {
            self.stage(Mutation::Expire { key, ttl });
        }
        self
    }

    /// Add `member` to the sorted set `name` with score 0.
    pub fn add_to_set(&mut self, name: &str, member: &str) -> &mut Self {
        self.add_to_set_with_score(name, member, 0.0)
    }

    pub fn add_to_set_with_score(&mut self, name: &str, member: &str, score: f64) -> &mut Self {
        self.stage(Mutation::SortedSetAdd {
            key: self.keys.key(name),
            member: member.to_string(),
            score,
        })
    }

    pub fn remove_from_set(&mut self, name: &str, member: &str) -> &mut Self {
        self.stage(Mutation::SortedSetRemove {
            key: self.keys.key(name),
            member: member.to_string(),
        })
    }

    /// Push `value` onto the head of list `name`.
    pub fn insert_to_list(&mut self, name: &str, value: &str) -> &mut Self {
        self.stage(Mutation::ListLeftPush {
            key: self.keys.key(name),
            value: value.to_string(),
        })
    }

    /// Remove every occurrence of `value` from list `name`.
    pub fn remove_from_list(&mut self, name: &str, value: &str) -> &mut Self {
        self.stage(Mutation::ListRemove {
            key: self.keys.key(name),
            count: 0,
            value: value.to_string(),
        })
    }

    /// Keep only the inclusive range `start..=stop` of list `name`.
    pub fn trim_list(&mut self, name: &str, start: i64, stop: i64) -> &mut Self {
        self.stage(Mutation::ListTrim {
            key: self.keys.key(name),
            start,
            stop,
        })
    }

    pub fn set_range_in_hash<I, K, V>(&mut self, name: &str, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if fields.is_empty() {
            return self;
        }
        self.stage(Mutation::HashSet {
            key: self.keys.key(name),
            fields,
        })
    }

    pub fn remove_hash(&mut self, name: &str) -> &mut Self {
        self.stage(Mutation::Delete(self.keys.key(name)))
    }

    /// Apply everything staged as one atomic batch.
    ///
    /// A batch rejected because watched state changed is retried as is, up
    /// to the attempt bound. Waiting fetchers are signalled only after the
    /// batch has been applied.
    ///
    /// # Errors
    ///
    /// [`Error::CommitConflict`] once every attempt was rejected.
    pub async fn commit(self) -> Result<()> {
        if self.batch.is_empty() && self.batch.conditions().is_empty() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.store.execute(&self.batch).await? {
                break;
            }
            metrics::transaction_conflicts().add(1, &[]);
            if attempt >= self.max_attempts {
                warn!(attempts = attempt, "transaction abandoned after repeated conflicts");
                return Err(Error::CommitConflict { attempts: attempt });
            }
            debug!(attempt, "transaction conflict, retrying");
        }

        debug!(mutations = self.len(), attempt, "transaction committed");
        if !self.announce {
            return Ok(());
        }
        if let Some(channel) = &self.channel {
            if let Err(e) = channel.signal().await {
                warn!("commit applied but the work-available signal failed: {e}");
            }
        }
        Ok(())
    }
}
