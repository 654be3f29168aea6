//! In-process store with the atomicity of a single Redis server.
//!
//! Every operation runs under one mutex, so a batch is applied without any
//! interleaving. Values are typed the way Redis types them; TTLs expire
//! lazily on access. Pub/sub rides on tokio broadcast channels.

use super::{Batch, Condition, Mutation, Store, Subscription};
use crate::error::{Error, Result};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(HashSet<String>),
    SortedSet(Vec<(String, f64)>),
}

impl Value {
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

fn wrong_type(key: &str) -> Error {
    Error::Store(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

/// Clamp Redis-style inclusive indexes to `0..len`.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl Keyspace {
    /// Live entry for `key`, dropping it first if its TTL has passed.
    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= Instant::now()));
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn value(&mut self, key: &str) -> Option<&Value> {
        self.entry(key).map(|e| &e.value)
    }

    fn entry_or_insert(&mut self, key: &str, empty: fn() -> Value) -> &mut Entry {
        self.entry(key);
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: empty(),
            expires_at: None,
        })
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.value.is_empty_collection())
        {
            self.entries.remove(key);
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        match &mut self.entry_or_insert(key, || Value::Hash(HashMap::new())).value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>> {
        match &mut self.entry_or_insert(key, || Value::List(VecDeque::new())).value {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut HashSet<String>> {
        match &mut self.entry_or_insert(key, || Value::Set(HashSet::new())).value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_set_mut(&mut self, key: &str) -> Result<&mut Vec<(String, f64)>> {
        match &mut self.entry_or_insert(key, || Value::SortedSet(Vec::new())).value {
            Value::SortedSet(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn check(&mut self, condition: &Condition) -> bool {
        match condition {
            Condition::KeyNotExists(key) => self.entry(key).is_none(),
            Condition::StringEqual { key, value } => {
                matches!(self.value(key), Some(Value::Str(current)) if current == value)
            }
            Condition::HashFieldEqual { key, field, value } => {
                matches!(self.value(key), Some(Value::Hash(h)) if h.get(field) == Some(value))
            }
            Condition::HashFieldNotExists { key, field } => {
                !matches!(self.value(key), Some(Value::Hash(h)) if h.contains_key(field))
            }
        }
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::Set { key, value, ttl } => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Str(value.clone()),
                        expires_at: ttl.map(|ttl| Instant::now() + ttl),
                    },
                );
            }
            Mutation::IncrBy { key, delta } => {
                let entry = self.entry_or_insert(key, || Value::Str("0".to_string()));
                let Value::Str(current) = &mut entry.value else {
                    return Err(wrong_type(key));
                };
                let parsed: i64 = current.parse().map_err(|_| {
                    Error::Store(format!("value at {key} is not an integer"))
                })?;
                let next = parsed.checked_add(*delta).ok_or_else(|| {
                    Error::Store("increment or decrement would overflow".to_string())
                })?;
                *current = next.to_string();
            }
            Mutation::Expire { key, ttl } => {
                if let Some(entry) = self.entry(key) {
                    entry.expires_at = Some(Instant::now() + *ttl);
                }
            }
            Mutation::Persist(key) => {
                if let Some(entry) = self.entry(key) {
                    entry.expires_at = None;
                }
            }
            Mutation::Delete(key) => {
                self.entries.remove(key);
            }
            Mutation::HashSet { key, fields } => {
                let hash = self.hash_mut(key)?;
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                self.drop_if_empty(key);
            }
            Mutation::HashDelete { key, field } => {
                if self.entry(key).is_some() {
                    self.hash_mut(key)?.remove(field);
                    self.drop_if_empty(key);
                }
            }
            Mutation::ListLeftPush { key, value } => {
                self.list_mut(key)?.push_front(value.clone());
            }
            Mutation::ListRightPush { key, value } => {
                self.list_mut(key)?.push_back(value.clone());
            }
            Mutation::ListRemove { key, count, value } => {
                if self.entry(key).is_some() {
                    let list = self.list_mut(key)?;
                    let limit = if *count == 0 {
                        usize::MAX
                    } else {
                        count.unsigned_abs() as usize
                    };
                    let mut removed = 0;
                    if *count >= 0 {
                        let mut i = 0;
                        while i < list.len() && removed < limit {
                            if list[i] == *value {
                                list.remove(i);
                                removed += 1;
                            } else {
                                i += 1;
                            }
                        }
                    } else {
                        let mut i = list.len();
                        while i > 0 && removed < limit {
                            i -= 1;
                            if list[i] == *value {
                                list.remove(i);
                                removed += 1;
                            }
                        }
                    }
                    self.drop_if_empty(key);
                }
            }
            Mutation::ListTrim { key, start, stop } => {
                if self.entry(key).is_some() {
                    let list = self.list_mut(key)?;
                    match normalize_range(list.len(), *start, *stop) {
                        Some((from, to)) => {
                            list.truncate(to + 1);
                            list.drain(..from);
                        }
                        None => list.clear(),
                    }
                    self.drop_if_empty(key);
                }
            }
            Mutation::SetAdd { key, member } => {
                self.set_mut(key)?.insert(member.clone());
            }
            Mutation::SetRemove { key, member } => {
                if self.entry(key).is_some() {
                    self.set_mut(key)?.remove(member);
                    self.drop_if_empty(key);
                }
            }
            Mutation::SortedSetAdd { key, member, score } => {
                let zset = self.sorted_set_mut(key)?;
                zset.retain(|(m, _)| m != member);
                zset.push((member.clone(), *score));
                zset.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            }
            Mutation::SortedSetRemove { key, member } => {
                if self.entry(key).is_some() {
                    self.sorted_set_mut(key)?.retain(|(m, _)| m != member);
                    self.drop_if_empty(key);
                }
            }
        }
        Ok(())
    }
}

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn keyspace(&self) -> Result<MutexGuard<'_, Keyspace>> {
        self.keyspace
            .lock()
            .map_err(|_| Error::Store("memory store mutex poisoned".to_string()))
    }

    fn sender(&self, channel: &str) -> Result<broadcast::Sender<String>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::Store("memory store mutex poisoned".to_string()))?;
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone())
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.keyspace()?.value(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut keyspace = self.keyspace()?;
        Ok(keyspace
            .entry(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.keyspace()?.value(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        match self.keyspace()?.value(key) {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(h)) => Ok(fields.iter().map(|f| h.get(*f).cloned()).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.keyspace()?.value(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.keyspace()?
            .hash_mut(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        match self.keyspace()?.value(key) {
            None => Ok(Vec::new()),
            Some(Value::List(l)) => Ok(match normalize_range(l.len(), start, stop) {
                Some((from, to)) => l.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        match self.keyspace()?.value(key) {
            None => Ok(0),
            Some(Value::List(l)) => Ok(l.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        match self.keyspace()?.value(key) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(z)) => Ok(match normalize_range(z.len(), start, stop) {
                Some((from, to)) => z[from..=to].iter().map(|(m, _)| m.clone()).collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        match self.keyspace()?.value(key) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(z)) => Ok(z
                .iter()
                .filter(|(_, score)| (min..=max).contains(score))
                .take(limit)
                .map(|(m, _)| m.clone())
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match self.keyspace()?.value(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        let mut keyspace = self.keyspace()?;
        if matches!(keyspace.value(destination), Some(v) if !matches!(v, Value::List(_))) {
            return Err(wrong_type(destination));
        }
        let popped = match keyspace.entry(source) {
            None => return Ok(None),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => l.pop_back(),
            Some(_) => return Err(wrong_type(source)),
        };
        keyspace.drop_if_empty(source);
        if let Some(ref id) = popped {
            keyspace.list_mut(destination)?.push_front(id.clone());
        }
        Ok(popped)
    }

    async fn execute(&self, batch: &Batch) -> Result<bool> {
        let mut keyspace = self.keyspace()?;
        if !batch.conditions().iter().all(|c| keyspace.check(c)) {
            return Ok(false);
        }
        // Like EXEC, a failing command does not stop the rest of the batch.
        let mut first_error = None;
        for mutation in batch.mutations() {
            if let Err(e) = keyspace.apply(mutation) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = self.sender(channel)?.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let receiver = self.sender(channel)?.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
