//! Store key layout and the timestamp encoding used in job fields.
//!
//! The layout is shared with existing deployments, so every key here is a
//! wire contract: `<prefix>queues`, `<prefix>queue:<name>`,
//! `<prefix>queue:<name>:dequeued`, `<prefix>job:<id>`, the lock pair
//! `<prefix><resource>` / `<prefix><resource>:c`, and the server registry
//! `<prefix>servers` / `<prefix>server:<id>` / `<prefix>server:<id>:queues`.

use chrono::{DateTime, SecondsFormat, Utc};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "hangfire:";

/// Default pub/sub channel for "work available" announcements.
pub const DEFAULT_CHANNEL: &str = "Hangfire:announce";

/// Job field stamped when a lease is granted.
pub const FETCHED: &str = "Fetched";

/// Job field stamped by the watcher when it sees an unstamped in-flight id.
pub const CHECKED: &str = "Checked";

/// Job field holding the current state name.
pub const STATE: &str = "State";

/// Job field holding the creation time.
pub const CREATED_AT: &str = "CreatedAt";

/// Builds prefixed keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// An arbitrary key under the prefix.
    pub fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    /// Sorted set of known queue names.
    pub fn queues(&self) -> String {
        self.key("queues")
    }

    /// Pending list of a queue.
    pub fn pending(&self, queue: &str) -> String {
        format!("{}queue:{queue}", self.prefix)
    }

    /// In-flight list of a queue.
    pub fn dequeued(&self, queue: &str) -> String {
        format!("{}queue:{queue}:dequeued", self.prefix)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}job:{id}", self.prefix)
    }

    pub fn job_state(&self, id: &str) -> String {
        format!("{}job:{id}:state", self.prefix)
    }

    pub fn job_history(&self, id: &str) -> String {
        format!("{}job:{id}:history", self.prefix)
    }

    /// Set of announced server ids.
    pub fn servers(&self) -> String {
        self.key("servers")
    }

    /// Hash of one server's `WorkerCount`, `StartedAt` and `Heartbeat`.
    pub fn server(&self, id: &str) -> String {
        format!("{}server:{id}", self.prefix)
    }

    /// List of the queues a server consumes.
    pub fn server_queues(&self, id: &str) -> String {
        format!("{}server:{id}:queues", self.prefix)
    }

    /// Value key of a lock.
    pub fn lock(&self, resource: &str) -> String {
        self.key(resource)
    }

    /// Reentrancy counter key of a lock.
    pub fn lock_counter(&self, resource: &str) -> String {
        format!("{}{resource}:c", self.prefix)
    }

    /// Resource name the watcher locks while reconciling one queue.
    pub fn dequeued_lock_resource(queue: &str) -> String {
        format!("queue:{queue}:dequeued:lock")
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Encode a timestamp the way job fields store it (RFC 3339, UTC, `Z`).
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp. Returns `None` for anything malformed.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
