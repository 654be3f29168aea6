//! Server liveness registry.
//!
//! Each processing server announces itself with its worker count and
//! queues, refreshes a heartbeat while it runs, and removes itself on a
//! clean shutdown. Servers that crash are swept by
//! [`ServerRegistry::remove_timed_out`].

use crate::error::Result;
use crate::keys::{KeySpace, format_timestamp, parse_timestamp};
use crate::store::{Batch, Mutation, Store};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const WORKER_COUNT: &str = "WorkerCount";
pub const STARTED_AT: &str = "StartedAt";
pub const HEARTBEAT: &str = "Heartbeat";

/// What a server announces about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerContext {
    pub worker_count: u32,
    pub queues: Vec<String>,
}

pub struct ServerRegistry {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Register `server_id`, stamping `StartedAt` and replacing any queue
    /// list left by a previous run under the same id.
    pub async fn announce(&self, server_id: &str, context: &ServerContext) -> Result<()> {
        let queues_key = self.keys.server_queues(server_id);
        let mut batch = Batch::new()
            .then(Mutation::SetAdd {
                key: self.keys.servers(),
                member: server_id.to_string(),
            })
            .then(Mutation::HashSet {
                key: self.keys.server(server_id),
                fields: vec![
                    (WORKER_COUNT.to_string(), context.worker_count.to_string()),
                    (STARTED_AT.to_string(), format_timestamp(Utc::now())),
                ],
            })
            .then(Mutation::Delete(queues_key.clone()));
        for queue in &context.queues {
            batch.push_mutation(Mutation::ListRightPush {
                key: queues_key.clone(),
                value: queue.clone(),
            });
        }
        self.store.execute(&batch).await?;
        info!(
            server_id,
            workers = context.worker_count,
            queues = ?context.queues,
            "server announced"
        );
        Ok(())
    }

    pub async fn heartbeat(&self, server_id: &str) -> Result<()> {
        self.store
            .hset(
                &self.keys.server(server_id),
                HEARTBEAT,
                &format_timestamp(Utc::now()),
            )
            .await
    }

    /// Drop the id from the registry along with its hash and queue list.
    pub async fn remove(&self, server_id: &str) -> Result<()> {
        let batch = Batch::new()
            .then(Mutation::SetRemove {
                key: self.keys.servers(),
                member: server_id.to_string(),
            })
            .then(Mutation::Delete(self.keys.server(server_id)))
            .then(Mutation::Delete(self.keys.server_queues(server_id)));
        self.store.execute(&batch).await?;
        Ok(())
    }

    /// Remove every server whose latest sign of life (`StartedAt` or
    /// `Heartbeat`, whichever is later) is older than `timeout`. Returns how
    /// many were removed.
    pub async fn remove_timed_out(&self, timeout: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for server_id in self.store.smembers(&self.keys.servers()).await? {
            let stamps = self
                .store
                .hmget(&self.keys.server(&server_id), &[STARTED_AT, HEARTBEAT])
                .await?;
            let last_seen = stamps
                .iter()
                .filter_map(|raw| raw.as_deref().and_then(parse_timestamp))
                .max();
            if timed_out(now, last_seen, timeout) {
                self.remove(&server_id).await?;
                debug!(%server_id, ?last_seen, "timed-out server removed");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, ?timeout, "removed timed-out servers");
        }
        Ok(removed)
    }
}

/// A server with no readable stamp at all counts as timed out.
fn timed_out(now: DateTime<Utc>, last_seen: Option<DateTime<Utc>>, timeout: Duration) -> bool {
    let Some(last_seen) = last_seen else {
        return true;
    };
    let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
    last_seen
        .checked_add_signed(timeout)
        .is_some_and(|deadline| now > deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_stamps_time_out() {
        assert!(timed_out(Utc::now(), None, Duration::from_secs(3600)));
    }

    #[test]
    fn huge_timeout_never_expires() {
        let long_ago = Utc::now() - TimeDelta::days(365);
        assert!(!timed_out(Utc::now(), Some(long_ago), Duration::MAX));
    }
}
