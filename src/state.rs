//! State handlers and their registry.
//!
//! A handler contributes extra writes when a job enters (`apply`) or leaves
//! (`unapply`) a named state, e.g. keeping the `failed` index current. All
//! of it lands in the caller's writer, so a transition is one atomic batch.

use crate::transaction::{JobState, TransactionalWriter};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// Entries kept in the `succeeded` and `deleted` lists.
pub const HISTORY_LIST_LIMIT: i64 = 100;

pub trait StateHandler: Send + Sync {
    /// State this handler reacts to.
    fn state_name(&self) -> &str;

    fn apply(&self, tx: &mut TransactionalWriter, job_id: &str);

    fn unapply(&self, tx: &mut TransactionalWriter, job_id: &str);
}

/// Indexes a job in a sorted set scored by the time it entered the state.
struct ScoredIndex {
    state: &'static str,
    set: &'static str,
}

impl StateHandler for ScoredIndex {
    fn state_name(&self) -> &str {
        self.state
    }

    fn apply(&self, tx: &mut TransactionalWriter, job_id: &str) {
        tx.add_to_set_with_score(self.set, job_id, Utc::now().timestamp() as f64);
    }

    fn unapply(&self, tx: &mut TransactionalWriter, job_id: &str) {
        tx.remove_from_set(self.set, job_id);
    }
}

/// Keeps the most recent jobs of a state in a bounded list, newest first.
struct RecentList {
    state: &'static str,
    list: &'static str,
}

impl StateHandler for RecentList {
    fn state_name(&self) -> &str {
        self.state
    }

    fn apply(&self, tx: &mut TransactionalWriter, job_id: &str) {
        tx.insert_to_list(self.list, job_id)
            .trim_list(self.list, 0, HISTORY_LIST_LIMIT - 1);
    }

    fn unapply(&self, tx: &mut TransactionalWriter, job_id: &str) {
        tx.remove_from_list(self.list, job_id);
    }
}

/// Handlers indexed by state name.
pub struct StateHandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn StateHandler>>>,
}

impl StateHandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the built-in `Failed`, `Processing`, `Succeeded` and
    /// `Deleted` handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ScoredIndex {
            state: "Failed",
            set: "failed",
        }));
        registry.register(Arc::new(ScoredIndex {
            state: "Processing",
            set: "processing",
        }));
        registry.register(Arc::new(RecentList {
            state: "Succeeded",
            list: "succeeded",
        }));
        registry.register(Arc::new(RecentList {
            state: "Deleted",
            list: "deleted",
        }));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn StateHandler>) {
        self.handlers
            .entry(handler.state_name().to_string())
            .or_default()
            .push(handler);
    }

    /// Handlers registered for `state`, in registration order.
    pub fn handlers_for(&self, state: &str) -> &[Arc<dyn StateHandler>] {
        self.handlers.get(state).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Stage a transition: unapply the old state's handlers, write the new
    /// state, then apply the new state's handlers.
    pub fn apply_transition(
        &self,
        tx: &mut TransactionalWriter,
        job_id: &str,
        old_state: Option<&str>,
        new_state: &JobState,
    ) {
        if let Some(old) = old_state {
            for handler in self.handlers_for(old) {
                handler.unapply(tx, job_id);
            }
        }
        tx.set_job_state(job_id, new_state);
        for handler in self.handlers_for(&new_state.name) {
            handler.apply(tx, job_id);
        }
    }
}

impl Default for StateHandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
