//! Capability interfaces.
//!
//! Callers that only need one facet of the coordination layer can depend
//! on the matching trait instead of on [`Storage`], which implements all
//! four.

use crate::error::Result;
use crate::lease::InFlightLease;
use crate::lock::LockGuard;
use crate::storage::Storage;
use crate::transaction::TransactionalWriter;
use crate::watcher::PassReport;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Named mutual exclusion.
#[async_trait::async_trait]
pub trait Lock: Send + Sync {
    async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<LockGuard>;
}

/// Leasing work from priority-ordered queues.
#[async_trait::async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch_next(&self, queues: &[String], cancel: &CancellationToken)
    -> Result<InFlightLease>;
}

/// Atomic multi-key writes.
pub trait Transaction: Send + Sync {
    fn begin(&self) -> TransactionalWriter;
}

/// Recovery of abandoned leases.
#[async_trait::async_trait]
pub trait Watch: Send + Sync {
    async fn watch_once(&self) -> Result<PassReport>;

    /// Run passes until `cancel` fires.
    async fn watch(&self, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait::async_trait]
impl Lock for Storage {
    async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<LockGuard> {
        Storage::acquire_lock(self, resource, timeout).await
    }
}

#[async_trait::async_trait]
impl Fetch for Storage {
    async fn fetch_next(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<InFlightLease> {
        self.fetcher().fetch_next(queues, cancel).await
    }
}

impl Transaction for Storage {
    fn begin(&self) -> TransactionalWriter {
        Storage::begin(self)
    }
}

#[async_trait::async_trait]
impl Watch for Storage {
    async fn watch_once(&self) -> Result<PassReport> {
        self.watcher()?.run_pass().await
    }

    async fn watch(&self, cancel: &CancellationToken) -> Result<()> {
        self.watcher()?.run(cancel).await;
        Ok(())
    }
}
