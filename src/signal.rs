//! "Work available" notifications over the store's pub/sub channel.
//!
//! One subscription per channel instance feeds a `watch` sequence number.
//! Every waiter sees every bump, so one signal wakes all blocked fetchers;
//! they then re-check the queues themselves because a signal names no queue.

use crate::error::{Error, Result};
use crate::store::Store;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Payload published by [`NotificationChannel::signal`]. Receivers ignore it.
const SIGNAL_PAYLOAD: &str = "1";

pub struct NotificationChannel {
    store: Arc<dyn Store>,
    name: String,
    signals: Arc<watch::Sender<u64>>,
    forwarder: JoinHandle<()>,
}

impl NotificationChannel {
    /// Subscribe to `name`. Signals published after this returns are seen by
    /// every waiter created from the channel.
    pub async fn open(store: Arc<dyn Store>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut messages = store.subscribe(&name).await?;
        let (sender, _) = watch::channel(0u64);
        let signals = Arc::new(sender);

        let bump = Arc::clone(&signals);
        let channel = name.clone();
        let forwarder = tokio::spawn(async move {
            while messages.next().await.is_some() {
                bump.send_modify(|seq| *seq = seq.wrapping_add(1));
            }
            warn!(%channel, "notification subscription ended, waiters fall back to polling");
        });

        debug!(channel = %name, "notification channel subscribed");
        Ok(Self {
            store,
            name,
            signals,
            forwarder,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a signal. Fire-and-forget: nobody listening is not an error.
    pub async fn signal(&self) -> Result<()> {
        self.store.publish(&self.name, SIGNAL_PAYLOAD).await
    }

    /// A waiter that observes signals arriving from now on.
    pub fn waiter(&self) -> SignalWaiter {
        SignalWaiter {
            rx: self.signals.subscribe(),
        }
    }

    /// Block until a signal arrives or `cancel` fires.
    pub async fn wait_for_signal(&self, cancel: &CancellationToken) -> Result<()> {
        self.waiter().wait(cancel).await
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Per-caller view of the signal sequence.
///
/// Call [`mark_seen`](Self::mark_seen) before checking the queues and
/// [`wait`](Self::wait) after finding them empty; a signal that lands in
/// between is not lost.
pub struct SignalWaiter {
    rx: watch::Receiver<u64>,
}

impl SignalWaiter {
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Wait for a signal newer than the last one seen.
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            changed = self.rx.changed() => changed
                .map_err(|_| Error::Store("notification channel closed".to_string())),
        }
    }
}
