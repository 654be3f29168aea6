//! Integration tests for priority fetch and the notification channel.

use leaseq::config::StorageOptions;
use leaseq::error::Error;
use leaseq::fetch::FetchOptions;
use leaseq::keys::{FETCHED, parse_timestamp};
use leaseq::signal::NotificationChannel;
use leaseq::storage::Storage;
use leaseq::store::{Batch, MemoryStore, Mutation, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn storage_with_poll(poll_interval: Option<Duration>) -> Arc<Storage> {
    let options = StorageOptions {
        fetch: FetchOptions { poll_interval },
        ..StorageOptions::default()
    };
    Arc::new(
        Storage::open(Arc::new(MemoryStore::new()), options)
            .await
            .expect("failed to open storage"),
    )
}

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Selection order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_listed_queue_wins() {
    let storage = Storage::in_memory().await.unwrap();
    storage.enqueue("default", "job-default").await.unwrap();
    storage.enqueue("critical", "job-critical").await.unwrap();

    let cancel = CancellationToken::new();
    let mut lease = storage
        .fetcher()
        .fetch_next(&queues(&["critical", "default"]), &cancel)
        .await
        .unwrap();

    assert_eq!(lease.job_id(), "job-critical");
    assert_eq!(lease.queue(), "critical");
    lease.acknowledge().await.unwrap();
}

#[tokio::test]
async fn lower_priority_queue_is_served_without_blocking() {
    let storage = storage_with_poll(None).await;
    storage.enqueue("default", "job-1").await.unwrap();

    let cancel = CancellationToken::new();
    let fetcher = storage.fetcher();
    let names = queues(&["critical", "default"]);
    let lease = tokio::time::timeout(Duration::from_secs(1), fetcher.fetch_next(&names, &cancel))
        .await
        .expect("fetch blocked although an item was available")
        .unwrap();

    assert_eq!(lease.job_id(), "job-1");
    assert_eq!(lease.queue(), "default");
}

#[tokio::test]
async fn queue_is_first_in_first_out() {
    let storage = Storage::in_memory().await.unwrap();
    for id in ["a", "b", "c"] {
        storage.enqueue("default", id).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let fetcher = storage.fetcher();
    let mut order = Vec::new();
    for _ in 0..3 {
        let mut lease = fetcher.fetch_next(&["default"], &cancel).await.unwrap();
        order.push(lease.job_id().to_string());
        lease.acknowledge().await.unwrap();
    }
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn fetch_moves_item_in_flight_and_stamps_it() {
    let storage = Storage::in_memory().await.unwrap();
    storage.enqueue("default", "job-1").await.unwrap();

    let cancel = CancellationToken::new();
    let mut lease = storage
        .fetcher()
        .fetch_next(&["default"], &cancel)
        .await
        .unwrap();

    assert_eq!(storage.pending_count("default").await.unwrap(), 0);
    assert_eq!(storage.in_flight_count("default").await.unwrap(), 1);
    let fetched = storage
        .job_parameter("job-1", FETCHED)
        .await
        .unwrap()
        .expect("Fetched stamp missing");
    assert!(parse_timestamp(&fetched).is_some());

    lease.acknowledge().await.unwrap();
}

#[tokio::test]
async fn try_fetch_returns_none_when_empty() {
    let storage = Storage::in_memory().await.unwrap();
    let lease = storage.fetcher().try_fetch(&["a", "b"]).await.unwrap();
    assert!(lease.is_none());
}

#[tokio::test]
async fn empty_queue_list_is_rejected() {
    let storage = Storage::in_memory().await.unwrap();
    let cancel = CancellationToken::new();
    let none: [&str; 0] = [];
    let result = storage.fetcher().fetch_next(&none, &cancel).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

// ---------------------------------------------------------------------------
// Blocking and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_aborts_a_blocked_fetch() {
    let storage = storage_with_poll(None).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        storage.fetcher().fetch_next(&["default"], &cancel),
    )
    .await
    .expect("cancellation did not unblock the fetch");
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn cancelled_token_wins_over_available_work() {
    let storage = Storage::in_memory().await.unwrap();
    storage.enqueue("default", "job-1").await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = storage.fetcher().fetch_next(&["default"], &cancel).await;
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(storage.pending_count("default").await.unwrap(), 1);
}

#[tokio::test]
async fn enqueue_wakes_a_blocked_fetch() {
    let storage = storage_with_poll(None).await;
    let cancel = CancellationToken::new();

    let fetcher = storage.fetcher();
    let waiting_cancel = cancel.clone();
    let waiting = tokio::spawn(async move {
        fetcher
            .fetch_next(&["default"], &waiting_cancel)
            .await
            .map(|lease| lease.job_id().to_string())
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    storage.enqueue("default", "job-late").await.unwrap();

    let fetched = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("fetch was not woken by the signal")
        .unwrap()
        .unwrap();
    assert_eq!(fetched, "job-late");
}

#[tokio::test]
async fn poll_interval_recovers_from_a_missed_signal() {
    let storage = storage_with_poll(Some(Duration::from_millis(30))).await;
    let cancel = CancellationToken::new();

    let fetcher = storage.fetcher();
    let waiting_cancel = cancel.clone();
    let waiting = tokio::spawn(async move {
        fetcher
            .fetch_next(&["default"], &waiting_cancel)
            .await
            .map(|lease| lease.job_id().to_string())
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    // Push without publishing a signal.
    storage
        .store()
        .execute(&Batch::new().then(Mutation::ListLeftPush {
            key: storage.keys().pending("default"),
            value: "job-silent".to_string(),
        }))
        .await
        .unwrap();

    let fetched = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("poll fallback never re-scanned the queues")
        .unwrap()
        .unwrap();
    assert_eq!(fetched, "job-silent");
}

// ---------------------------------------------------------------------------
// Notification channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_signal_wakes_every_waiter() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let channel = NotificationChannel::open(store, "announce").await.unwrap();
    let cancel = CancellationToken::new();

    let mut first = channel.waiter();
    let mut second = channel.waiter();
    channel.signal().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), first.wait(&cancel))
        .await
        .expect("first waiter not woken")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), second.wait(&cancel))
        .await
        .expect("second waiter not woken")
        .unwrap();
}

#[tokio::test]
async fn signal_seen_before_waiting_is_not_lost() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let channel = NotificationChannel::open(store, "announce").await.unwrap();
    let cancel = CancellationToken::new();

    let mut waiter = channel.waiter();
    waiter.mark_seen();
    channel.signal().await.unwrap();
    // Let the forwarding task deliver before we start waiting.
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_millis(500), waiter.wait(&cancel))
        .await
        .expect("signal delivered between mark_seen and wait was lost")
        .unwrap();
}

#[tokio::test]
async fn wait_for_signal_raises_cancellation() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let channel = NotificationChannel::open(store, "announce").await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = channel.wait_for_signal(&cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));
}
