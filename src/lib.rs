//! # leaseq
//!
//! Coordination primitives for worker fleets sharing one Redis-compatible
//! store: reentrant distributed locks, priority work queues with
//! crash-safe leases, a visibility watcher that recovers abandoned leases,
//! and atomic multi-key writes with optimistic retry.
//!
//! Start from [`storage::Storage`], which owns a store connection and hands
//! out the other components.

pub mod capability;
pub mod config;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod lease;
pub mod lock;
pub mod server;
pub mod signal;
pub mod state;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod transaction;
pub mod watcher;
