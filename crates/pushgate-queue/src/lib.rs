//! Per-service FIFO queue abstraction.
//!
//! Two backends implement the same [`Queue`] trait: [`memory::MemoryQueue`]
//! (no persistence, single process) and [`redis::RedisQueue`] (durable,
//! survives crashes via a waiting/pending list recovery protocol). The pump
//! depends only on the trait.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod memory;
pub mod redis;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A message handle returned by [`Queue::get`]. Exactly one of
/// `remove`/`requeue` must be called on it before it is dropped; the queue
/// tracks the underlying bookkeeping (slot index, raw Redis payload, ...)
/// opaquely behind this handle.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub bytes: Vec<u8>,
    pub(crate) handle: Handle,
}

impl QueuedMessage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Handle {
    Memory { slot: usize },
    Redis,
}

/// Capability set a pump depends on: enqueue, blocking get, remove,
/// requeue, shutdown. Implemented by both queue backends.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append raw bytes to the waiting list.
    async fn enqueue(&self, bytes: Vec<u8>) -> Result<()>;

    /// Block until an item is available, marking it pending. Returns
    /// `Err` on cancellation or shutdown; callers must not call
    /// `remove`/`requeue` after such an error.
    async fn get(&self, cancel: &CancellationToken) -> Result<QueuedMessage>;

    /// Remove a pending item permanently. Tolerates "already gone" on
    /// backends where that can race (logged, not an error).
    async fn remove(&self, msg: QueuedMessage) -> Result<()>;

    /// Move a pending item back to the waiting list, at the tail.
    async fn requeue(&self, msg: QueuedMessage) -> Result<()>;

    /// Non-destructive shutdown: pending items remain and are recovered
    /// on next startup (persistent backend) or simply dropped (memory).
    async fn shutdown(&self);
}
