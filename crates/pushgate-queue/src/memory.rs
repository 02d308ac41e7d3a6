//! In-memory queue backend: a dense slot vector guarded by a mutex, with a
//! `Notify` standing in for the condition variable the original blocking
//! implementation uses. No persistence — `shutdown` simply wakes every
//! waiter so they observe the shutdown flag.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Handle, Queue, QueueError, QueuedMessage, Result};

struct Slot {
    bytes: Vec<u8>,
    pending: bool,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    shutting_down: bool,
}

/// Single-process, non-durable queue.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, bytes: Vec<u8>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let slot = Slot {
                bytes,
                pending: false,
            };
            if let Some(free) = inner.slots.iter_mut().position(|s| s.is_none()) {
                inner.slots[free] = Some(slot);
            } else {
                inner.slots.push(Some(slot));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get(&self, cancel: &CancellationToken) -> Result<QueuedMessage> {
        loop {
            // Enlist as a waiter before checking, so an enqueue racing
            // between the check and the wait below can't be missed:
            // `notify_waiters` only wakes futures already registered.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return Err(QueueError::ShutDown);
                }
                if let Some((idx, slot)) = inner
                    .slots
                    .iter_mut()
                    .enumerate()
                    .find_map(|(i, s)| s.as_mut().filter(|s| !s.pending).map(|s| (i, s)))
                {
                    slot.pending = true;
                    return Ok(QueuedMessage {
                        bytes: slot.bytes.clone(),
                        handle: Handle::Memory { slot: idx },
                    });
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    async fn remove(&self, msg: QueuedMessage) -> Result<()> {
        let Handle::Memory { slot } = msg.handle else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        if slot < inner.slots.len() {
            inner.slots[slot] = None;
        }
        Ok(())
    }

    async fn requeue(&self, msg: QueuedMessage) -> Result<()> {
        let Handle::Memory { slot } = msg.handle else {
            return Ok(());
        };
        {
            // Re-append at the highest index rather than reactivating the
            // old slot in place, so a requeued item lands behind anything
            // already waiting - matching the Redis backend's tail
            // reinsertion instead of jumping back ahead of newer arrivals.
            let mut inner = self.inner.lock();
            if let Some(slot_entry) = inner.slots.get_mut(slot) {
                if let Some(s) = slot_entry.take() {
                    inner.slots.push(Some(Slot {
                        bytes: s.bytes,
                        pending: false,
                    }));
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn shutdown(&self) {
        debug!("shutting down memory queue");
        self.inner.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_get_returns_bytes_pending() {
        let q = MemoryQueue::new();
        q.enqueue(b"hello".to_vec()).await.unwrap();
        let cancel = CancellationToken::new();
        let got = q.get(&cancel).await.unwrap();
        assert_eq!(got.bytes(), b"hello");
    }

    #[tokio::test]
    async fn get_blocks_until_enqueue() {
        let q = std::sync::Arc::new(MemoryQueue::new());
        let cancel = CancellationToken::new();
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.get(&CancellationToken::new()).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.enqueue(b"late".to_vec()).await.unwrap();
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.bytes(), b"late");
        drop(cancel);
    }

    #[tokio::test]
    async fn remove_frees_slot_for_reuse() {
        let q = MemoryQueue::new();
        q.enqueue(b"a".to_vec()).await.unwrap();
        let cancel = CancellationToken::new();
        let got = q.get(&cancel).await.unwrap();
        q.remove(got).await.unwrap();
        q.enqueue(b"b".to_vec()).await.unwrap();
        let got2 = q.get(&cancel).await.unwrap();
        assert_eq!(got2.bytes(), b"b");
        assert_eq!(q.inner.lock().slots.len(), 1);
    }

    #[tokio::test]
    async fn requeue_makes_item_visible_again() {
        let q = MemoryQueue::new();
        q.enqueue(b"x".to_vec()).await.unwrap();
        let cancel = CancellationToken::new();
        let got = q.get(&cancel).await.unwrap();
        q.requeue(got).await.unwrap();
        let got2 = q.get(&cancel).await.unwrap();
        assert_eq!(got2.bytes(), b"x");
    }

    #[tokio::test]
    async fn requeue_reinserts_behind_items_already_waiting() {
        // Documents Open Question 5: requeue changes delivery order under
        // contention by moving the retried item behind anything enqueued
        // in the meantime, rather than preserving its original position.
        let q = MemoryQueue::new();
        let cancel = CancellationToken::new();

        q.enqueue(b"first".to_vec()).await.unwrap();
        let first = q.get(&cancel).await.unwrap();

        q.enqueue(b"second".to_vec()).await.unwrap();

        q.requeue(first).await.unwrap();

        let got_a = q.get(&cancel).await.unwrap();
        let got_b = q.get(&cancel).await.unwrap();
        assert_eq!(got_a.bytes(), b"second");
        assert_eq!(got_b.bytes(), b"first");
    }

    #[tokio::test]
    async fn get_after_shutdown_errs() {
        let q = MemoryQueue::new();
        q.shutdown().await;
        let cancel = CancellationToken::new();
        assert!(matches!(q.get(&cancel).await, Err(QueueError::ShutDown)));
    }

    #[tokio::test]
    async fn get_cancelled_errs() {
        let q = MemoryQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(q.get(&cancel).await, Err(QueueError::Cancelled)));
    }

    #[tokio::test]
    async fn at_most_one_pending_across_concurrent_gets() {
        let q = std::sync::Arc::new(MemoryQueue::new());
        q.enqueue(b"only".to_vec()).await.unwrap();
        let cancel = CancellationToken::new();

        let q1 = q.clone();
        let c1 = cancel.clone();
        let t1 = tokio::spawn(async move {
            tokio::time::timeout(std::time::Duration::from_millis(50), q1.get(&c1)).await
        });
        let q2 = q.clone();
        let c2 = cancel.clone();
        let t2 = tokio::spawn(async move {
            tokio::time::timeout(std::time::Duration::from_millis(50), q2.get(&c2)).await
        });

        let (r1, r2) = tokio::join!(t1, t2);
        let ok_count = [r1.unwrap(), r2.unwrap()]
            .into_iter()
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(ok_count, 1);
    }
}
