//! Per-service rate limiter + earliest-deadline-first batcher.
//!
//! Caps pushes to any single squash key at `rate_max` per `rate_per`,
//! diverting excess into a batch released as one `squash_and_push` call
//! once its due time arrives. A batch push discards its constituent
//! queue handles regardless of outcome — see the module-level note on
//! Open Question 1 in DESIGN.md.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pushgate_core::{FeedbackCollector, ServiceMessage};
use pushgate_queue::{Queue, QueuedMessage};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::adapter::{Adapter, Client};

const MAX_SCHEDULER_SLEEP: Duration = Duration::from_millis(500);

struct Batch {
    queue: Arc<dyn Queue>,
    client: Client,
    service_msgs: Vec<Box<dyn ServiceMessage>>,
    queued_msgs: Vec<QueuedMessage>,
    due_at: Instant,
}

struct State {
    pushed_at: HashMap<String, Vec<Instant>>,
    batches: HashMap<String, Batch>,
}

/// Outcome of [`Squasher::prepare_to_push`].
pub enum Admission {
    Squashed,
    Immediate(QueuedMessage, Box<dyn ServiceMessage>),
}

pub struct Squasher {
    adapter: Arc<dyn Adapter>,
    rate_max: u32,
    rate_per: Duration,
    state: Mutex<State>,
    notify: Notify,
    shutting_down: AtomicBool,
}

impl Squasher {
    pub fn new(adapter: Arc<dyn Adapter>, rate_max: u32, rate_per: Duration) -> Self {
        Self {
            adapter,
            rate_max,
            rate_per,
            state: Mutex::new(State {
                pushed_at: HashMap::new(),
                batches: HashMap::new(),
            }),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn flush_and_get_rate(state: &mut State, key: &str, rate_per: Duration) -> (usize, Option<Instant>) {
        let times = state.pushed_at.entry(key.to_string()).or_default();
        let now = Instant::now();
        times.retain(|t| now.duration_since(*t) <= rate_per);
        let first = times.first().copied();
        (times.len(), first)
    }

    fn record_push(state: &mut State, key: &str) {
        state.pushed_at.entry(key.to_string()).or_default().push(Instant::now());
    }

    /// Admits a candidate push. `Squashed` means the message was diverted
    /// into a batch and the caller must not push it itself; `Immediate`
    /// hands ownership of the queued message and its typed payload back so
    /// the caller can push it right away.
    pub fn prepare_to_push(
        &self,
        queue: Arc<dyn Queue>,
        qm: QueuedMessage,
        client: Client,
        msg: Box<dyn ServiceMessage>,
    ) -> Admission {
        let Some(key) = msg.squash_key().map(str::to_string) else {
            return Admission::Immediate(qm, msg);
        };

        let mut state = self.state.lock();
        let (send_count, first_in_window) = Self::flush_and_get_rate(&mut state, &key, self.rate_per);
        if (send_count as u32) < self.rate_max {
            Self::record_push(&mut state, &key);
            return Admission::Immediate(qm, msg);
        }
        debug!(squash_key = %key, service = self.adapter.id(), "rate exceeded, squashing");

        let due_at = first_in_window.unwrap_or_else(Instant::now) + self.rate_per;
        let batch = state.batches.entry(key).or_insert_with(|| Batch {
            queue: queue.clone(),
            client: client.clone(),
            service_msgs: Vec::new(),
            queued_msgs: Vec::new(),
            due_at,
        });
        if !Arc::ptr_eq(&batch.queue, &queue) {
            panic!("squasher cannot handle mixed queues");
        }
        batch.service_msgs.push(msg);
        batch.queued_msgs.push(qm);
        batch.due_at = due_at;
        drop(state);
        self.notify.notify_waiters();
        Admission::Squashed
    }

    fn next_due_batch(state: &mut State) -> Option<String> {
        state
            .batches
            .iter()
            .min_by_key(|(_, b)| b.due_at)
            .map(|(k, _)| k.clone())
    }

    async fn get_next_batch(&self) -> Option<Batch> {
        loop {
            // Enlist before checking so a `prepare_to_push` landing between
            // the check and the wait below isn't missed: `notify_waiters`
            // only wakes futures already registered as waiters.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.batches.is_empty() {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return None;
                    }
                    drop(state);
                    notified.await;
                    continue;
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(key) = Self::next_due_batch(&mut state) {
                    let due_at = state.batches[&key].due_at;
                    let now = Instant::now();
                    if now >= due_at {
                        return state.batches.remove(&key);
                    }
                    let sleep_for = (due_at - now).min(MAX_SCHEDULER_SLEEP);
                    drop(state);
                    tokio::time::sleep(sleep_for).await;
                    continue;
                }
            }
        }
    }

    async fn send_batch(&self, key_hint: &str, batch: Batch, feedback: &dyn FeedbackCollector) {
        {
            let mut state = self.state.lock();
            Self::record_push(&mut state, key_hint);
        }
        debug!(service = self.adapter.id(), count = batch.service_msgs.len(), "releasing squashed batch");
        let status = self
            .adapter
            .squash_and_push(&batch.client, &batch.service_msgs, feedback)
            .await;
        if !matches!(status, pushgate_core::PushStatus::Success) {
            warn!(service = self.adapter.id(), ?status, "squashed batch did not succeed; not retried");
        }
        for qm in batch.queued_msgs {
            if let Err(e) = batch.queue.remove(qm).await {
                warn!(service = self.adapter.id(), error = %e, "failed to remove squashed message from queue");
            }
        }
    }

    /// Scheduler loop: run as a sibling task alongside the pump's workers.
    pub async fn serve(&self, feedback: &dyn FeedbackCollector) {
        loop {
            match self.get_next_batch().await {
                None => {
                    let remaining = self.state.lock().batches.len();
                    debug!(service = self.adapter.id(), remaining, "squasher shutting down");
                    return;
                }
                Some(batch) => {
                    // the key is only used for rate accounting; recover it
                    // from the first message's squash key.
                    let key = batch
                        .service_msgs
                        .first()
                        .and_then(|m| m.squash_key())
                        .unwrap_or("")
                        .to_string();
                    self.send_batch(&key, batch, feedback).await;
                }
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use async_trait::async_trait;
    use pushgate_core::{NullFeedbackCollector, PushStatus};
    use pushgate_queue::memory::MemoryQueue;
    use std::any::Any;

    struct Msg(String);
    impl ServiceMessage for Msg {
        fn squash_key(&self) -> Option<&str> {
            Some(&self.0)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct TestAdapter;
    #[async_trait]
    impl Adapter for TestAdapter {
        fn id(&self) -> &str {
            "test"
        }
        fn validate(&self, _: &[u8]) -> Result<(), DispatchError> {
            Ok(())
        }
        fn convert(&self, _: &[u8]) -> Result<Box<dyn ServiceMessage>, DispatchError> {
            unreachable!()
        }
        async fn new_client(&self) -> Result<Client, DispatchError> {
            Ok(Client::Http(reqwest::Client::new()))
        }
        async fn push_message(
            &self,
            _client: &Client,
            _msg: &dyn ServiceMessage,
            _feedback: &dyn FeedbackCollector,
        ) -> PushStatus {
            PushStatus::Success
        }
        async fn squash_and_push(
            &self,
            _client: &Client,
            _msgs: &[Box<dyn ServiceMessage>],
            _feedback: &dyn FeedbackCollector,
        ) -> PushStatus {
            PushStatus::Success
        }
        fn supports_squash(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn first_rate_max_pushes_are_not_squashed() {
        let adapter: Arc<dyn Adapter> = Arc::new(TestAdapter);
        let squasher = Squasher::new(adapter.clone(), 2, Duration::from_secs(10));
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
        let client = Client::Http(reqwest::Client::new());

        queue.enqueue(b"a".to_vec()).await.unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let h1 = queue.get(&cancel).await.unwrap();
        assert!(matches!(
            squasher.prepare_to_push(queue.clone(), h1, client.clone(), Box::new(Msg("k".into()))),
            Admission::Immediate(_, _)
        ));

        queue.enqueue(b"b".to_vec()).await.unwrap();
        let h2 = queue.get(&cancel).await.unwrap();
        assert!(matches!(
            squasher.prepare_to_push(queue.clone(), h2, client.clone(), Box::new(Msg("k".into()))),
            Admission::Immediate(_, _)
        ));

        queue.enqueue(b"c".to_vec()).await.unwrap();
        let h3 = queue.get(&cancel).await.unwrap();
        assert!(matches!(
            squasher.prepare_to_push(queue.clone(), h3, client.clone(), Box::new(Msg("k".into()))),
            Admission::Squashed
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_scheduler() {
        let adapter: Arc<dyn Adapter> = Arc::new(TestAdapter);
        let squasher = Arc::new(Squasher::new(adapter, 0, Duration::from_millis(50)));
        let s2 = squasher.clone();
        let handle = tokio::spawn(async move { s2.serve(&NullFeedbackCollector).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        squasher.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should exit promptly on shutdown")
            .unwrap();
    }
}
