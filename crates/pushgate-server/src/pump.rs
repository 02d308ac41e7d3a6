//! Worker pool: pulls one message at a time off a queue, converts and
//! pushes it, then classifies the outcome into remove/requeue+backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pushgate_core::{FeedbackCollector, PushStatus};
use pushgate_queue::Queue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::adapter::{Adapter, Client};
use crate::squasher::{Admission, Squasher};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn backoff_for(failure_count: u32) -> Duration {
    let capped = failure_count.min(5);
    Duration::from_secs(1 << capped).min(MAX_BACKOFF)
}

/// Runs `workers` pull/convert/push loops (and, if the adapter supports
/// squashing, a sibling batching scheduler) against one queue until its
/// cancellation token fires.
pub struct Pump {
    adapter: Arc<dyn Adapter>,
    queue: Arc<dyn Queue>,
    workers: usize,
    squasher: Option<Arc<Squasher>>,
    cancel: CancellationToken,
}

impl Pump {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        queue: Arc<dyn Queue>,
        workers: usize,
        squasher: Option<Arc<Squasher>>,
    ) -> Self {
        Self {
            adapter,
            queue,
            workers,
            squasher,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns all worker tasks plus the optional squasher scheduler and
    /// awaits them all. Returns once every task has exited, which happens
    /// only after the cancellation token fires.
    pub async fn serve(&self, feedback: Arc<dyn FeedbackCollector>) {
        let mut handles = Vec::with_capacity(self.workers + 1);

        for worker_id in 0..self.workers {
            let client = match self.adapter.new_client().await {
                Ok(c) => c,
                Err(e) => {
                    error!(service = self.adapter.id(), worker_id, error = %e, "failed to build adapter client, worker not started");
                    continue;
                }
            };
            let adapter = self.adapter.clone();
            let queue = self.queue.clone();
            let squasher = self.squasher.clone();
            let cancel = self.cancel.clone();
            let feedback = feedback.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, adapter, queue, client, squasher, feedback, cancel).await;
            }));
        }

        if let Some(squasher) = &self.squasher {
            let squasher = squasher.clone();
            let feedback = feedback.clone();
            handles.push(tokio::spawn(async move {
                squasher.serve(feedback.as_ref()).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(service = self.adapter.id(), error = %e, "pump worker task panicked");
            }
        }
    }

    /// Signals every worker (and the squasher, if any) to stop pulling new
    /// work, then waits for in-flight pushes to finish naturally.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(squasher) = &self.squasher {
            squasher.request_shutdown();
        }
        self.queue.shutdown().await;
    }
}

async fn worker_loop(
    worker_id: usize,
    adapter: Arc<dyn Adapter>,
    queue: Arc<dyn Queue>,
    client: Client,
    squasher: Option<Arc<Squasher>>,
    feedback: Arc<dyn FeedbackCollector>,
    cancel: CancellationToken,
) {
    let failure_count = AtomicU32::new(0);

    loop {
        let qm = match queue.get(&cancel).await {
            Ok(qm) => qm,
            Err(pushgate_queue::QueueError::ShutDown) | Err(pushgate_queue::QueueError::Cancelled) => {
                debug!(service = adapter.id(), worker_id, "worker stopping");
                return;
            }
            Err(e) => {
                error!(service = adapter.id(), worker_id, error = %e, "queue get failed, worker stopping");
                return;
            }
        };

        let msg = match adapter.convert(qm.bytes()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(service = adapter.id(), worker_id, error = %e, "dropping unconvertible message");
                if let Err(e) = queue.remove(qm).await {
                    warn!(service = adapter.id(), error = %e, "failed to remove unconvertible message");
                }
                continue;
            }
        };

        let (qm, msg) = match &squasher {
            Some(s) => match s.prepare_to_push(queue.clone(), qm, client.clone(), msg) {
                Admission::Squashed => {
                    failure_count.store(0, Ordering::SeqCst);
                    continue;
                }
                Admission::Immediate(qm, msg) => (qm, msg),
            },
            None => (qm, msg),
        };

        let status = adapter.push_message(&client, msg.as_ref(), feedback.as_ref()).await;

        match status {
            PushStatus::Success | PushStatus::HardFail => {
                failure_count.store(0, Ordering::SeqCst);
                if let Err(e) = queue.remove(qm).await {
                    warn!(service = adapter.id(), worker_id, error = %e, "failed to remove pushed message");
                }
            }
            PushStatus::TempFail => {
                let n = failure_count.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = queue.requeue(qm).await {
                    error!(service = adapter.id(), worker_id, error = %e, "failed to requeue message after temp failure");
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff_for(n)) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps_at_30s() {
        assert_eq!(backoff_for(0), Duration::from_secs(1));
        assert_eq!(backoff_for(1), Duration::from_secs(2));
        assert_eq!(backoff_for(4), Duration::from_secs(16));
        assert_eq!(backoff_for(5), Duration::from_secs(30));
        assert_eq!(backoff_for(20), Duration::from_secs(30));
    }
}
