//! Service registry: owns one [`Pump`] + queue per registered provider
//! and coordinates shutdown across all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use pushgate_config::SquashConfig;
use pushgate_core::FeedbackCollector;
use pushgate_queue::memory::MemoryQueue;
use pushgate_queue::redis::RedisQueue;
use pushgate_queue::Queue;
use tracing::info;

use crate::adapter::Adapter;
use crate::error::DispatchError;
use crate::pump::Pump;
use crate::squasher::Squasher;

struct Service {
    queue: Arc<dyn Queue>,
    pump: Arc<Pump>,
}

/// Holds every registered provider's queue + pump and the backing store
/// selection (shared in-memory, or one Redis connection per service).
pub struct Registry {
    redis_url: Option<String>,
    queue_key_prefix: String,
    services: RwLock<HashMap<String, Service>>,
}

impl Registry {
    pub fn new(redis_url: Option<String>, queue_key_prefix: String) -> Self {
        Self {
            redis_url,
            queue_key_prefix,
            services: RwLock::new(HashMap::new()),
        }
    }

    async fn build_queue(&self, service_id: &str) -> Result<Arc<dyn Queue>, DispatchError> {
        match &self.redis_url {
            Some(url) => {
                let q = RedisQueue::connect(url, service_id, &self.queue_key_prefix)
                    .await
                    .map_err(DispatchError::from)?;
                Ok(Arc::new(q))
            }
            None => Ok(Arc::new(MemoryQueue::new())),
        }
    }

    /// Registers and starts a provider: builds its queue, an optional
    /// squasher, and `workers` pump tasks. Errors if `adapter.id()` is
    /// already registered.
    pub async fn add_service(
        &self,
        adapter: Arc<dyn Adapter>,
        workers: usize,
        squash: Option<SquashConfig>,
        feedback: Arc<dyn FeedbackCollector>,
    ) -> Result<(), DispatchError> {
        let id = adapter.id().to_string();
        if self.services.read().contains_key(&id) {
            return Err(DispatchError::DuplicateService(id));
        }

        let queue = self.build_queue(&id).await?;
        let squasher = match squash {
            Some(cfg) if adapter.supports_squash() => Some(Arc::new(Squasher::new(
                adapter.clone(),
                cfg.rate_max,
                Duration::from_secs(cfg.rate_per_seconds),
            ))),
            _ => None,
        };

        let squashed = squasher.is_some();
        let pump = Arc::new(Pump::new(adapter.clone(), queue.clone(), workers, squasher));
        info!(service = %id, workers, squashed, "registering service");

        let pump_for_task = pump.clone();
        let feedback_for_task = feedback;
        tokio::spawn(async move {
            pump_for_task.serve(feedback_for_task).await;
        });

        self.services.write().insert(id, Service { queue, pump });
        Ok(())
    }

    pub fn queue_for(&self, service_id: &str) -> Option<Arc<dyn Queue>> {
        self.services.read().get(service_id).map(|s| s.queue.clone())
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services.read().contains_key(service_id)
    }

    /// Cancels every pump's workers and shuts down every queue. Call
    /// after the HTTP listener has stopped accepting admissions.
    pub async fn shutdown_all(&self) {
        let pumps: Vec<Arc<Pump>> = self.services.read().values().map(|s| s.pump.clone()).collect();
        for pump in pumps {
            pump.shutdown().await;
        }
    }
}
