pub mod memory;
pub mod redis_backend;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::engine::{
    config::{QueueBackendConfig, QueueConfig},
    models::{JobMessage, Priority},
};

pub use memory::InMemoryQueue;
pub use redis_backend::RedisQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("job codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// A claimed job. It stays owned by `consumer` until acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub priority: Priority,
    pub consumer: String,
    pub raw: String,
}

impl Delivery {
    pub fn decode(&self) -> Result<JobMessage, QueueError> {
        Ok(serde_json::from_str(&self.raw)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub critical: u64,
    pub default: u64,
    pub low: u64,
}

impl QueueDepths {
    pub fn total(&self) -> u64 {
        self.critical + self.default + self.low
    }

    fn set(&mut self, priority: Priority, depth: u64) {
        match priority {
            Priority::Critical => self.critical = depth,
            Priority::Default => self.default = depth,
            Priority::Low => self.low = depth,
        }
    }
}

/// Storage for the three priority lanes. Claims are exclusive: a raw job is
/// handed to exactly one consumer until it is acked, nacked or recovered.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<(), QueueError>;

    async fn push(&self, priority: Priority, raw: String) -> Result<(), QueueError>;

    /// Takes the oldest job of the highest non-empty class.
    async fn claim(&self, consumer: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Returns the job to the head of its lane for another attempt.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Re-queues everything `consumer` claimed but never acknowledged.
    async fn recover(&self, consumer: &str) -> Result<usize, QueueError>;

    async fn depth(&self, priority: Priority) -> Result<u64, QueueError>;

    /// Idles a consumer that found nothing to claim. Returns after `idle` at the latest,
    /// earlier if the backend learns of new work.
    async fn wait_for_work(&self, idle: Duration) {
        tokio::time::sleep(idle).await;
    }
}

/// Explicitly constructed queue client handed to the producer and to every worker.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    pub async fn from_config(config: &QueueConfig) -> Result<Self, QueueError> {
        let backend: Arc<dyn QueueBackend> = match &config.backend {
            QueueBackendConfig::InMemory => Arc::new(InMemoryQueue::new()),
            QueueBackendConfig::Redis { url, key_prefix } => {
                Arc::new(RedisQueue::connect(url.clone(), key_prefix.clone()).await?)
            }
        };
        Ok(Self::new(backend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.backend.ping().await
    }

    pub async fn wait_for_work(&self, idle: Duration) {
        self.backend.wait_for_work(idle).await
    }

    pub async fn enqueue(&self, priority: Priority, message: &JobMessage) -> Result<(), QueueError> {
        let raw = serde_json::to_string(message)?;
        self.backend.push(priority, raw).await?;
        tracing::debug!(queue = priority.queue_name(), "job enqueued");
        Ok(())
    }

    pub async fn claim(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        self.backend.claim(consumer).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.backend.ack(delivery).await
    }

    pub async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.backend.nack(delivery).await
    }

    pub async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        self.backend.recover(consumer).await
    }

    pub async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let mut depths = QueueDepths::default();
        for priority in Priority::ALL {
            depths.set(priority, self.backend.depth(priority).await?);
        }
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::engine::models::PingPayload;

    fn ping() -> JobMessage {
        JobMessage::Ping(PingPayload {
            nonce: Uuid::new_v4(),
            enqueued_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn critical_job_is_claimed_before_earlier_default_jobs() {
        let queue = JobQueue::new(Arc::new(InMemoryQueue::new()));
        for _ in 0..3 {
            queue.enqueue(Priority::Default, &ping()).await.unwrap();
        }
        let urgent = ping();
        queue.enqueue(Priority::Critical, &urgent).await.unwrap();

        let first = queue.claim("w-0").await.unwrap().unwrap();
        assert_eq!(first.priority, Priority::Critical);
        assert_eq!(first.decode().unwrap(), urgent);

        let depths = queue.depths().await.unwrap();
        assert_eq!(depths.critical, 0);
        assert_eq!(depths.default, 3);
        assert_eq!(depths.total(), 3);
    }

    #[tokio::test]
    async fn malformed_payload_fails_to_decode() {
        let delivery = Delivery {
            priority: Priority::Low,
            consumer: "w-0".to_string(),
            raw: "{\"type\":\"submission:judge\"}".to_string(),
        };
        assert!(matches!(delivery.decode(), Err(QueueError::Codec(_))));
    }
}
