use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};

use crate::engine::{
    models::Priority,
    queue::{Delivery, QueueBackend, QueueError},
};

// Producers LPUSH, consumers take from the right, so the right end is the head of a lane.
const NACK_LUA: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed > 0 then
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
return removed
"#;

const RECOVER_LUA: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT') do
  moved = moved + 1
end
return moved
"#;

/// Reliable-queue pattern over Redis lists: every claim is moved atomically into a
/// per-consumer processing list and only removed from it on ack.
pub struct RedisQueue {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisQueue {
    pub async fn connect(url: String, key_prefix: String) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
        })
    }

    fn lane_key(&self, priority: Priority) -> String {
        format!("{}:queue:{}", self.key_prefix, priority.queue_name())
    }

    fn processing_key(&self, consumer: &str, priority: Priority) -> String {
        format!(
            "{}:processing:{}:{}",
            self.key_prefix,
            consumer,
            priority.queue_name()
        )
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(QueueError::Backend(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    async fn push(&self, priority: Priority, raw: String) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.lane_key(priority))
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.manager.clone();
        for priority in Priority::ALL {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(self.lane_key(priority))
                .arg(self.processing_key(consumer, priority))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if let Some(raw) = raw {
                return Ok(Some(Delivery {
                    priority,
                    consumer: consumer.to_string(),
                    raw,
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(self.processing_key(&delivery.consumer, delivery.priority))
            .arg(1)
            .arg(&delivery.raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = Script::new(NACK_LUA)
            .key(self.processing_key(&delivery.consumer, delivery.priority))
            .key(self.lane_key(delivery.priority))
            .arg(&delivery.raw)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut conn = self.manager.clone();
        let mut total = 0usize;
        for priority in Priority::ALL {
            let moved: i64 = Script::new(RECOVER_LUA)
                .key(self.processing_key(consumer, priority))
                .key(self.lane_key(priority))
                .invoke_async(&mut conn)
                .await?;
            total += moved.max(0) as usize;
        }
        Ok(total)
    }

    async fn depth(&self, priority: Priority) -> Result<u64, QueueError> {
        let mut conn = self.manager.clone();
        let len: i64 = redis::cmd("LLEN")
            .arg(self.lane_key(priority))
            .query_async(&mut conn)
            .await?;
        Ok(len.max(0) as u64)
    }
}
