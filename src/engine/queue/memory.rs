use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::engine::{
    models::Priority,
    queue::{Delivery, QueueBackend, QueueError},
};

/// Single-process queue used for standalone deployments and tests. Idle consumers are
/// woken as soon as a job lands in any lane.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

#[derive(Default)]
struct QueueState {
    lanes: [VecDeque<String>; 3],
    in_flight: HashMap<String, Vec<(Priority, String)>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueState {
    fn take_in_flight(&mut self, delivery: &Delivery) -> bool {
        let Some(claimed) = self.in_flight.get_mut(&delivery.consumer) else {
            return false;
        };
        let Some(pos) = claimed
            .iter()
            .position(|(priority, raw)| *priority == delivery.priority && *raw == delivery.raw)
        else {
            return false;
        };
        claimed.remove(pos);
        if claimed.is_empty() {
            self.in_flight.remove(&delivery.consumer);
        }
        true
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn push(&self, priority: Priority, raw: String) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.lanes[priority.index()].push_back(raw);
        self.ready.notify_one();
        Ok(())
    }

    async fn claim(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        for priority in Priority::ALL {
            if let Some(raw) = state.lanes[priority.index()].pop_front() {
                state
                    .in_flight
                    .entry(consumer.to_string())
                    .or_default()
                    .push((priority, raw.clone()));
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
        let mut state = self.state.lock().await;
        state.take_in_flight(delivery);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.take_in_flight(delivery) {
            state.lanes[delivery.priority.index()].push_front(delivery.raw.clone());
        }
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let Some(claimed) = state.in_flight.remove(consumer) else {
            return Ok(0);
        };
        let count = claimed.len();
        for (priority, raw) in claimed.into_iter().rev() {
            state.lanes[priority.index()].push_front(raw);
        }
        self.ready.notify_one();
        Ok(count)
    }

    async fn depth(&self, priority: Priority) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok(state.lanes[priority.index()].len() as u64)
    }

    async fn wait_for_work(&self, idle: Duration) {
        let _ = tokio::time::timeout(idle, self.ready.notified()).await;
    }
}
