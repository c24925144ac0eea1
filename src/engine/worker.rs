use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::engine::{
    config::WorkerConfig,
    queue::{Delivery, JobQueue, QueueError},
    service::JudgingService,
};

/// Fixed-size set of consumers. Each worker owns one sandbox slot for its whole life.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Re-queues jobs left unacknowledged by a previous run under the same consumer names,
    /// then starts the workers.
    pub async fn start(
        config: &WorkerConfig,
        queue: JobQueue,
        service: Arc<JudgingService>,
    ) -> Result<Self, QueueError> {
        let (shutdown, stop) = watch::channel(false);
        let poll = Duration::from_millis(config.poll_interval_ms);
        let mut handles = Vec::with_capacity(config.count);

        for worker_id in 0..config.count {
            let consumer = format!("{}-{worker_id}", config.name);
            let recovered = queue.recover(&consumer).await?;
            if recovered > 0 {
                warn!(worker_id, consumer = %consumer, recovered, "re-queued unacknowledged jobs");
            }
            let slot = config.slot_offset + worker_id as u32;
            let queue = queue.clone();
            let service = service.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, slot, consumer, queue, service, poll, stop).await;
            }));
        }
        info!(workers = config.count, backend = queue.backend_name(), "worker pool started");
        Ok(Self { shutdown, handles })
    }

    /// Lets in-flight jobs finish, then waits for every worker to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    slot: u32,
    consumer: String,
    queue: JobQueue,
    service: Arc<JudgingService>,
    poll: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        match queue.claim(&consumer).await {
            // A nacked job waits out the idle period before its next attempt.
            Ok(Some(delivery)) => {
                if process(worker_id, slot, &queue, &service, delivery).await {
                    continue;
                }
            }
            Ok(None) => {}
            Err(err) => warn!(worker_id, error = %err, "claim failed"),
        }
        tokio::select! {
            _ = queue.wait_for_work(poll) => {}
            _ = stop.changed() => {}
        }
    }
    info!(worker_id, "worker exiting");
}

async fn process(
    worker_id: usize,
    slot: u32,
    queue: &JobQueue,
    service: &JudgingService,
    delivery: Delivery,
) -> bool {
    let message = match delivery.decode() {
        Ok(message) => message,
        Err(err) => {
            // A payload that cannot be decoded will never succeed; drop it.
            error!(worker_id, queue = delivery.priority.queue_name(), error = %err, "discarding malformed job");
            if let Err(err) = queue.ack(&delivery).await {
                warn!(worker_id, error = %err, "ack failed");
            }
            return true;
        }
    };

    match service.handle(message, slot).await {
        Ok(()) => {
            if let Err(err) = queue.ack(&delivery).await {
                warn!(worker_id, error = %err, "ack failed; job may be redelivered");
            }
            true
        }
        Err(err) => {
            error!(worker_id, slot, error = %err, "job failed before its verdict was persisted");
            if let Err(err) = queue.nack(&delivery).await {
                warn!(worker_id, error = %err, "nack failed; job stays claimed until recovery");
            }
            false
        }
    }
}
