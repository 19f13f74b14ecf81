//! Orchestrator: a fixed pool of workers pulling scene ids off a queue.
//!
//! Each worker loops receive → drill → write → ack/fail. Workers share the
//! executor, writer and queue read-only and never coordinate directly; the
//! queue lease keeps a scene with one worker at a time. While a scene is
//! being drilled its lease is renewed every half visibility timeout.

use std::future::Future;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use conflux_common::{ConfluxError, ConfluxResult, OutputBatch};
use storage::{FailOutcome, SceneMessage, SceneQueue};

use crate::executor::DrillExecutor;
use crate::writer::Writer;

/// Default consecutive empty receives before a worker stops.
pub const DEFAULT_MAX_IDLE_POLLS: u32 = 10;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workers: usize,
    /// Messages requested per receive.
    pub receive_batch: usize,
    /// Stop a worker after this many consecutive empty receives; `None` runs forever.
    pub max_idle_polls: Option<u32>,
    /// Drill scenes even when their output is already committed.
    pub overwrite: bool,
    /// Pause after an empty receive.
    pub idle_backoff: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            receive_batch: 1,
            max_idle_polls: Some(DEFAULT_MAX_IDLE_POLLS),
            overwrite: false,
            idle_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Batch written and message acked.
    Committed,
    /// Output already present; acked without drilling.
    Skipped,
    /// Returned to the queue for another delivery.
    Retried,
    /// Moved to the dead-letter destination.
    DeadLettered,
    /// The lease was gone before the message could be settled; the queue
    /// will deliver it again.
    LeaseLost,
}

/// Per-outcome message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub committed: u64,
    pub skipped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
}

impl RunStats {
    pub fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Committed => self.committed += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::Retried => self.retried += 1,
            MessageOutcome::DeadLettered => self.dead_lettered += 1,
            MessageOutcome::LeaseLost => self.lease_lost += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.committed + self.skipped + self.retried + self.dead_lettered + self.lease_lost
    }
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, other: Self) {
        self.committed += other.committed;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.lease_lost += other.lease_lost;
    }
}

/// Owns the worker pool for `run-from-queue`.
pub struct Orchestrator {
    queue: Arc<dyn SceneQueue>,
    executor: Arc<DrillExecutor>,
    writer: Writer,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn SceneQueue>,
        executor: Arc<DrillExecutor>,
        writer: Writer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            writer,
            config,
        }
    }

    /// Run the worker pool until every worker has gone idle or shutdown is
    /// signalled. A closed shutdown channel counts as a signal. Workers
    /// finish the message in hand before stopping.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> ConfluxResult<RunStats> {
        let workers = self.config.workers.max(1);
        info!(
            queue = %self.queue.name(),
            workers = workers,
            destination = %self.writer.describe(),
            "Starting drill workers"
        );

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let this = self.clone();
            let rx = shutdown.resubscribe();
            handles.push(tokio::spawn(async move { this.worker_loop(worker, rx).await }));
        }

        let mut total = RunStats::default();
        for handle in handles {
            total += handle
                .await
                .map_err(|e| ConfluxError::InternalError(format!("Worker task failed: {}", e)))?;
        }

        info!(
            committed = total.committed,
            skipped = total.skipped,
            retried = total.retried,
            dead_lettered = total.dead_lettered,
            lease_lost = total.lease_lost,
            "Drill workers finished"
        );
        Ok(total)
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: broadcast::Receiver<()>) -> RunStats {
        let mut stats = RunStats::default();
        let mut idle_polls = 0u32;

        loop {
            let received = tokio::select! {
                _ = shutdown.recv() => {
                    info!(worker = worker, "Shutdown requested; worker stopping");
                    break;
                }
                received = self.queue.receive(self.config.receive_batch.max(1)) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(worker = worker, error = %e, "Queue receive failed");
                    tokio::time::sleep(self.config.error_backoff).await;
                    continue;
                }
            };

            if messages.is_empty() {
                idle_polls += 1;
                if self.config.max_idle_polls.is_some_and(|max| idle_polls >= max) {
                    info!(worker = worker, idle_polls = idle_polls, "Queue idle; worker stopping");
                    break;
                }
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(self.config.idle_backoff) => continue,
                }
            }

            idle_polls = 0;
            for message in &messages {
                let outcome = self.process(worker, message).await;
                stats.record(outcome);
            }
        }

        stats
    }

    /// Take one message through to a terminal queue operation.
    pub async fn process(&self, worker: usize, message: &SceneMessage) -> MessageOutcome {
        let spec = self.executor.plugin().spec();
        debug!(
            worker = worker,
            scene_id = %message.scene_id,
            delivery_count = message.delivery_count,
            "Processing scene"
        );

        if message.delivery_count > self.queue.config().max_deliveries {
            let err = ConfluxError::InternalError(format!(
                "delivered {} times, more than the allowed {}",
                message.delivery_count,
                self.queue.config().max_deliveries
            ));
            return self.handle_failure(message, &err).await;
        }

        if !self.config.overwrite {
            match self.writer.is_committed(&message.scene_id, spec).await {
                Ok(true) => {
                    info!(scene_id = %message.scene_id, "Output already committed; skipping");
                    return match self.queue.ack(message).await {
                        Ok(()) => {
                            metrics::counter!("conflux_scenes_skipped_total").increment(1);
                            MessageOutcome::Skipped
                        }
                        Err(e) => self.lease_lost(message, &e),
                    };
                }
                Ok(false) => {}
                Err(e) => return self.handle_failure(message, &e).await,
            }
        }

        let attempt = async {
            let batch = self.executor.drill(&message.scene_id).await?;
            self.writer.write(&batch).await
        };

        match self.with_lease(message, attempt).await {
            Ok(()) => match self.queue.ack(message).await {
                Ok(()) => {
                    metrics::counter!("conflux_scenes_committed_total").increment(1);
                    MessageOutcome::Committed
                }
                Err(e) => self.lease_lost(message, &e),
            },
            Err(e) => self.handle_failure(message, &e).await,
        }
    }

    /// Drive `work` while renewing the message's lease every half visibility timeout.
    async fn with_lease<F, T>(&self, message: &SceneMessage, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let visibility = self.queue.config().visibility_timeout();
        let period = (visibility / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = ticker.tick() => {
                    match self.queue.extend(message, visibility).await {
                        Ok(()) => debug!(scene_id = %message.scene_id, "Extended lease"),
                        Err(e) => warn!(
                            scene_id = %message.scene_id,
                            error = %e,
                            "Failed to extend lease; scene may be delivered again"
                        ),
                    }
                }
            }
        }
    }

    async fn handle_failure(&self, message: &SceneMessage, err: &ConfluxError) -> MessageOutcome {
        let reason = err.to_string();
        match self.queue.fail(message, &reason).await {
            Ok(FailOutcome::Requeued) => {
                metrics::counter!("conflux_scenes_retried_total").increment(1);
                warn!(
                    scene_id = %message.scene_id,
                    delivery_count = message.delivery_count,
                    class = ?err.class(),
                    error = %err,
                    "Scene failed; returned to queue"
                );
                MessageOutcome::Retried
            }
            Ok(FailOutcome::DeadLettered) => {
                metrics::counter!("conflux_scenes_dead_lettered_total").increment(1);
                error!(
                    scene_id = %message.scene_id,
                    delivery_count = message.delivery_count,
                    class = ?err.class(),
                    reason = %reason,
                    "Scene dead-lettered"
                );
                MessageOutcome::DeadLettered
            }
            Err(e) => self.lease_lost(message, &e),
        }
    }

    fn lease_lost(&self, message: &SceneMessage, err: &ConfluxError) -> MessageOutcome {
        warn!(
            scene_id = %message.scene_id,
            delivery_count = message.delivery_count,
            error = %err,
            "Could not settle message; the queue will deliver it again"
        );
        MessageOutcome::LeaseLost
    }
}

/// Drill and commit one scene outside the queue (`run-one`).
///
/// Uses the same partial-failure policy as the queue path: polygon failures
/// are logged and omitted, scene-level failures are returned. `Ok(None)`
/// means the output was already committed and `overwrite` is off.
pub async fn run_one(
    executor: &DrillExecutor,
    writer: &Writer,
    scene_id: &str,
    overwrite: bool,
) -> ConfluxResult<Option<OutputBatch>> {
    if !overwrite && writer.is_committed(scene_id, executor.plugin().spec()).await? {
        info!(scene_id = %scene_id, "Output already committed; skipping");
        return Ok(None);
    }
    let batch = executor.drill(scene_id).await?;
    writer.write(&batch).await?;
    Ok(Some(batch))
}
