//! Per-target dispatcher.
//!
//! One dispatcher runs per enabled target. It is the only consumer of the
//! target's delivery queue:
//!
//! 1. take the head batch (entries become `InFlight`)
//! 2. let the [`TaskPreparer`] rewrite it (staging targets only)
//! 3. send it with a bounded timeout
//! 4. remove and journal the acked prefix
//! 5. on any failure mark the head `Failed`, back off and try again
//!
//! Shutdown is only observed while waiting; an attempt that already
//! started always finishes.

use crate::config::DispatchConfig;
use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;
use farmsync_core::{unix_millis, SyncEvent, TargetState, TaskLogger};
use farmsync_protocol::{ApplyRequest, ApplyResponse, NackCode, SequenceId, Task, TaskAck};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Upper bound on dependency rounds before a batch is sent.
const MAX_DEPENDENCY_ROUNDS: usize = 8;

/// Result of [`TaskPreparer::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    /// Send these tasks, a prefix of the batch with rewritten payloads.
    Ready(Vec<Task>),
    /// Send these dependency upserts first, then prepare again.
    Dependencies(Vec<Task>),
}

/// Rewrites outgoing batches for a target.
pub trait TaskPreparer: Send + Sync {
    /// Prepares a batch taken from the head of the target's queue.
    fn prepare(&self, target: &TargetState, batch: Vec<Task>) -> EngineResult<Preparation>;

    /// Sees the response to every request sent to the target.
    fn observe(&self, target: &TargetState, sent: &[Task], response: &ApplyResponse);
}

fn nack_error(nack: &TaskAck) -> EngineError {
    let (code, message) = nack
        .error
        .as_ref()
        .map_or((NackCode::HandlerFailed, String::new()), |e| {
            (e.code, e.message.clone())
        });
    EngineError::Nack {
        sequence_id: SequenceId(nack.sequence_id),
        code,
        message,
    }
}

pub(crate) struct Dispatcher {
    pub(crate) target: Arc<TargetState>,
    pub(crate) logger: Arc<TaskLogger>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) preparer: Option<Arc<dyn TaskPreparer>>,
    pub(crate) config: DispatchConfig,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub(crate) async fn run(mut self) {
        let target_id = self.target.server_id().clone();
        info!(target = %target_id, "dispatcher started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let batch = self.target.queue().take_batch(self.config.batch_size);
            if batch.is_empty() {
                tokio::select! {
                    _ = self.target.queue().notified() => continue,
                    _ = self.shutdown.changed() => break,
                }
            }

            let wait = match self.attempt(batch).await {
                Ok(()) => continue,
                Err(e) => self.record_failure(&e),
            };

            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.target.queue().reset_in_flight();
        info!(target = %target_id, "dispatcher stopped");
    }

    async fn attempt(&self, batch: Vec<Task>) -> EngineResult<()> {
        let tasks = match &self.preparer {
            Some(preparer) => self.prepare(preparer.as_ref(), batch).await?,
            None => batch,
        };

        let response = self.send(&tasks).await?;
        if let Some(preparer) = &self.preparer {
            preparer.observe(&self.target, &tasks, &response);
        }

        let acked = response.acked_prefix().min(tasks.len());
        if acked > 0 {
            self.complete(acked);
        }

        match response.first_nack() {
            Some(nack) if acked < tasks.len() => Err(nack_error(nack)),
            _ if acked < tasks.len() => Err(EngineError::transport_retryable(format!(
                "{} of {} tasks acknowledged",
                acked,
                tasks.len()
            ))),
            _ => {
                // Entries the preparer held back go back to waiting.
                self.target.queue().reset_in_flight();
                Ok(())
            }
        }
    }

    async fn prepare(&self, preparer: &dyn TaskPreparer, batch: Vec<Task>) -> EngineResult<Vec<Task>> {
        for _ in 0..MAX_DEPENDENCY_ROUNDS {
            match preparer.prepare(&self.target, batch.clone())? {
                Preparation::Ready(tasks) => return Ok(tasks),
                Preparation::Dependencies(dependencies) => {
                    debug!(
                        target = %self.target.server_id(),
                        count = dependencies.len(),
                        "sending dependencies ahead of batch"
                    );
                    let response = self.send(&dependencies).await?;
                    preparer.observe(&self.target, &dependencies, &response);
                    if let Some(nack) = response.first_nack() {
                        return Err(nack_error(nack));
                    }
                }
            }
        }
        Err(EngineError::DependencyChain {
            depth: MAX_DEPENDENCY_ROUNDS,
        })
    }

    async fn send(&self, tasks: &[Task]) -> EngineResult<ApplyResponse> {
        let request = ApplyRequest::new(tasks);
        self.logger.stats().record_batch_sent();
        let limit = self.config.attempt_timeout;
        timeout(limit, self.transport.send(self.target.config(), &request))
            .await
            .map_err(|_| EngineError::Timeout(limit))?
    }

    fn complete(&self, acked: usize) {
        let delivered = self.target.queue().complete(acked);
        if let Err(e) = self
            .logger
            .record_delivered(self.target.server_id(), &delivered)
        {
            warn!(target = %self.target.server_id(), error = %e, "delivery not journaled");
        }
        self.target.record_delivery(unix_millis());

        if !self.target.set_reachable(true) {
            info!(target = %self.target.server_id(), "target reachable again");
            self.logger.events().emit(SyncEvent::TargetRecovered {
                target: self.target.server_id().clone(),
            });
        }
        debug!(target = %self.target.server_id(), delivered = delivered.len(), "batch delivered");
    }

    /// Marks the first unacked entry failed and returns how long to wait.
    fn record_failure(&self, error: &EngineError) -> Duration {
        let target = self.target.server_id().clone();
        self.logger.stats().record_delivery_failure();
        let Some((head, retry_count)) = self.target.queue().fail_head() else {
            warn!(target = %target, error = %error, "delivery failed with nothing in flight");
            return self.config.retry.wait_after(1);
        };
        let events = self.logger.events();

        if let EngineError::MissingDependency {
            object_type,
            source_id,
            ..
        } = error
        {
            events.emit(SyncEvent::MissingDependency {
                target: target.clone(),
                sequence_id: head,
                object_type: object_type.clone(),
                source_id: *source_id,
            });
        }

        let max_retries = self.config.retry.max_retries;
        if retry_count >= max_retries && self.target.set_reachable(false) {
            error!(
                target = %target,
                sequence_id = %head,
                retry_count,
                error = %error,
                "target unreachable, entries kept queued"
            );
            events.emit(SyncEvent::TargetUnreachable {
                target: target.clone(),
                sequence_id: head,
                retry_count,
                error: error.to_string(),
            });
        } else if error.is_retryable() {
            warn!(target = %target, sequence_id = %head, retry_count, error = %error, "delivery failed");
        } else {
            error!(target = %target, sequence_id = %head, retry_count, error = %error, "delivery failed");
        }

        events.emit(SyncEvent::DeliveryFailed {
            target,
            sequence_id: head,
            retry_count,
            error: error.to_string(),
        });
        self.config.retry.wait_after(retry_count)
    }
}
