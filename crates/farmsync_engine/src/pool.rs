//! Dispatcher lifecycle.
//!
//! The pool owns one tokio task per running dispatcher. Stopping a
//! dispatcher waits for its current attempt to finish; its entries stay in
//! the queue.

use crate::config::DispatchConfig;
use crate::dispatcher::{Dispatcher, TaskPreparer};
use crate::error::EngineResult;
use crate::transport::Transport;
use farmsync_core::{DeliveryTarget, TargetState, TaskLogger};
use farmsync_protocol::ServerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs one dispatcher per enabled target.
pub struct DispatchPool {
    logger: Arc<TaskLogger>,
    transport: Arc<dyn Transport>,
    preparer: Option<Arc<dyn TaskPreparer>>,
    config: DispatchConfig,
    workers: Mutex<HashMap<ServerId, Worker>>,
}

impl DispatchPool {
    /// Creates a pool. Nothing runs until [`DispatchPool::start`].
    pub fn new(logger: Arc<TaskLogger>, transport: Arc<dyn Transport>, config: DispatchConfig) -> Self {
        Self {
            logger,
            transport,
            preparer: None,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the preparer used for staging targets.
    #[must_use]
    pub fn with_preparer(mut self, preparer: Arc<dyn TaskPreparer>) -> Self {
        self.preparer = Some(preparer);
        self
    }

    /// Starts a dispatcher for every enabled target that has none.
    ///
    /// Must be called inside a tokio runtime. Returns the number started.
    pub fn start(&self) -> usize {
        self.logger
            .targets()
            .all()
            .into_iter()
            .filter(|t| t.is_enabled())
            .filter(|t| self.spawn(t))
            .count()
    }

    fn spawn(&self, target: &Arc<TargetState>) -> bool {
        let mut workers = self.workers.lock();
        if workers.contains_key(target.server_id()) {
            return false;
        }

        let (shutdown, receiver) = watch::channel(false);
        let preparer = if target.is_staging() {
            self.preparer.clone()
        } else {
            None
        };
        let dispatcher = Dispatcher {
            target: Arc::clone(target),
            logger: Arc::clone(&self.logger),
            transport: Arc::clone(&self.transport),
            preparer,
            config: self.config.clone(),
            shutdown: receiver,
        };
        let handle = tokio::spawn(dispatcher.run());
        workers.insert(target.server_id().clone(), Worker { shutdown, handle });
        true
    }

    async fn stop(&self, target: &ServerId) -> bool {
        let Some(worker) = self.workers.lock().remove(target) else {
            return false;
        };
        let _ = worker.shutdown.send(true);
        if let Err(e) = worker.handle.await {
            warn!(target = %target, error = %e, "dispatcher task ended abnormally");
        }
        true
    }

    /// Enables a target and starts its dispatcher.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` if it is not configured.
    pub fn enable(&self, target: &ServerId) -> EngineResult<()> {
        let state = self.logger.targets().require(target)?;
        if !state.set_enabled(true) {
            info!(target = %target, "target enabled");
        }
        self.spawn(&state);
        Ok(())
    }

    /// Disables a target and stops its dispatcher after the current
    /// attempt. Queued entries are kept.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` if it is not configured.
    pub async fn disable(&self, target: &ServerId) -> EngineResult<()> {
        let state = self.logger.targets().require(target)?;
        if state.set_enabled(false) {
            info!(target = %target, queued = state.queue().len(), "target disabled");
        }
        self.stop(target).await;
        Ok(())
    }

    /// Adds a target at runtime and starts its dispatcher if enabled.
    ///
    /// # Errors
    ///
    /// `DuplicateTarget` if the id is taken.
    pub fn add_target(&self, target: DeliveryTarget) -> EngineResult<()> {
        let state = self.logger.targets().add(target)?;
        info!(target = %state.server_id(), "target added");
        if state.is_enabled() {
            self.spawn(&state);
        }
        Ok(())
    }

    /// Abandons every entry of a target. Its dispatcher keeps running if
    /// the target is enabled.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` or journal errors.
    pub async fn purge(&self, target: &ServerId) -> EngineResult<usize> {
        let was_running = self.stop(target).await;
        let abandoned = self.logger.purge_target(target);
        if was_running {
            if let Some(state) = self.logger.targets().get(target) {
                self.spawn(&state);
            }
        }
        Ok(abandoned?)
    }

    /// Stops a target's dispatcher, purges it and removes it.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` or journal errors.
    pub async fn remove_target(&self, target: &ServerId) -> EngineResult<usize> {
        self.stop(target).await;
        Ok(self.logger.remove_target(target)?)
    }

    /// Targets with a running dispatcher.
    pub fn running(&self) -> Vec<ServerId> {
        let mut running: Vec<_> = self.workers.lock().keys().cloned().collect();
        running.sort();
        running
    }

    /// The logger this pool drains.
    pub fn logger(&self) -> &Arc<TaskLogger> {
        &self.logger
    }

    /// Stops every dispatcher, waiting for in-flight attempts.
    pub async fn shutdown(&self) {
        let targets: Vec<_> = self.workers.lock().keys().cloned().collect();
        for target in targets {
            self.stop(&target).await;
        }
        info!("dispatch pool stopped");
    }
}
