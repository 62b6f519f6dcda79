//! Delivery targets and their runtime state.

use crate::error::{CoreError, CoreResult};
use crate::queue::DeliveryQueue;
use crate::review::ReviewQueue;
use farmsync_protocol::{GroupTag, ServerId, Task};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How tasks for a staging target are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingMode {
    /// Tasks are queued for delivery immediately.
    #[default]
    Automatic,
    /// Tasks wait in a review queue until an operator approves them.
    Manual,
}

/// Kind of destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    /// Another node of the same web farm (same database).
    #[default]
    Farm,
    /// A separate environment with its own database.
    Staging,
}

/// Configured destination node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    /// Identity of the destination.
    pub server_id: ServerId,
    /// Base URL of its apply endpoint, e.g. `http://node-2:7700`.
    pub base_url: String,
    /// Whether tasks are fanned out to it.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Subscribed groups; empty means every task.
    #[serde(default)]
    pub groups: Vec<GroupTag>,
    /// Shared secret used to sign requests.
    pub token: String,
    /// Farm peer or staging environment.
    #[serde(default)]
    pub role: TargetRole,
    /// Release mode; only meaningful for staging targets.
    #[serde(default)]
    pub mode: StagingMode,
}

fn enabled_default() -> bool {
    true
}

impl DeliveryTarget {
    /// Creates an enabled farm target.
    pub fn farm(
        server_id: impl Into<ServerId>,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            base_url: base_url.into(),
            enabled: true,
            groups: Vec::new(),
            token: token.into(),
            role: TargetRole::Farm,
            mode: StagingMode::Automatic,
        }
    }

    /// Creates an enabled staging target.
    pub fn staging(
        server_id: impl Into<ServerId>,
        base_url: impl Into<String>,
        token: impl Into<String>,
        mode: StagingMode,
    ) -> Self {
        Self {
            role: TargetRole::Staging,
            mode,
            ..Self::farm(server_id, base_url, token)
        }
    }

    /// Sets the group subscription.
    #[must_use]
    pub fn with_groups<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupTag>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the initial enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns true if a task with `groups` should reach this target.
    #[must_use]
    pub fn subscribes_to(&self, groups: &[GroupTag]) -> bool {
        groups.is_empty() || self.groups.is_empty() || groups.iter().any(|g| self.groups.contains(g))
    }
}

/// A configured target plus its queues and delivery status.
#[derive(Debug)]
pub struct TargetState {
    config: DeliveryTarget,
    enabled: AtomicBool,
    reachable: AtomicBool,
    last_successful_delivery: Mutex<Option<u64>>,
    queue: DeliveryQueue,
    review: ReviewQueue,
}

impl TargetState {
    /// Creates runtime state for a configured target.
    pub fn new(config: DeliveryTarget, max_pending: usize) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            reachable: AtomicBool::new(true),
            last_successful_delivery: Mutex::new(None),
            queue: DeliveryQueue::new(max_pending),
            review: ReviewQueue::new(),
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DeliveryTarget {
        &self.config
    }

    /// Returns the target's server id.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.config.server_id
    }

    /// Returns true if this is a staging target held for manual review.
    #[must_use]
    pub fn is_manual_staging(&self) -> bool {
        self.config.role == TargetRole::Staging && self.config.mode == StagingMode::Manual
    }

    /// Returns true if this is a staging target.
    #[must_use]
    pub fn is_staging(&self) -> bool {
        self.config.role == TargetRole::Staging
    }

    /// Returns true if tasks are fanned out to this target.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enables or disables fan-out; returns the previous value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }

    /// Returns false once delivery exceeded its retry bound.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Sets reachability; returns the previous value.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        self.reachable.swap(reachable, Ordering::SeqCst)
    }

    /// Records a successful delivery at `now` (Unix millis).
    pub fn record_delivery(&self, now: u64) {
        *self.last_successful_delivery.lock() = Some(now);
    }

    /// Time of the last successful delivery (Unix millis).
    #[must_use]
    pub fn last_successful_delivery(&self) -> Option<u64> {
        *self.last_successful_delivery.lock()
    }

    /// The delivery queue.
    #[must_use]
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// The review queue (only used by manual staging targets).
    #[must_use]
    pub fn review(&self) -> &ReviewQueue {
        &self.review
    }
}

/// All configured targets of this node.
#[derive(Debug)]
pub struct TargetSet {
    targets: RwLock<BTreeMap<ServerId, Arc<TargetState>>>,
    max_pending: usize,
}

impl TargetSet {
    /// Creates an empty set whose queues hold at most `max_pending`
    /// non-critical entries.
    pub fn new(max_pending: usize) -> Self {
        Self {
            targets: RwLock::new(BTreeMap::new()),
            max_pending,
        }
    }

    /// Creates a set from configuration.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTarget` if a server id appears twice.
    pub fn from_config(
        targets: impl IntoIterator<Item = DeliveryTarget>,
        max_pending: usize,
    ) -> CoreResult<Self> {
        let set = Self::new(max_pending);
        for target in targets {
            set.add(target)?;
        }
        Ok(set)
    }

    /// Adds a target.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTarget` if the server id is already configured.
    pub fn add(&self, target: DeliveryTarget) -> CoreResult<Arc<TargetState>> {
        let mut targets = self.targets.write();
        if targets.contains_key(&target.server_id) {
            return Err(CoreError::DuplicateTarget {
                target: target.server_id,
            });
        }
        let state = Arc::new(TargetState::new(target, self.max_pending));
        targets.insert(state.server_id().clone(), Arc::clone(&state));
        Ok(state)
    }

    /// Removes a target. Its queues are dropped with it.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTarget` if it is not configured.
    pub fn remove(&self, server_id: &ServerId) -> CoreResult<Arc<TargetState>> {
        self.targets
            .write()
            .remove(server_id)
            .ok_or_else(|| CoreError::unknown_target(server_id))
    }

    /// Looks up a target.
    #[must_use]
    pub fn get(&self, server_id: &ServerId) -> Option<Arc<TargetState>> {
        self.targets.read().get(server_id).cloned()
    }

    /// Looks up a target, failing with `UnknownTarget`.
    pub fn require(&self, server_id: &ServerId) -> CoreResult<Arc<TargetState>> {
        self.get(server_id)
            .ok_or_else(|| CoreError::unknown_target(server_id))
    }

    /// All targets in server id order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<TargetState>> {
        self.targets.read().values().cloned().collect()
    }

    /// Targets whose subscription matches the task's groups.
    ///
    /// Best-effort tasks only go to enabled targets. Critical tasks also
    /// queue up for disabled ones and wait there until the target is
    /// enabled again or purged. The origin itself never receives its own
    /// tasks.
    #[must_use]
    pub fn recipients(&self, task: &Task, critical: bool) -> Vec<Arc<TargetState>> {
        self.targets
            .read()
            .values()
            .filter(|t| {
                (critical || t.is_enabled())
                    && t.server_id() != &task.origin
                    && t.config.subscribes_to(&task.groups)
            })
            .cloned()
            .collect()
    }

    /// Number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    /// Returns true if no target is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_protocol::{SequenceId, TaskKindId};

    fn task(groups: &[&str]) -> Task {
        Task {
            sequence_id: SequenceId(1),
            kind: TaskKindId::new("cache.invalidate"),
            object_type: "cache".into(),
            target_key: "page:42".into(),
            payload: Vec::new(),
            origin: "node-1".into(),
            created_at: 0,
            groups: groups.iter().map(|g| GroupTag::new(*g)).collect(),
            schema_version: 1,
        }
    }

    fn set() -> TargetSet {
        TargetSet::from_config(
            [
                DeliveryTarget::farm("node-2", "http://node-2", "t"),
                DeliveryTarget::farm("node-3", "http://node-3", "t").with_groups(["site-b"]),
                DeliveryTarget::staging("stage", "http://stage", "t", StagingMode::Manual)
                    .with_groups(["site-a"]),
                DeliveryTarget::farm("node-4", "http://node-4", "t").with_enabled(false),
            ],
            100,
        )
        .unwrap()
    }

    fn ids(targets: Vec<Arc<TargetState>>) -> Vec<String> {
        targets.iter().map(|t| t.server_id().to_string()).collect()
    }

    #[test]
    fn untagged_tasks_reach_every_enabled_target() {
        assert_eq!(ids(set().recipients(&task(&[]), false)), ["node-2", "node-3", "stage"]);
    }

    #[test]
    fn tagged_tasks_follow_subscriptions() {
        // node-2 has no subscription and receives everything
        assert_eq!(ids(set().recipients(&task(&["site-a"]), false)), ["node-2", "stage"]);
        assert_eq!(ids(set().recipients(&task(&["site-b"]), false)), ["node-2", "node-3"]);
    }

    #[test]
    fn disabled_targets_only_receive_critical_tasks() {
        let targets = set();
        let node4 = "node-4".to_string();
        assert!(!ids(targets.recipients(&task(&[]), false)).contains(&node4));
        assert_eq!(
            ids(targets.recipients(&task(&[]), true)),
            ["node-2", "node-3", "node-4", "stage"]
        );

        let node4_state = targets.get(&"node-4".into()).unwrap();
        assert!(!node4_state.set_enabled(true));
        assert!(ids(targets.recipients(&task(&[]), false)).contains(&node4));
    }

    #[test]
    fn duplicate_and_unknown_targets() {
        let targets = set();
        assert!(matches!(
            targets.add(DeliveryTarget::farm("node-2", "x", "t")),
            Err(CoreError::DuplicateTarget { .. })
        ));
        assert!(targets.remove(&"node-3".into()).is_ok());
        assert!(matches!(
            targets.require(&"node-3".into()),
            Err(CoreError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn staging_role_flags() {
        let targets = set();
        let stage = targets.get(&"stage".into()).unwrap();
        assert!(stage.is_staging());
        assert!(stage.is_manual_staging());
        assert!(!targets.get(&"node-2".into()).unwrap().is_staging());
    }

    #[test]
    fn role_parses_from_flat_config() {
        let json = r#"{"server_id":"stage","base_url":"http://s","token":"t",
                       "role":"staging","mode":"manual"}"#;
        let target: DeliveryTarget = serde_json::from_str(json).unwrap();
        assert_eq!(target.role, TargetRole::Staging);
        assert_eq!(target.mode, StagingMode::Manual);
        assert!(target.enabled);

        let farm: DeliveryTarget =
            serde_json::from_str(r#"{"server_id":"n","base_url":"u","token":"t"}"#).unwrap();
        assert_eq!(farm.role, TargetRole::Farm);
    }
}
