//! Task logger.
//!
//! The logger is the only producer of [`Task`]s. It stamps each captured
//! change with the next sequence id and fans it out to the queue of every
//! matching target. One lock covers sequence assignment, journaling and
//! fan-out, so every queue receives tasks in sequence order.
//!
//! Critical kinds are journaled before any queue sees them; if the journal
//! write fails the task is not queued anywhere and `log` returns
//! `Persistence`. Non-critical kinds live only in memory.

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventFeed, SyncEvent};
use crate::journal::{Journal, JournalRecord, JournalReplay};
use crate::queue::{EnqueueOutcome, QueueEntry};
use crate::registry::{OptimizationPolicy, RegisteredKind, TaskRegistry};
use crate::stats::SyncStats;
use crate::target::{TargetSet, TargetState};
use crate::unix_millis;
use crate::versions::VersionLedger;
use farmsync_protocol::{GroupTag, SequenceId, ServerId, Task, TaskKindId};
use farmsync_storage::StorageBackend;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A change that has not been logged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDraft {
    /// Registered kind.
    pub kind: TaskKindId,
    /// Affected object type.
    pub object_type: String,
    /// Affected key.
    pub target_key: String,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
    /// Routing tags.
    pub groups: Vec<GroupTag>,
}

impl TaskDraft {
    /// Creates a draft without groups.
    pub fn new(
        kind: impl Into<TaskKindId>,
        object_type: impl Into<String>,
        target_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: kind.into(),
            object_type: object_type.into(),
            target_key: target_key.into(),
            payload,
            groups: Vec::new(),
        }
    }

    /// Sets routing tags.
    #[must_use]
    pub fn with_groups<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupTag>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// What [`TaskLogger::open`] restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Journal records read.
    pub records_replayed: usize,
    /// Entries put back into delivery queues.
    pub entries_restored: usize,
    /// Entries put back into review queues.
    pub held_restored: usize,
    /// Entries for targets that are no longer configured.
    pub orphaned: usize,
    /// Bytes of an incomplete trailing record that were discarded.
    pub torn_bytes: u64,
    /// First sequence id the recovered logger hands out.
    pub next_sequence: SequenceId,
}

#[derive(Debug)]
struct SequenceState {
    next: u64,
    reserved_up_to: u64,
}

/// Assigns sequence ids and fans tasks out to delivery targets.
pub struct TaskLogger {
    config: CoreConfig,
    registry: Arc<TaskRegistry>,
    targets: Arc<TargetSet>,
    journal: Option<Journal>,
    sequence: Mutex<SequenceState>,
    dead_records: AtomicU64,
    events: Arc<EventFeed>,
    stats: Arc<SyncStats>,
    versions: Arc<VersionLedger>,
}

impl TaskLogger {
    /// Creates a logger without a journal. Nothing survives a restart.
    pub fn in_memory(
        config: CoreConfig,
        registry: Arc<TaskRegistry>,
        targets: Arc<TargetSet>,
    ) -> Self {
        Self::build(config, registry, targets, None, 1, 0)
    }

    /// Opens a durable logger, replaying the journal into the targets'
    /// queues.
    ///
    /// # Errors
    ///
    /// Fails if the journal is corrupted or cannot be read.
    pub fn open(
        config: CoreConfig,
        registry: Arc<TaskRegistry>,
        targets: Arc<TargetSet>,
        backend: Box<dyn StorageBackend>,
    ) -> CoreResult<(Self, RecoveryReport)> {
        let (journal, scan) = Journal::open(backend, config.sync_on_write)?;
        let replay = JournalReplay::replay(&scan.records);

        let mut report = RecoveryReport {
            records_replayed: replay.records,
            torn_bytes: scan.torn_bytes,
            next_sequence: replay.next_sequence(),
            ..RecoveryReport::default()
        };

        let live = replay.live_entries();
        for (target_id, state) in replay.targets {
            let Some(target) = targets.get(&target_id) else {
                let entries = state.delivery.len() + state.held.len();
                if entries > 0 {
                    warn!(target = %target_id, entries, "journal entries for unconfigured target ignored");
                }
                report.orphaned += entries;
                continue;
            };
            for task in state.delivery {
                target.queue().restore(QueueEntry::pending(task, true));
                report.entries_restored += 1;
            }
            for task in state.held {
                target.review().hold(task);
                report.held_restored += 1;
            }
        }

        let logger = Self::build(
            config,
            registry,
            targets,
            Some(journal),
            report.next_sequence.as_u64(),
            replay.reserved_up_to,
        );
        logger
            .dead_records
            .store(scan.records.len().saturating_sub(live) as u64, Ordering::Relaxed);

        info!(
            records = report.records_replayed,
            restored = report.entries_restored,
            held = report.held_restored,
            next_sequence = %report.next_sequence,
            "task journal recovered"
        );
        Ok((logger, report))
    }

    fn build(
        config: CoreConfig,
        registry: Arc<TaskRegistry>,
        targets: Arc<TargetSet>,
        journal: Option<Journal>,
        next: u64,
        reserved_up_to: u64,
    ) -> Self {
        let events = Arc::new(EventFeed::with_max_history(config.event_history));
        let versions = Arc::new(VersionLedger::with_retention(config.version_retention));
        Self {
            config,
            registry,
            targets,
            journal,
            sequence: Mutex::new(SequenceState {
                next,
                reserved_up_to,
            }),
            dead_records: AtomicU64::new(0),
            events,
            stats: Arc::new(SyncStats::new()),
            versions,
        }
    }

    /// Logs a change and queues it for every matching target.
    ///
    /// # Errors
    ///
    /// - `UnknownKind` if the kind is not registered
    /// - `Persistence` if the kind is critical and the journal write failed
    pub fn log(&self, draft: TaskDraft) -> CoreResult<Task> {
        let registered = self.registry.require(&draft.kind)?;
        let kind = registered.kind();

        let mut sequence = self.sequence.lock();
        let sequence_id = SequenceId(sequence.next);
        sequence.next += 1;

        let created_at = self.versions.stamp_local(
            &draft.object_type,
            &draft.target_key,
            &self.config.server_id,
            unix_millis(),
        );
        let task = Task {
            sequence_id,
            kind: draft.kind,
            object_type: draft.object_type,
            target_key: draft.target_key,
            payload: draft.payload,
            origin: self.config.server_id.clone(),
            created_at,
            groups: draft.groups,
            schema_version: kind.schema_version,
        };
        let recipients = self.targets.recipients(&task, kind.is_critical);

        if let Some(journal) = &self.journal {
            let reserve = (sequence_id.as_u64() > sequence.reserved_up_to)
                .then(|| sequence_id.as_u64() + self.config.sequence_block - 1);

            let mut records = Vec::new();
            if let Some(up_to) = reserve {
                records.push(JournalRecord::Reserve {
                    up_to: SequenceId(up_to),
                });
            }
            if kind.is_critical {
                records.extend(recipients.iter().map(|target| {
                    let target_id = target.server_id().clone();
                    let task = task.clone();
                    if target.is_manual_staging() {
                        JournalRecord::Hold {
                            target: target_id,
                            task,
                        }
                    } else {
                        JournalRecord::Enqueue {
                            target: target_id,
                            task,
                        }
                    }
                }));
            }

            if !records.is_empty() {
                match journal.append_batch(&records) {
                    Ok(_) => {
                        if let Some(up_to) = reserve {
                            sequence.reserved_up_to = up_to;
                        }
                    }
                    Err(e) if kind.is_critical => {
                        self.stats.record_persistence_failure();
                        error!(
                            %sequence_id,
                            kind = %task.kind,
                            error = %e,
                            "journal write failed for critical task"
                        );
                        return Err(CoreError::persistence(sequence_id, e.to_string()));
                    }
                    Err(e) => {
                        warn!(%sequence_id, error = %e, "sequence reservation not persisted");
                    }
                }
            }
        }

        for target in &recipients {
            if target.is_manual_staging() {
                target.review().hold(task.clone());
                self.stats.record_held();
            } else {
                self.enqueue(target, task.clone(), registered);
            }
        }

        self.stats.record_logged();
        debug!(
            %sequence_id,
            kind = %task.kind,
            key = %task.target_key,
            targets = recipients.len(),
            "task logged"
        );
        self.maybe_compact(&sequence);
        Ok(task)
    }

    /// Pushes a task into a target's delivery queue and journals what the
    /// optimizer did with it.
    fn enqueue(&self, target: &TargetState, task: Task, registered: &RegisteredKind) {
        let kind = registered.kind();
        let handler = registered.handler();
        let sequence_id = task.sequence_id;
        let kind_id = task.kind.clone();

        let outcome = target
            .queue()
            .push(task, kind.is_critical, kind.policy, |earlier, later| {
                handler.merge(earlier, later)
            });

        let mut retired = Vec::new();
        match outcome {
            EnqueueOutcome::Appended => self.stats.record_queued(),
            EnqueueOutcome::Superseded { removed } => {
                self.stats.record_queued();
                self.stats.record_superseded(removed.len() as u64);
                if kind.is_critical {
                    retired.extend(removed.into_iter().map(|seq| JournalRecord::Discard {
                        target: target.server_id().clone(),
                        sequence_id: seq,
                    }));
                }
            }
            EnqueueOutcome::Merged { merged, absorbed } => {
                self.stats.record_merged();
                if kind.is_critical {
                    retired.push(JournalRecord::Merged {
                        target: target.server_id().clone(),
                        absorbed,
                        task: merged,
                    });
                }
            }
            EnqueueOutcome::Dropped => {
                self.stats.record_dropped();
                warn!(
                    target = %target.server_id(),
                    %sequence_id,
                    kind = %kind_id,
                    "delivery queue full, dropping non-critical task"
                );
                self.events.emit(SyncEvent::EntryDropped {
                    target: target.server_id().clone(),
                    sequence_id,
                    kind: kind_id,
                });
            }
        }

        if !retired.is_empty() {
            self.append_retirements(&retired);
        }
    }

    fn append_retirements(&self, records: &[JournalRecord]) {
        let Some(journal) = &self.journal else {
            return;
        };
        // A lost retirement only means a redundant delivery after restart.
        match journal.append_batch(records) {
            Ok(_) => {
                self.dead_records
                    .fetch_add(2 * records.len() as u64, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "failed to journal retired entries"),
        }
    }

    /// Journals entries a dispatcher removed after the target acked them.
    ///
    /// # Errors
    ///
    /// Returns the journal error; the entries are already out of the queue
    /// and would only be redelivered after a restart.
    pub fn record_delivered(&self, target: &ServerId, delivered: &[QueueEntry]) -> CoreResult<()> {
        self.stats.record_delivered(delivered.len() as u64);
        let Some(journal) = &self.journal else {
            return Ok(());
        };

        let records: Vec<_> = delivered
            .iter()
            .filter(|e| e.critical)
            .map(|e| JournalRecord::Delivered {
                target: target.clone(),
                sequence_id: e.sequence_id(),
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }

        journal.append_batch(&records)?;
        self.dead_records
            .fetch_add(2 * records.len() as u64, Ordering::Relaxed);

        let sequence = self.sequence.lock();
        self.maybe_compact(&sequence);
        Ok(())
    }

    /// Releases held tasks of a manual staging target into its delivery
    /// queue.
    ///
    /// Earlier held tasks on the same keys are released too, in sequence
    /// order. Returns the released tasks.
    ///
    /// # Errors
    ///
    /// - `UnknownTarget` / `InvalidOperation` for a target without review
    /// - `Persistence` if the release could not be journaled
    pub fn approve(&self, target_id: &ServerId, selected: &[SequenceId]) -> CoreResult<Vec<Task>> {
        let target = self.review_target(target_id)?;
        let sequence = self.sequence.lock();

        let released = target.review().release_set(selected);
        let Some(first) = released.first() else {
            return Ok(Vec::new());
        };

        let records: Vec<_> = released
            .iter()
            .filter(|t| self.registry.is_critical(&t.kind))
            .map(|t| JournalRecord::Release {
                target: target_id.clone(),
                sequence_id: t.sequence_id,
            })
            .collect();
        if let Some(journal) = &self.journal {
            if !records.is_empty() {
                journal
                    .append_batch(&records)
                    .map_err(|e| CoreError::persistence(first.sequence_id, e.to_string()))?;
            }
        }

        let sequence_ids: Vec<_> = released.iter().map(|t| t.sequence_id).collect();
        target.review().remove(&sequence_ids);
        for task in &released {
            match self.registry.lookup(&task.kind) {
                Some(registered) => self.enqueue(&target, task.clone(), registered),
                None => {
                    target
                        .queue()
                        .push(task.clone(), true, OptimizationPolicy::None, |_, later| {
                            later.payload.clone()
                        });
                }
            }
        }

        info!(target = %target_id, count = released.len(), "held tasks approved");
        self.maybe_compact(&sequence);
        Ok(released)
    }

    /// Discards held tasks of a manual staging target.
    ///
    /// # Errors
    ///
    /// - `UnknownTarget` / `InvalidOperation` for a target without review
    /// - journal errors
    pub fn reject(&self, target_id: &ServerId, selected: &[SequenceId]) -> CoreResult<Vec<Task>> {
        let target = self.review_target(target_id)?;
        let _sequence = self.sequence.lock();

        if let Some(journal) = &self.journal {
            let records: Vec<_> = selected
                .iter()
                .map(|seq| JournalRecord::Discard {
                    target: target_id.clone(),
                    sequence_id: *seq,
                })
                .collect();
            if !records.is_empty() {
                journal.append_batch(&records)?;
            }
        }

        let rejected = target.review().remove(selected);
        self.dead_records
            .fetch_add(2 * rejected.len() as u64, Ordering::Relaxed);
        info!(target = %target_id, count = rejected.len(), "held tasks rejected");
        Ok(rejected)
    }

    fn review_target(&self, target_id: &ServerId) -> CoreResult<Arc<TargetState>> {
        let target = self.targets.require(target_id)?;
        if !target.is_manual_staging() {
            return Err(CoreError::invalid_operation(format!(
                "target {target_id} does not hold tasks for review"
            )));
        }
        Ok(target)
    }

    /// Abandons every queued and held entry of a target.
    ///
    /// Returns the number of abandoned entries.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` or journal errors.
    pub fn purge_target(&self, target_id: &ServerId) -> CoreResult<usize> {
        let target = self.targets.require(target_id)?;
        let _sequence = self.sequence.lock();

        if let Some(journal) = &self.journal {
            journal.append(&JournalRecord::PurgeTarget {
                target: target_id.clone(),
            })?;
        }

        let abandoned = target.queue().drain().len() + target.review().drain().len();
        self.dead_records
            .fetch_add(abandoned as u64 + 1, Ordering::Relaxed);
        warn!(target = %target_id, abandoned, "target purged, entries abandoned");
        self.events.emit(SyncEvent::TargetPurged {
            target: target_id.clone(),
            abandoned,
        });
        Ok(abandoned)
    }

    /// Purges a target and removes it from the target set.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` or journal errors.
    pub fn remove_target(&self, target_id: &ServerId) -> CoreResult<usize> {
        let abandoned = self.purge_target(target_id)?;
        self.targets.remove(target_id)?;
        info!(target = %target_id, "target removed");
        Ok(abandoned)
    }

    /// Rewrites the journal with live entries only.
    ///
    /// Returns the number of records written (0 without a journal).
    pub fn compact(&self) -> CoreResult<usize> {
        let sequence = self.sequence.lock();
        self.compact_locked(&sequence)
    }

    fn maybe_compact(&self, sequence: &SequenceState) {
        let threshold = self.config.compaction_threshold;
        if threshold == 0 || self.dead_records.load(Ordering::Relaxed) < threshold {
            return;
        }
        if let Err(e) = self.compact_locked(sequence) {
            warn!(error = %e, "journal compaction failed");
        }
    }

    fn compact_locked(&self, sequence: &SequenceState) -> CoreResult<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let reserved = sequence.reserved_up_to.max(sequence.next.saturating_sub(1));
        let written = journal.compact_with(|| self.live_records(reserved))?;
        self.dead_records.store(0, Ordering::Relaxed);
        self.stats.record_compaction();
        info!(records = written, "task journal compacted");
        Ok(written)
    }

    fn live_records(&self, reserved_up_to: u64) -> Vec<JournalRecord> {
        let mut records = vec![JournalRecord::Reserve {
            up_to: SequenceId(reserved_up_to),
        }];
        for target in self.targets.all() {
            let target_id = target.server_id();
            records.extend(
                target
                    .queue()
                    .snapshot()
                    .into_iter()
                    .filter(|e| e.critical)
                    .map(|e| JournalRecord::Enqueue {
                        target: target_id.clone(),
                        task: e.task,
                    }),
            );
            records.extend(
                target
                    .review()
                    .list()
                    .into_iter()
                    .filter(|t| self.registry.is_critical(&t.kind))
                    .map(|task| JournalRecord::Hold {
                        target: target_id.clone(),
                        task,
                    }),
            );
        }
        records
    }

    /// This node's server id.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.config.server_id
    }

    /// The sealed task registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// The configured targets.
    #[must_use]
    pub fn targets(&self) -> &Arc<TargetSet> {
        &self.targets
    }

    /// Operational event feed.
    #[must_use]
    pub fn events(&self) -> &Arc<EventFeed> {
        &self.events
    }

    /// Replication counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    /// Last known version of every object written here. The receiver
    /// shares it to reconcile incoming tasks with local writes.
    pub fn versions(&self) -> &Arc<VersionLedger> {
        &self.versions
    }

    /// Returns true if critical tasks are journaled.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    /// The sequence id the next logged task receives.
    #[must_use]
    pub fn next_sequence(&self) -> SequenceId {
        SequenceId(self.sequence.lock().next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EntryState;
    use crate::registry::{ApplyError, ApplyOutcome, TaskHandler, TaskKind, TaskRegistryBuilder};
    use crate::target::{DeliveryTarget, StagingMode};
    use farmsync_protocol::VersionStamp;
    use farmsync_storage::{InMemoryBackend, StorageError, StorageResult};

    struct Noop;

    impl TaskHandler for Noop {
        fn apply(&self, _task: &Task) -> Result<ApplyOutcome, ApplyError> {
            Ok(ApplyOutcome::Applied)
        }
    }

    fn registry() -> Arc<TaskRegistry> {
        let mut builder = TaskRegistryBuilder::new();
        builder
            .register("cache.invalidate", Arc::new(Noop), OptimizationPolicy::DropSuperseded, false)
            .unwrap()
            .register("object.update", Arc::new(Noop), OptimizationPolicy::GroupByKey, true)
            .unwrap()
            .register("object.delete", Arc::new(Noop), OptimizationPolicy::None, true)
            .unwrap()
            .register_kind(
                TaskKind::new("object.versioned", OptimizationPolicy::None, true).with_schema_version(4),
                Arc::new(Noop),
            )
            .unwrap();
        Arc::new(builder.seal())
    }

    fn targets() -> Arc<TargetSet> {
        Arc::new(
            TargetSet::from_config(
                [
                    DeliveryTarget::farm("node-2", "http://node-2", "t"),
                    DeliveryTarget::farm("node-3", "http://node-3", "t").with_groups(["site-b"]),
                    DeliveryTarget::staging("stage", "http://stage", "t", StagingMode::Manual),
                ],
                1000,
            )
            .unwrap(),
        )
    }

    fn config() -> CoreConfig {
        CoreConfig::new("node-1").compaction_threshold(0)
    }

    fn seqs(target: &TargetState) -> Vec<u64> {
        target.queue().snapshot().iter().map(|e| e.sequence_id().0).collect()
    }

    fn draft(kind: &str, key: &str, payload: &str) -> TaskDraft {
        TaskDraft::new(kind, "cms.document", key, payload.as_bytes().to_vec())
    }

    #[test]
    fn sequence_ids_are_monotonic_and_stamped() {
        let logger = TaskLogger::in_memory(config(), registry(), targets());
        assert!(!logger.is_durable());
        let a = logger.log(draft("object.update", "doc:1", "a")).unwrap();
        let b = logger.log(draft("object.versioned", "doc:2", "b")).unwrap();

        assert_eq!(a.sequence_id, SequenceId(1));
        assert_eq!(b.sequence_id, SequenceId(2));
        assert_eq!(a.origin.as_str(), "node-1");
        assert_eq!(b.schema_version, 4);
        assert!(a.created_at > 0);
    }

    #[test]
    fn local_write_is_stamped_past_applied_version() {
        let logger = TaskLogger::in_memory(config(), registry(), targets());
        let ahead = unix_millis() + 60_000;
        logger.versions().record(
            "cms.document",
            "doc:1",
            VersionStamp::new(ahead, ServerId::new("node-9")),
            unix_millis(),
        );

        let task = logger.log(draft("object.update", "doc:1", "a")).unwrap();
        assert_eq!(task.created_at, ahead + 1);
        assert_eq!(logger.versions().current("cms.document", "doc:1"), Some(task.version_stamp()));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let logger = TaskLogger::in_memory(config(), registry(), targets());
        let err = logger.log(draft("nope", "k", "")).unwrap_err();
        assert!(matches!(err, CoreError::UnknownKind { .. }));
        assert_eq!(logger.next_sequence(), SequenceId(1));
    }

    #[test]
    fn fan_out_respects_groups_and_review() {
        let targets = targets();
        let logger = TaskLogger::in_memory(config(), registry(), targets.clone());

        logger.log(draft("object.delete", "doc:1", "")).unwrap();
        logger
            .log(draft("object.delete", "doc:2", "").with_groups(["site-a"]))
            .unwrap();

        let node2 = targets.get(&"node-2".into()).unwrap();
        let node3 = targets.get(&"node-3".into()).unwrap();
        let stage = targets.get(&"stage".into()).unwrap();
        assert_eq!(seqs(&node2), [1, 2]);
        assert_eq!(seqs(&node3), [1]);
        assert!(stage.queue().is_empty());
        assert_eq!(stage.review().len(), 2);
    }

    #[test]
    fn invalidation_burst_leaves_one_entry() {
        let targets = targets();
        let logger = TaskLogger::in_memory(config(), registry(), targets.clone());
        for payload in ["1", "2", "3"] {
            logger
                .log(TaskDraft::new("cache.invalidate", "cache", "page:42", payload.into()))
                .unwrap();
        }

        let entries = targets.get(&"node-2".into()).unwrap().queue().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task.payload, b"3");
        assert_eq!(entries[0].state, EntryState::Pending);
        assert_eq!(targets.get(&"node-3".into()).unwrap().queue().len(), 1);
        // two superseded entries on each farm target
        assert_eq!(logger.stats().snapshot().entries_superseded, 4);
    }

    #[test]
    fn disabled_target_still_queues_critical_tasks() {
        let targets = targets();
        let node3 = targets.get(&"node-3".into()).unwrap();
        assert!(node3.set_enabled(false));
        let logger = TaskLogger::in_memory(config(), registry(), targets.clone());

        logger.log(draft("object.delete", "doc:1", "")).unwrap();
        logger
            .log(TaskDraft::new("cache.invalidate", "cache", "page:1", Vec::new()))
            .unwrap();

        let entries = node3.queue().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence_id(), SequenceId(1));
        assert!(entries[0].is_pending());
        assert_eq!(seqs(&targets.get(&"node-2".into()).unwrap()), [1, 2]);
    }

    #[test]
    fn critical_entries_survive_restart() {
        let shared = InMemoryBackend::new();
        {
            let (logger, report) =
                TaskLogger::open(config(), registry(), targets(), Box::new(shared.clone())).unwrap();
            assert_eq!(report.next_sequence, SequenceId(1));
            assert!(logger.is_durable());
            logger.log(draft("object.update", "doc:5", "v1")).unwrap();
            logger.log(draft("object.delete", "doc:5", "")).unwrap();
            logger
                .log(TaskDraft::new("cache.invalidate", "cache", "page:1", Vec::new()))
                .unwrap();
        }

        let targets = targets();
        let (logger, report) =
            TaskLogger::open(config(), registry(), targets.clone(), Box::new(shared)).unwrap();
        let node2 = targets.get(&"node-2".into()).unwrap();
        // the invalidation was best-effort and is gone
        assert_eq!(seqs(&node2), [1, 2]);
        assert_eq!(targets.get(&"stage".into()).unwrap().review().len(), 2);
        assert_eq!(report.entries_restored, 4);
        assert_eq!(report.held_restored, 2);

        // ids handed out before the restart are never reused
        let next = logger.log(draft("object.delete", "doc:9", "")).unwrap();
        assert!(next.sequence_id > SequenceId(3));
    }

    #[test]
    fn delivered_entries_do_not_come_back() {
        let shared = InMemoryBackend::new();
        {
            let (logger, _) =
                TaskLogger::open(config(), registry(), targets(), Box::new(shared.clone())).unwrap();
            logger.log(draft("object.delete", "doc:1", "")).unwrap();
            logger.log(draft("object.delete", "doc:2", "")).unwrap();

            let node2 = logger.targets().get(&"node-2".into()).unwrap();
            node2.queue().take_batch(1);
            let delivered = node2.queue().complete(1);
            logger.record_delivered(node2.server_id(), &delivered).unwrap();
        }

        let targets = targets();
        TaskLogger::open(config(), registry(), targets.clone(), Box::new(shared)).unwrap();
        assert_eq!(seqs(&targets.get(&"node-2".into()).unwrap()), [2]);
        assert_eq!(seqs(&targets.get(&"node-3".into()).unwrap()), [1, 2]);
    }

    #[test]
    fn merged_payload_survives_restart() {
        let shared = InMemoryBackend::new();
        {
            let (logger, _) =
                TaskLogger::open(config(), registry(), targets(), Box::new(shared.clone())).unwrap();
            logger.log(draft("object.update", "doc:1", "v1")).unwrap();
            logger.log(draft("object.update", "doc:1", "v2")).unwrap();
        }
        let targets = targets();
        TaskLogger::open(config(), registry(), targets.clone(), Box::new(shared)).unwrap();
        let entries = targets.get(&"node-2".into()).unwrap().queue().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence_id(), SequenceId(1));
        assert_eq!(entries[0].task.payload, b"v2");
    }

    #[test]
    fn approve_moves_held_tasks_in_order() {
        let targets = targets();
        let shared = InMemoryBackend::new();
        let (logger, _) =
            TaskLogger::open(config(), registry(), targets.clone(), Box::new(shared.clone())).unwrap();
        logger.log(draft("object.delete", "doc:1", "")).unwrap();
        logger.log(draft("object.delete", "doc:2", "")).unwrap();
        logger.log(draft("object.delete", "doc:1", "")).unwrap();

        let stage: ServerId = "stage".into();
        let released = logger.approve(&stage, &[SequenceId(3)]).unwrap();
        let released: Vec<_> = released.iter().map(|t| t.sequence_id.0).collect();
        assert_eq!(released, [1, 3]);

        let rejected = logger.reject(&stage, &[SequenceId(2)]).unwrap();
        assert_eq!(rejected.len(), 1);

        drop(logger);
        let targets_after = self::targets();
        TaskLogger::open(config(), registry(), targets_after.clone(), Box::new(shared)).unwrap();
        let stage_state = targets_after.get(&stage).unwrap();
        assert_eq!(seqs(&stage_state), [1, 3]);
        assert!(stage_state.review().is_empty());
    }

    #[test]
    fn approve_requires_manual_target() {
        let logger = TaskLogger::in_memory(config(), registry(), targets());
        let err = logger.approve(&"node-2".into(), &[SequenceId(1)]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn purge_abandons_entries_and_emits_event() {
        let targets = targets();
        let logger = TaskLogger::in_memory(config(), registry(), targets.clone());
        let events = logger.events().subscribe();
        logger.log(draft("object.delete", "doc:1", "")).unwrap();

        assert_eq!(logger.purge_target(&"node-2".into()).unwrap(), 1);
        assert!(targets.get(&"node-2".into()).unwrap().queue().is_empty());
        assert!(matches!(
            events.recv().unwrap(),
            SyncEvent::TargetPurged { abandoned: 1, .. }
        ));

        logger.remove_target(&"node-3".into()).unwrap();
        assert!(targets.get(&"node-3".into()).is_none());
    }

    #[test]
    fn compaction_keeps_only_live_entries() {
        let shared = InMemoryBackend::new();
        let config = CoreConfig::new("node-1").compaction_threshold(8);
        {
            let (logger, _) =
                TaskLogger::open(config.clone(), registry(), targets(), Box::new(shared.clone()))
                    .unwrap();
            let node2 = logger.targets().get(&"node-2".into()).unwrap();
            for n in 0..10 {
                logger.log(draft("object.delete", &format!("doc:{n}"), "")).unwrap();
                node2.queue().take_batch(1);
                let delivered = node2.queue().complete(1);
                logger.record_delivered(node2.server_id(), &delivered).unwrap();
            }
            assert!(logger.stats().snapshot().journal_compactions > 0);
        }

        let targets = targets();
        let (_, report) =
            TaskLogger::open(config, registry(), targets.clone(), Box::new(shared)).unwrap();
        assert!(seqs(&targets.get(&"node-2".into()).unwrap()).is_empty());
        assert_eq!(seqs(&targets.get(&"node-3".into()).unwrap()).len(), 10);
        assert!(report.next_sequence > SequenceId(10));
    }

    struct FailingBackend;

    impl StorageBackend for FailingBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            Err(StorageError::ReadPastEnd { offset, len, size: 0 })
        }
        fn append(&mut self, _data: &[u8]) -> StorageResult<u64> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }
        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn size(&self) -> StorageResult<u64> {
            Ok(0)
        }
        fn truncate(&mut self, _new_size: u64) -> StorageResult<()> {
            Ok(())
        }
        fn replace(&mut self, _data: &[u8]) -> StorageResult<()> {
            Ok(())
        }
    }

    #[test]
    fn journal_failure_fails_critical_but_not_best_effort() {
        let targets = targets();
        let (logger, _) =
            TaskLogger::open(config(), registry(), targets.clone(), Box::new(FailingBackend)).unwrap();

        let err = logger.log(draft("object.delete", "doc:1", "")).unwrap_err();
        assert!(err.is_persistence());
        assert!(targets.get(&"node-2".into()).unwrap().queue().is_empty());

        logger
            .log(TaskDraft::new("cache.invalidate", "cache", "page:1", Vec::new()))
            .unwrap();
        assert_eq!(targets.get(&"node-2".into()).unwrap().queue().len(), 1);
        assert_eq!(logger.stats().snapshot().persistence_failures, 1);
    }
}
