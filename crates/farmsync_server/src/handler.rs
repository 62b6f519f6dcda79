//! Applying incoming batches.

use crate::auth::{SenderAuthenticator, SignedHeaders};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use farmsync_core::{
    unix_millis, ApplyOutcome, SyncStats, TaskHandler, TaskRegistry, VersionLedger,
};
use farmsync_protocol::{
    ApplyRequest, ApplyResponse, ConflictPolicy, NackCode, NackError, SequenceId, ServerId, Task,
    TaskAck,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

type ObjectKey = (String, String);

#[derive(Debug, Clone, Copy)]
struct Watermark {
    applied: SequenceId,
    seen_at: u64,
}

/// What the receiver remembers between requests.
///
/// Watermarks are tracked per origin and key: manual staging approvals can
/// release an origin's tasks out of global sequence order, never out of
/// per-key order. A watermark idle for the retention window is dropped.
#[derive(Debug, Default)]
struct ReceiverState {
    watermarks: HashMap<(ServerId, ObjectKey), Watermark>,
    last_prune: u64,
}

impl ReceiverState {
    fn prune(&mut self, now: u64, retention_ms: u64) -> usize {
        self.last_prune = now;
        let cutoff = now.saturating_sub(retention_ms);
        let before = self.watermarks.len();
        self.watermarks.retain(|_, mark| mark.seen_at >= cutoff);
        before - self.watermarks.len()
    }
}

/// Applies authenticated batches through the task registry.
pub struct ApplyHandler {
    registry: Arc<TaskRegistry>,
    stats: Arc<SyncStats>,
    authenticator: SenderAuthenticator,
    policy: ConflictPolicy,
    max_batch: usize,
    retention_ms: Option<u64>,
    state: Mutex<ReceiverState>,
    versions: Arc<VersionLedger>,
}

impl ApplyHandler {
    /// Creates a handler for the given registry.
    pub fn new(config: &ServerConfig, registry: Arc<TaskRegistry>, stats: Arc<SyncStats>) -> Self {
        let mut authenticator =
            SenderAuthenticator::new(&config.trusted_senders, config.max_clock_skew);
        if !config.require_auth {
            authenticator = authenticator.optional();
        }
        Self {
            registry,
            stats,
            authenticator,
            policy: config.conflict_policy,
            max_batch: config.max_batch,
            retention_ms: config.version_retention.map(|r| r.as_millis() as u64),
            state: Mutex::new(ReceiverState::default()),
            versions: Arc::new(VersionLedger::with_retention(config.version_retention)),
        }
    }

    /// Reconciles against `versions` instead of a private ledger.
    ///
    /// Pass the local logger's ledger so incoming tasks are weighed against
    /// local writes too.
    #[must_use]
    pub fn with_versions(mut self, versions: Arc<VersionLedger>) -> Self {
        self.versions = versions;
        self
    }

    /// Returns the version ledger.
    pub fn versions(&self) -> &Arc<VersionLedger> {
        &self.versions
    }

    /// Returns the number of `(origin, object)` watermarks held.
    pub fn watermark_count(&self) -> usize {
        self.state.lock().watermarks.len()
    }

    /// Returns the receiver counters.
    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    /// Authenticates and applies a raw request body.
    ///
    /// # Errors
    ///
    /// Errors reject the whole request; the sender retries it unchanged.
    pub fn handle(&self, headers: &SignedHeaders, body: &[u8]) -> ServerResult<ApplyResponse> {
        let origin = self.authenticator.authenticate(headers, body, unix_millis())?;
        let request = ApplyRequest::from_json(body)?;

        if request.tasks.len() > self.max_batch {
            return Err(ServerError::InvalidRequest(format!(
                "too many tasks: {} > {}",
                request.tasks.len(),
                self.max_batch
            )));
        }
        if let Some(foreign) = request
            .tasks
            .iter()
            .find(|t| t.origin_server != origin.as_str())
        {
            return Err(ServerError::NotAuthorized(format!(
                "{origin} cannot send tasks of {}",
                foreign.origin_server
            )));
        }

        debug!(%origin, batch = %request.batch_id, tasks = request.tasks.len(), "apply request");
        Ok(self.apply_batch(&origin, request))
    }

    /// Applies the tasks of an authenticated request in order.
    ///
    /// After the first nack every remaining task is nacked as blocked so a
    /// later change never overtakes an earlier one on the same key.
    pub fn apply_batch(&self, origin: &ServerId, request: ApplyRequest) -> ApplyResponse {
        self.apply_batch_at(origin, request, unix_millis())
    }

    /// Like [`apply_batch`](Self::apply_batch) with an explicit clock.
    pub fn apply_batch_at(&self, origin: &ServerId, request: ApplyRequest, now: u64) -> ApplyResponse {
        self.maybe_prune(now);
        let mut acks = Vec::with_capacity(request.tasks.len());
        let mut blocked_by: Option<u64> = None;

        for wire in request.tasks {
            let sequence_id = SequenceId(wire.sequence_id);
            if let Some(first) = blocked_by {
                acks.push(TaskAck::nack(
                    sequence_id,
                    NackError::new(NackCode::Blocked, format!("blocked by task {first}")),
                ));
                self.stats.record_nack();
                continue;
            }

            let ack = match wire.into_task() {
                Ok(task) => self.apply_task(&task, now),
                Err(e) => TaskAck::nack(sequence_id, NackError::new(NackCode::Malformed, e.to_string())),
            };
            if !ack.is_ack() {
                self.stats.record_nack();
                if let Some(error) = &ack.error {
                    warn!(%origin, %sequence_id, code = ?error.code, error = %error.message, "task rejected");
                }
                blocked_by = Some(sequence_id.as_u64());
            }
            acks.push(ack);
        }

        if let Some(first) = blocked_by {
            info!(%origin, sequence_id = first, acked = acks.iter().filter(|a| a.is_ack()).count(), "batch partially applied");
        }
        ApplyResponse { acks }
    }

    /// Drops idle watermarks a few times per retention window.
    fn maybe_prune(&self, now: u64) {
        let Some(retention) = self.retention_ms else {
            return;
        };
        let mut state = self.state.lock();
        if now.saturating_sub(state.last_prune) < (retention / 8).max(1) {
            return;
        }
        let removed = state.prune(now, retention);
        if removed > 0 {
            debug!(removed, remaining = state.watermarks.len(), "watermarks pruned");
        }
    }

    fn apply_task(&self, task: &Task, now: u64) -> TaskAck {
        let seq = task.sequence_id;
        let Some(registered) = self.registry.lookup(&task.kind) else {
            return TaskAck::nack(
                seq,
                NackError::new(NackCode::UnknownKind, format!("unknown task kind {}", task.kind)),
            );
        };
        let supported = registered.kind().schema_version;
        if task.schema_version > supported {
            return TaskAck::nack(seq, NackError::unsupported_version(task.schema_version, supported));
        }

        // Dependency upserts carry no sequence id and bypass ordering checks.
        if seq.is_unsequenced() {
            return self.invoke(registered.handler().as_ref(), task);
        }

        let mut state = self.state.lock();
        let mark = (
            task.origin.clone(),
            (task.object_type.clone(), task.target_key.clone()),
        );
        if let Some(watermark) = state.watermarks.get_mut(&mark) {
            if seq <= watermark.applied {
                watermark.seen_at = now;
                self.stats.record_duplicate();
                debug!(origin = %task.origin, %seq, "duplicate ignored");
                return TaskAck::ack(seq);
            }
        }

        let stamp = task.version_stamp();
        let current = self.versions.current(&task.object_type, &task.target_key);
        let applied = Watermark { applied: seq, seen_at: now };
        if !self.policy.admits(&stamp, current.as_ref()) {
            self.stats.record_skipped();
            debug!(origin = %task.origin, %seq, key = %task.target_key, "superseded by newer write");
            state.watermarks.insert(mark, applied);
            return TaskAck::ack(seq);
        }

        let ack = self.invoke(registered.handler().as_ref(), task);
        if ack.is_ack() {
            state.watermarks.insert(mark, applied);
            self.versions.record(&task.object_type, &task.target_key, stamp, now);
        }
        ack
    }

    fn invoke(&self, handler: &dyn TaskHandler, task: &Task) -> TaskAck {
        let seq = task.sequence_id;
        match handler.apply(task) {
            Ok(ApplyOutcome::Applied) => {
                self.stats.record_applied();
                TaskAck::ack(seq)
            }
            Ok(ApplyOutcome::Assigned(id)) => {
                self.stats.record_applied();
                TaskAck::ack_assigned(seq, id)
            }
            Ok(ApplyOutcome::Skipped) => {
                self.stats.record_skipped();
                TaskAck::ack(seq)
            }
            Err(e) => TaskAck::nack(seq, NackError::new(NackCode::HandlerFailed, e.message())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_core::{
        ApplyError, BuiltinHandlers, ObjectRepository, ObjectStore, OptimizationPolicy, TaskKind,
        TaskRegistryBuilder,
    };
    use farmsync_protocol::{signing, ObjectPayload, TaskKindId};
    use std::time::Duration;

    const TOKEN: &str = "shared";

    struct Failing;

    impl TaskHandler for Failing {
        fn apply(&self, _task: &Task) -> Result<ApplyOutcome, ApplyError> {
            Err(ApplyError::new("disk full"))
        }
    }

    fn setup(policy: ConflictPolicy) -> (ApplyHandler, Arc<ObjectStore>) {
        setup_with(policy, |config| config)
    }

    fn setup_with(
        policy: ConflictPolicy,
        configure: impl FnOnce(ServerConfig) -> ServerConfig,
    ) -> (ApplyHandler, Arc<ObjectStore>) {
        let store = Arc::new(ObjectStore::with_first_id(100));
        let mut builder = TaskRegistryBuilder::new();
        BuiltinHandlers::new(store.clone())
            .register_into(&mut builder)
            .unwrap();
        builder
            .register_kind(
                TaskKind::new("broken", OptimizationPolicy::None, true),
                Arc::new(Failing),
            )
            .unwrap();
        let config = ServerConfig::default()
            .with_trusted_sender("node-a", TOKEN)
            .with_trusted_sender("node-b", TOKEN)
            .with_conflict_policy(policy);
        let config = configure(config);
        let handler = ApplyHandler::new(&config, Arc::new(builder.seal()), Arc::new(SyncStats::new()));
        (handler, store)
    }

    fn upsert(origin: &str, seq: u64, key: &str, title: &str, at: u64) -> Task {
        let payload = ObjectPayload::new().with_field("title", serde_json::json!(title));
        Task {
            sequence_id: SequenceId(seq),
            kind: TaskKindId::new("object.upsert"),
            object_type: "cms.document".into(),
            target_key: key.into(),
            payload: payload.to_bytes().unwrap(),
            origin: ServerId::new(origin),
            created_at: at,
            groups: vec![],
            schema_version: 1,
        }
    }

    fn with_kind(mut task: Task, kind: &str) -> Task {
        task.kind = TaskKindId::new(kind);
        task
    }

    fn apply(handler: &ApplyHandler, tasks: &[Task]) -> ApplyResponse {
        let origin = tasks[0].origin.clone();
        handler.apply_batch(&origin, ApplyRequest::new(tasks))
    }

    fn title(store: &ObjectStore, key: &str) -> Option<String> {
        store
            .get("cms.document", key)
            .and_then(|o| o.payload.fields.get("title").and_then(|v| v.as_str().map(String::from)))
    }

    #[test]
    fn applies_and_reports_assigned_ids() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        let response = apply(&handler, &[upsert("node-a", 1, "doc:1", "One", 10)]);
        assert_eq!(response.acked_prefix(), 1);
        assert_eq!(response.acks[0].assigned_id, Some(100));
        assert_eq!(title(&store, "doc:1").as_deref(), Some("One"));
        assert_eq!(handler.stats().snapshot().tasks_applied, 1);
    }

    #[test]
    fn duplicates_are_acked_without_reapplying() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        apply(&handler, &[upsert("node-a", 1, "doc:1", "One", 10)]);
        apply(&handler, &[upsert("node-a", 2, "doc:1", "Two", 20)]);

        let response = apply(&handler, &[upsert("node-a", 1, "doc:1", "One", 10)]);
        assert!(response.acks[0].is_ack());
        assert_eq!(title(&store, "doc:1").as_deref(), Some("Two"));
        assert_eq!(handler.stats().snapshot().duplicates_ignored, 1);
    }

    #[test]
    fn out_of_order_keys_are_not_duplicates() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        apply(&handler, &[upsert("node-a", 5, "doc:1", "Later", 10)]);
        let response = apply(&handler, &[upsert("node-a", 3, "doc:2", "Earlier", 10)]);
        assert!(response.acks[0].is_ack());
        assert_eq!(title(&store, "doc:2").as_deref(), Some("Earlier"));
    }

    #[test]
    fn unknown_kind_blocks_rest_of_batch() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        let tasks = [
            upsert("node-a", 1, "doc:1", "One", 10),
            with_kind(upsert("node-a", 2, "doc:2", "Two", 10), "mystery"),
            upsert("node-a", 3, "doc:3", "Three", 10),
        ];
        let response = apply(&handler, &tasks);

        assert_eq!(response.acked_prefix(), 1);
        let codes: Vec<_> = response.acks[1..]
            .iter()
            .map(|a| a.error.as_ref().unwrap().code)
            .collect();
        assert_eq!(codes, [NackCode::UnknownKind, NackCode::Blocked]);
        assert!(store.get("cms.document", "doc:3").is_none());
        assert_eq!(handler.stats().snapshot().nacks_sent, 2);
    }

    #[test]
    fn newer_schema_version_gets_versioned_nack() {
        let (handler, _) = setup(ConflictPolicy::LastWriterWins);
        let mut task = upsert("node-a", 1, "doc:1", "One", 10);
        task.schema_version = 7;
        let response = apply(&handler, &[task]);

        let error = response.acks[0].error.as_ref().unwrap();
        assert_eq!(error.code, NackCode::UnsupportedSchemaVersion);
        assert_eq!(error.supported_version, Some(1));
    }

    #[test]
    fn handler_failure_is_nacked_and_retried() {
        let (handler, _) = setup(ConflictPolicy::LastWriterWins);
        let task = with_kind(upsert("node-a", 1, "doc:1", "One", 10), "broken");
        let response = apply(&handler, &[task.clone()]);
        assert_eq!(response.acks[0].error.as_ref().unwrap().code, NackCode::HandlerFailed);

        // the failed task did not advance the watermark
        let response = apply(&handler, &[task]);
        assert_eq!(response.acks[0].error.as_ref().unwrap().code, NackCode::HandlerFailed);
        assert_eq!(handler.stats().snapshot().duplicates_ignored, 0);
    }

    #[test]
    fn last_writer_wins_across_origins() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        apply(&handler, &[upsert("node-b", 1, "doc:1", "From B", 200)]);
        let response = apply(&handler, &[upsert("node-a", 1, "doc:1", "From A", 100)]);

        assert!(response.acks[0].is_ack());
        assert_eq!(title(&store, "doc:1").as_deref(), Some("From B"));
        assert_eq!(handler.stats().snapshot().tasks_skipped, 1);
    }

    #[test]
    fn remote_task_loses_to_newer_local_write() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        let versions = Arc::new(VersionLedger::unbounded());
        let handler = handler.with_versions(Arc::clone(&versions));

        // node-b wrote doc:1 locally at 200 before node-a's older edit arrived
        let local = ObjectPayload::new().with_field("title", serde_json::json!("Local"));
        store.upsert("cms.document", "doc:1", &local).unwrap();
        versions.stamp_local("cms.document", "doc:1", &ServerId::new("node-b"), 200);

        let response = apply(&handler, &[upsert("node-a", 1, "doc:1", "From A", 100)]);
        assert!(response.acks[0].is_ack());
        assert_eq!(title(&store, "doc:1").as_deref(), Some("Local"));
        assert_eq!(handler.stats().snapshot().tasks_skipped, 1);

        let response = apply(&handler, &[upsert("node-a", 2, "doc:1", "Newer A", 300)]);
        assert!(response.acks[0].is_ack());
        assert_eq!(title(&store, "doc:1").as_deref(), Some("Newer A"));
        assert_eq!(
            versions.current("cms.document", "doc:1").map(|s| s.created_at),
            Some(300)
        );
    }

    #[test]
    fn idle_watermarks_and_versions_are_pruned() {
        let hour = 60 * 60 * 1000;
        let (handler, _) = setup_with(
            ConflictPolicy::LastWriterWins,
            |config| config.with_version_retention(Some(Duration::from_millis(24 * hour))),
        );
        let origin = ServerId::new("node-a");
        for i in 0..50u64 {
            let task = upsert("node-a", i + 1, &format!("doc:{i}"), "T", 10);
            handler.apply_batch_at(&origin, ApplyRequest::new(&[task]), hour);
        }
        assert_eq!(handler.watermark_count(), 50);
        assert_eq!(handler.versions().len(), 50);

        // a day and a half later only the new key is remembered
        let task = upsert("node-a", 51, "doc:new", "T", 10);
        handler.apply_batch_at(&origin, ApplyRequest::new(&[task]), 36 * hour);
        assert_eq!(handler.watermark_count(), 1);
        assert_eq!(handler.versions().len(), 1);
    }

    #[test]
    fn duplicates_refresh_their_watermark() {
        let hour = 60 * 60 * 1000;
        let (handler, store) = setup_with(
            ConflictPolicy::LastWriterWins,
            |config| config.with_version_retention(Some(Duration::from_millis(24 * hour))),
        );
        let origin = ServerId::new("node-a");
        let one = upsert("node-a", 1, "doc:1", "One", 10);
        handler.apply_batch_at(&origin, ApplyRequest::new(&[one.clone()]), 0);
        handler.apply_batch_at(&origin, ApplyRequest::new(&[one.clone()]), 20 * hour);
        handler.apply_batch_at(&origin, ApplyRequest::new(&[upsert("node-a", 2, "doc:2", "Two", 10)]), 30 * hour);

        assert_eq!(handler.watermark_count(), 2);
        handler.apply_batch_at(&origin, ApplyRequest::new(&[one]), 31 * hour);
        assert_eq!(handler.stats().snapshot().duplicates_ignored, 2);
        assert!(store.get("cms.document", "doc:1").is_some());
    }

    #[test]
    fn apply_all_takes_arrival_order() {
        let (handler, store) = setup(ConflictPolicy::ApplyAll);
        apply(&handler, &[upsert("node-b", 1, "doc:1", "From B", 200)]);
        apply(&handler, &[upsert("node-a", 1, "doc:1", "From A", 100)]);
        assert_eq!(title(&store, "doc:1").as_deref(), Some("From A"));
    }

    #[test]
    fn unsequenced_tasks_bypass_watermark() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        apply(&handler, &[upsert("node-a", 9, "doc:1", "Nine", 10)]);
        let response = apply(&handler, &[upsert("node-a", 0, "doc:1", "Dependency", 5)]);
        assert!(response.acks[0].is_ack());
        assert_eq!(title(&store, "doc:1").as_deref(), Some("Dependency"));
    }

    #[test]
    fn signed_request_round_trip() {
        let (handler, store) = setup(ConflictPolicy::LastWriterWins);
        let body = ApplyRequest::new(&[upsert("node-a", 1, "doc:1", "One", 10)])
            .to_json()
            .unwrap();
        let now = unix_millis();
        let headers = SignedHeaders {
            origin: Some("node-a".into()),
            timestamp: Some(now.to_string()),
            signature: Some(signing::sign(TOKEN.as_bytes(), "node-a", now, &body).unwrap()),
        };

        let response = handler.handle(&headers, &body).unwrap();
        assert_eq!(response.acked_prefix(), 1);
        assert!(store.get("cms.document", "doc:1").is_some());
    }

    #[test]
    fn sender_cannot_relay_other_origins() {
        let (handler, _) = setup(ConflictPolicy::LastWriterWins);
        let body = ApplyRequest::new(&[upsert("node-b", 1, "doc:1", "One", 10)])
            .to_json()
            .unwrap();
        let now = unix_millis();
        let headers = SignedHeaders {
            origin: Some("node-a".into()),
            timestamp: Some(now.to_string()),
            signature: Some(signing::sign(TOKEN.as_bytes(), "node-a", now, &body).unwrap()),
        };
        let err = handler.handle(&headers, &body).unwrap_err();
        assert!(matches!(err, ServerError::NotAuthorized(_)));
    }

    #[test]
    fn malformed_body_is_rejected() {
        let (handler, _) = setup(ConflictPolicy::LastWriterWins);
        let now = unix_millis();
        let headers = SignedHeaders {
            origin: Some("node-a".into()),
            timestamp: Some(now.to_string()),
            signature: Some(signing::sign(TOKEN.as_bytes(), "node-a", now, b"nope").unwrap()),
        };
        let err = handler.handle(&headers, b"nope").unwrap_err();
        assert!(err.is_client_error());
    }
}
