//! Benchmark utilities.

use farmsync_core::{ApplyOutcome, ApplyError, TaskHandler};
use farmsync_protocol::{SequenceId, ServerId, Task, TaskKindId};
use rand::Rng;

/// Generate random payload bytes of the specified size.
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Build a task for `kind` on `object_type/key`.
pub fn task(seq: u64, kind: &str, object_type: &str, key: &str, payload_size: usize) -> Task {
    Task {
        sequence_id: SequenceId(seq),
        kind: TaskKindId::new(kind),
        object_type: object_type.to_string(),
        target_key: key.to_string(),
        payload: random_payload(payload_size),
        origin: ServerId::new("bench-origin"),
        created_at: seq,
        groups: Vec::new(),
        schema_version: 1,
    }
}

/// Generate `count` tasks spread over `keys` distinct keys.
pub fn generate_tasks(count: usize, keys: usize, payload_size: usize) -> Vec<Task> {
    (0..count)
        .map(|i| {
            let key = format!("node-{}", i % keys.max(1));
            task(i as u64 + 1, "cms.document.upsert", "cms.document", &key, payload_size)
        })
        .collect()
}

/// Handler that accepts everything.
pub struct NoopHandler;

impl TaskHandler for NoopHandler {
    fn apply(&self, _task: &Task) -> Result<ApplyOutcome, ApplyError> {
        Ok(ApplyOutcome::Applied)
    }
}
