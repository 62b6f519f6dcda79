//! Verify command implementation.

use farmsync_core::journal::{JournalIterator, JournalRecord};
use farmsync_core::NodeDir;
use farmsync_protocol::ServerId;
use farmsync_storage::FileBackend;
use std::collections::HashMap;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Bytes after the last complete record.
    pub torn_bytes: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let journal = NodeDir::journal_path_in(path);
    println!("Verifying journal at {}", journal.display());
    println!();

    if !journal.exists() {
        println!("Journal not found (this is normal for a node that never logged a task)");
        return Ok(());
    }

    let backend = FileBackend::open(&journal)?;
    let result = verify_journal(&backend)?;

    println!("  Records checked: {}", result.records_checked);
    if result.torn_bytes > 0 {
        println!(
            "  Torn tail:       {} bytes (an interrupted write, discarded on next start)",
            result.torn_bytes
        );
    }
    for error in &result.errors {
        println!("  ✗ {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed");
        Err("Verification failed".into())
    }
}

/// Checks framing, checksums and ordering of every record.
///
/// Ordering rules:
/// - a task's sequence id never exceeds the reservation recorded before it
/// - tasks on the same target and key are enqueued in sequence order
pub fn verify_journal(
    backend: &FileBackend,
) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let mut reserved = 0u64;
    let mut last_on_key: HashMap<(ServerId, String, String), u64> = HashMap::new();

    let mut records = JournalIterator::new(backend)?;
    for item in records.by_ref() {
        let (offset, record) = match item {
            Ok(item) => item,
            Err(e) => {
                result.errors.push(e.to_string());
                break;
            }
        };
        result.records_checked += 1;

        match &record {
            JournalRecord::Reserve { up_to } => reserved = reserved.max(up_to.as_u64()),
            JournalRecord::Enqueue { target, task } | JournalRecord::Hold { target, task } => {
                let seq = task.sequence_id.as_u64();
                if seq > reserved {
                    result.errors.push(format!(
                        "offset {offset}: sequence id {seq} beyond reservation {reserved}"
                    ));
                }
                let key = (target.clone(), task.object_type.clone(), task.target_key.clone());
                if let Some(previous) = last_on_key.insert(key, seq) {
                    if previous >= seq {
                        result.errors.push(format!(
                            "offset {offset}: {target} {}/{} enqueued #{seq} after #{previous}",
                            task.object_type, task.target_key
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    result.torn_bytes = records.torn_bytes();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_protocol::{SequenceId, Task, TaskKindId};
    use farmsync_storage::StorageBackend;

    fn task(seq: u64, key: &str) -> Task {
        Task {
            sequence_id: SequenceId(seq),
            kind: TaskKindId::new("object.delete"),
            object_type: "cms.document".into(),
            target_key: key.into(),
            payload: Vec::new(),
            origin: "farm-node-1".into(),
            created_at: 1,
            groups: Vec::new(),
            schema_version: 1,
        }
    }

    fn journal(records: &[JournalRecord]) -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("journal.log")).unwrap();
        for record in records {
            backend.append(&record.encode_frame().unwrap()).unwrap();
        }
        (dir, backend)
    }

    fn enqueue(seq: u64, key: &str) -> JournalRecord {
        JournalRecord::Enqueue {
            target: "farm-node-2".into(),
            task: task(seq, key),
        }
    }

    #[test]
    fn well_formed_journal_passes() {
        let (_dir, backend) = journal(&[
            JournalRecord::Reserve { up_to: SequenceId(10) },
            enqueue(1, "doc:1"),
            enqueue(2, "doc:1"),
            JournalRecord::Delivered {
                target: "farm-node-2".into(),
                sequence_id: SequenceId(1),
            },
        ]);
        let result = verify_journal(&backend).unwrap();
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.records_checked, 4);
    }

    #[test]
    fn detects_unreserved_sequence_ids() {
        let (_dir, backend) = journal(&[enqueue(1, "doc:1")]);
        let result = verify_journal(&backend).unwrap();
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn detects_reordered_key() {
        let (_dir, backend) = journal(&[
            JournalRecord::Reserve { up_to: SequenceId(10) },
            enqueue(5, "doc:1"),
            enqueue(3, "doc:1"),
        ]);
        let result = verify_journal(&backend).unwrap();
        assert!(result.errors[0].contains("after #5"));
    }

    #[test]
    fn reports_torn_tail_without_failing() {
        let (_dir, mut backend) = journal(&[JournalRecord::Reserve { up_to: SequenceId(10) }]);
        backend.append(b"FSJ").unwrap();
        let result = verify_journal(&backend).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.torn_bytes, 3);
    }
}
