//! Dump journal command implementation.

use farmsync_core::journal::{JournalIterator, JournalRecord};
use farmsync_core::NodeDir;
use farmsync_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct JournalRecordInfo {
    /// Offset in the journal file.
    pub offset: u64,
    /// Record type.
    pub record_type: String,
    /// Target server (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Sequence id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u64>,
    /// Task kind (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// `object_type/target_key` (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Payload size in bytes (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
}

impl JournalRecordInfo {
    fn new(offset: u64, record: &JournalRecord) -> Self {
        let mut info = Self {
            offset,
            record_type: format!("{:?}", record.record_type()),
            target: record.target().map(ToString::to_string),
            sequence_id: None,
            kind: None,
            key: None,
            payload_size: None,
        };
        match record {
            JournalRecord::Enqueue { task, .. }
            | JournalRecord::Hold { task, .. }
            | JournalRecord::Merged { task, .. } => {
                info.sequence_id = Some(task.sequence_id.as_u64());
                info.kind = Some(task.kind.to_string());
                info.key = Some(format!("{}/{}", task.object_type, task.target_key));
                info.payload_size = Some(task.payload.len());
            }
            JournalRecord::Release { sequence_id, .. }
            | JournalRecord::Delivered { sequence_id, .. }
            | JournalRecord::Discard { sequence_id, .. } => {
                info.sequence_id = Some(sequence_id.as_u64());
            }
            JournalRecord::Reserve { up_to } => info.sequence_id = Some(up_to.as_u64()),
            JournalRecord::PurgeTarget { .. } => {}
        }
        info
    }
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    start_offset: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let journal = NodeDir::journal_path_in(path);
    if !journal.exists() {
        return Err("Journal file not found".into());
    }

    let backend = FileBackend::open(&journal)?;
    let records = read_records(&backend, start_offset, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => print_text_output(&records),
    }
    Ok(())
}

fn read_records(
    backend: &FileBackend,
    start_offset: u64,
    limit: Option<usize>,
) -> Result<Vec<JournalRecordInfo>, Box<dyn std::error::Error>> {
    let mut records = Vec::new();
    for item in JournalIterator::new(backend)? {
        let (offset, record) = item?;
        if offset < start_offset {
            continue;
        }
        if records.len() >= limit.unwrap_or(usize::MAX) {
            break;
        }
        records.push(JournalRecordInfo::new(offset, &record));
    }
    Ok(records)
}

fn print_text_output(records: &[JournalRecordInfo]) {
    println!(
        "{:>10}  {:<12} {:<20} {:>8}  {:<18} KEY",
        "OFFSET", "TYPE", "TARGET", "SEQ", "KIND"
    );
    println!("{}", "─".repeat(90));

    for record in records {
        let seq = record
            .sequence_id
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{:>10}  {:<12} {:<20} {:>8}  {:<18} {}",
            record.offset,
            record.record_type,
            record.target.as_deref().unwrap_or("-"),
            seq,
            record.kind.as_deref().unwrap_or("-"),
            record.key.as_deref().unwrap_or(""),
        );
    }

    println!();
    println!("Total: {} records", records.len());
}
