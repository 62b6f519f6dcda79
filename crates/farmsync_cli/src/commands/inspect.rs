//! Inspect command implementation.

use crate::commands::scan_journal;
use farmsync_core::journal::JournalReplay;
use serde::Serialize;
use std::path::Path;

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Complete records.
    pub record_count: usize,
    /// Records that no longer describe a live entry.
    pub dead_records: usize,
    /// Bytes of an unfinished trailing write.
    pub torn_bytes: u64,
    /// First sequence id the node will hand out.
    pub next_sequence: u64,
    /// Per-target entries.
    pub targets: Vec<TargetSummary>,
}

/// Live entries of one target.
#[derive(Debug, Serialize)]
pub struct TargetSummary {
    /// Target id.
    pub target: String,
    /// Entries waiting for delivery.
    pub queued: usize,
    /// Entries waiting for review.
    pub held: usize,
    /// Oldest queued sequence id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<u64>,
    /// Queued entries, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntrySummary>>,
}

/// One live entry.
#[derive(Debug, Serialize)]
pub struct EntrySummary {
    /// Sequence id.
    pub sequence_id: u64,
    /// Task kind.
    pub kind: String,
    /// `object_type/target_key`.
    pub key: String,
    /// True while waiting for review.
    pub held: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_entries: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let scan = scan_journal(path)?;
    let replay = JournalReplay::replay(&scan.records);
    let live = replay.live_entries();

    let targets = replay
        .targets
        .iter()
        .map(|(id, target)| TargetSummary {
            target: id.to_string(),
            queued: target.delivery.len(),
            held: target.held.len(),
            head: target.delivery.first().map(|t| t.sequence_id.as_u64()),
            entries: show_entries.then(|| {
                let queued = target.delivery.iter().map(|t| (t, false));
                let held = target.held.iter().map(|t| (t, true));
                queued
                    .chain(held)
                    .map(|(task, held)| EntrySummary {
                        sequence_id: task.sequence_id.as_u64(),
                        kind: task.kind.to_string(),
                        key: format!("{}/{}", task.object_type, task.target_key),
                        held,
                    })
                    .collect()
            }),
        })
        .collect();

    let result = InspectResult {
        path: path.display().to_string(),
        journal_size: scan.valid_len + scan.torn_bytes,
        record_count: scan.records.len(),
        dead_records: scan.records.len().saturating_sub(live),
        torn_bytes: scan.torn_bytes,
        next_sequence: replay.next_sequence().as_u64(),
        targets,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("FarmSync Node: {}", result.path);
    println!("═══════════════════════════════════════");
    println!();
    println!("Journal:");
    println!("  Size:          {} bytes", result.journal_size);
    println!("  Records:       {}", result.record_count);
    println!("  Dead records:  {}", result.dead_records);
    if result.torn_bytes > 0 {
        println!("  Torn tail:     {} bytes (discarded on next start)", result.torn_bytes);
    }
    println!("  Next sequence: {}", result.next_sequence);
    println!();

    if result.targets.is_empty() {
        println!("No live entries.");
        return;
    }

    println!("Targets:");
    for target in &result.targets {
        let head = target
            .head
            .map_or_else(|| "-".to_string(), |h| h.to_string());
        println!(
            "  {:<24} queued: {:>6}  held: {:>6}  head: {}",
            target.target, target.queued, target.held, head
        );
        for entry in target.entries.iter().flatten() {
            let marker = if entry.held { " (held)" } else { "" };
            println!(
                "      #{:<8} {:<18} {}{}",
                entry.sequence_id, entry.kind, entry.key, marker
            );
        }
    }
}
