//! Queue optimizer.
//!
//! Runs under the queue lock whenever a task is pushed. Only `Pending`
//! entries are ever touched, and only on keys without an entry in flight
//! or failed: such an entry blocks every later entry on its key from being
//! optimized away. Entries on other keys are never moved.
//!
//! | Policy | Effect on pending entries with the same kind and key |
//! |---|---|
//! | `None` | nothing, the task is appended |
//! | `DropSuperseded` | removed, the task is appended |
//! | `GroupByKey` | the latest one absorbs the task and keeps its sequence id |

use crate::queue::QueueEntry;
use crate::registry::OptimizationPolicy;
use farmsync_protocol::{SequenceId, Task};
use std::collections::VecDeque;

/// Decision taken for an incoming task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Optimization {
    /// Append the task.
    Append,
    /// The listed entries were removed; append the task.
    Superseded {
        /// Removed sequence ids, in queue order.
        removed: Vec<SequenceId>,
    },
    /// The task was folded into an existing entry; do not append.
    Merged {
        /// Entry contents after the merge.
        merged: Task,
        /// Sequence id of the incoming task.
        absorbed: SequenceId,
    },
}

fn same_slot(entry: &QueueEntry, task: &Task) -> bool {
    entry.task.kind == task.kind && entry.task.same_key(task)
}

/// An entry in flight or failed on the key pins every later entry for that
/// key until it leaves the queue.
fn pinned(entries: &VecDeque<QueueEntry>, task: &Task) -> bool {
    entries
        .iter()
        .any(|entry| !entry.is_pending() && entry.task.same_key(task))
}

/// Applies `policy` for `incoming` to `entries`.
///
/// `merge` combines the payload of the existing entry with the incoming one
/// for `GroupByKey` kinds.
pub fn optimize<F>(
    entries: &mut VecDeque<QueueEntry>,
    incoming: &Task,
    policy: OptimizationPolicy,
    merge: F,
) -> Optimization
where
    F: Fn(&Task, &Task) -> Vec<u8>,
{
    match policy {
        OptimizationPolicy::None => Optimization::Append,
        _ if pinned(entries, incoming) => Optimization::Append,
        OptimizationPolicy::DropSuperseded => {
            let mut removed = Vec::new();
            entries.retain(|entry| {
                if entry.is_pending() && same_slot(entry, incoming) {
                    removed.push(entry.sequence_id());
                    false
                } else {
                    true
                }
            });
            if removed.is_empty() {
                Optimization::Append
            } else {
                Optimization::Superseded { removed }
            }
        }
        OptimizationPolicy::GroupByKey => {
            // The last entry on this key decides: merging across an entry of
            // another kind would move the incoming change before it.
            let last_on_key = entries
                .iter()
                .rposition(|entry| entry.task.same_key(incoming));
            let Some(index) = last_on_key else {
                return Optimization::Append;
            };
            let entry = &mut entries[index];
            if !entry.is_pending() || entry.task.kind != incoming.kind {
                return Optimization::Append;
            }

            let payload = merge(&entry.task, incoming);
            let mut merged = entry.task.with_payload(payload);
            merged.created_at = merged.created_at.max(incoming.created_at);
            entry.task = merged.clone();
            Optimization::Merged {
                merged,
                absorbed: incoming.sequence_id,
            }
        }
    }
}
