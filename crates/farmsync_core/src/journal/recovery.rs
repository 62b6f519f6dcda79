//! Rebuilding queue contents from journal records.

use crate::journal::record::JournalRecord;
use farmsync_protocol::{SequenceId, ServerId, Task};
use std::collections::BTreeMap;

/// Live entries of one target after replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayedTarget {
    /// Delivery queue contents, in queue order.
    pub delivery: Vec<Task>,
    /// Review queue contents, in sequence order.
    pub held: Vec<Task>,
}

impl ReplayedTarget {
    fn remove(&mut self, sequence_id: SequenceId) {
        self.delivery.retain(|t| t.sequence_id != sequence_id);
        self.held.retain(|t| t.sequence_id != sequence_id);
    }
}

/// State reconstructed from a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalReplay {
    /// Live entries per target.
    pub targets: BTreeMap<ServerId, ReplayedTarget>,
    /// Highest reserved sequence id.
    pub reserved_up_to: u64,
    /// Highest sequence id seen in any task.
    pub max_sequence: u64,
    /// Number of records replayed.
    pub records: usize,
}

impl JournalReplay {
    /// Replays records in write order.
    ///
    /// Records that refer to entries which no longer exist are ignored;
    /// they are left behind when an entry was retired twice, e.g. a crash
    /// between a dispatcher removing an entry and compaction.
    pub fn replay<'a>(records: impl IntoIterator<Item = &'a JournalRecord>) -> Self {
        let mut replay = Self::default();
        for record in records {
            replay.apply(record);
        }
        replay
    }

    fn apply(&mut self, record: &JournalRecord) {
        self.records += 1;
        match record {
            JournalRecord::Reserve { up_to } => {
                self.reserved_up_to = self.reserved_up_to.max(up_to.as_u64());
            }
            JournalRecord::Enqueue { target, task } => {
                self.see(task);
                self.target(target).delivery.push(task.clone());
            }
            JournalRecord::Hold { target, task } => {
                self.see(task);
                let held = &mut self.target(target).held;
                held.push(task.clone());
                held.sort_by_key(|t| t.sequence_id);
            }
            JournalRecord::Release {
                target,
                sequence_id,
            } => {
                let state = self.target(target);
                if let Some(index) = state.held.iter().position(|t| t.sequence_id == *sequence_id) {
                    let task = state.held.remove(index);
                    state.delivery.push(task);
                }
            }
            JournalRecord::Delivered {
                target,
                sequence_id,
            }
            | JournalRecord::Discard {
                target,
                sequence_id,
            } => self.target(target).remove(*sequence_id),
            JournalRecord::Merged {
                target,
                absorbed,
                task,
            } => {
                self.max_sequence = self.max_sequence.max(absorbed.as_u64());
                let state = self.target(target);
                state.remove(*absorbed);
                if let Some(entry) = state
                    .delivery
                    .iter_mut()
                    .find(|t| t.sequence_id == task.sequence_id)
                {
                    *entry = task.clone();
                }
            }
            JournalRecord::PurgeTarget { target } => {
                self.targets.remove(target);
            }
        }
    }

    fn see(&mut self, task: &Task) {
        self.max_sequence = self.max_sequence.max(task.sequence_id.as_u64());
    }

    fn target(&mut self, target: &ServerId) -> &mut ReplayedTarget {
        self.targets.entry(target.clone()).or_default()
    }

    /// First sequence id that is safe to hand out after restart.
    #[must_use]
    pub fn next_sequence(&self) -> SequenceId {
        SequenceId(self.reserved_up_to.max(self.max_sequence) + 1)
    }

    /// Number of live entries across all targets.
    #[must_use]
    pub fn live_entries(&self) -> usize {
        self.targets
            .values()
            .map(|t| t.delivery.len() + t.held.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_protocol::TaskKindId;

    fn task(seq: u64, payload: &str) -> Task {
        Task {
            sequence_id: SequenceId(seq),
            kind: TaskKindId::new("object.upsert"),
            object_type: "cms.document".into(),
            target_key: "doc:5".into(),
            payload: payload.as_bytes().to_vec(),
            origin: "node-a".into(),
            created_at: seq,
            groups: Vec::new(),
            schema_version: 1,
        }
    }

    fn t(name: &str) -> ServerId {
        ServerId::new(name)
    }

    #[test]
    fn delivered_entries_are_gone() {
        let records = vec![
            JournalRecord::Reserve { up_to: SequenceId(1000) },
            JournalRecord::Enqueue { target: t("b"), task: task(1, "a") },
            JournalRecord::Enqueue { target: t("b"), task: task(2, "b") },
            JournalRecord::Enqueue { target: t("c"), task: task(1, "a") },
            JournalRecord::Delivered { target: t("b"), sequence_id: SequenceId(1) },
        ];
        let replay = JournalReplay::replay(&records);

        let b: Vec<_> = replay.targets[&t("b")].delivery.iter().map(|t| t.sequence_id.0).collect();
        assert_eq!(b, [2]);
        assert_eq!(replay.targets[&t("c")].delivery.len(), 1);
        assert_eq!(replay.next_sequence(), SequenceId(1001));
        assert_eq!(replay.live_entries(), 2);
    }

    #[test]
    fn merge_replaces_payload_and_drops_absorbed() {
        let records = vec![
            JournalRecord::Enqueue { target: t("b"), task: task(1, "v1") },
            JournalRecord::Enqueue { target: t("b"), task: task(2, "v2") },
            JournalRecord::Merged { target: t("b"), absorbed: SequenceId(2), task: task(1, "v2") },
        ];
        let replay = JournalReplay::replay(&records);
        let delivery = &replay.targets[&t("b")].delivery;
        assert_eq!(delivery.len(), 1);
        assert_eq!(delivery[0].payload, b"v2");
        assert_eq!(replay.next_sequence(), SequenceId(3));
    }

    #[test]
    fn release_moves_held_to_delivery() {
        let records = vec![
            JournalRecord::Hold { target: t("stage"), task: task(2, "x") },
            JournalRecord::Hold { target: t("stage"), task: task(1, "y") },
            JournalRecord::Release { target: t("stage"), sequence_id: SequenceId(1) },
        ];
        let replay = JournalReplay::replay(&records);
        let stage = &replay.targets[&t("stage")];
        assert_eq!(stage.delivery[0].sequence_id, SequenceId(1));
        assert_eq!(stage.held[0].sequence_id, SequenceId(2));
    }

    #[test]
    fn purge_abandons_target_but_keeps_sequence() {
        let records = vec![
            JournalRecord::Enqueue { target: t("b"), task: task(7, "a") },
            JournalRecord::PurgeTarget { target: t("b") },
            JournalRecord::Delivered { target: t("b"), sequence_id: SequenceId(7) },
        ];
        let replay = JournalReplay::replay(&records);
        assert_eq!(replay.live_entries(), 0);
        assert_eq!(replay.next_sequence(), SequenceId(8));
    }
}
