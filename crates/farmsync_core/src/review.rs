//! Review queue for manually approved staging targets.

use farmsync_protocol::{SequenceId, Task};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Tasks held until an operator approves or rejects them.
///
/// Held tasks are kept in sequence order.
#[derive(Debug, Default)]
pub struct ReviewQueue {
    held: Mutex<BTreeMap<SequenceId, Task>>,
}

impl ReviewQueue {
    /// Creates an empty review queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds a task for review.
    pub fn hold(&self, task: Task) {
        self.held.lock().insert(task.sequence_id, task);
    }

    /// Returns the held tasks in sequence order.
    #[must_use]
    pub fn list(&self) -> Vec<Task> {
        self.held.lock().values().cloned().collect()
    }

    /// Returns the tasks an approval of `selected` releases.
    ///
    /// Earlier held tasks on the same key are released along with a
    /// selected task so the key's history reaches the target in order.
    /// Unknown sequence ids are ignored.
    #[must_use]
    pub fn release_set(&self, selected: &[SequenceId]) -> Vec<Task> {
        let held = self.held.lock();
        let chosen: Vec<&Task> = selected.iter().filter_map(|seq| held.get(seq)).collect();
        held.values()
            .filter(|task| {
                chosen
                    .iter()
                    .any(|c| task.sequence_id <= c.sequence_id && task.same_key(c))
            })
            .cloned()
            .collect()
    }

    /// Removes tasks by sequence id, returning those that were held.
    pub fn remove(&self, sequence_ids: &[SequenceId]) -> Vec<Task> {
        let mut held = self.held.lock();
        sequence_ids.iter().filter_map(|seq| held.remove(seq)).collect()
    }

    /// Removes everything.
    pub fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut *self.held.lock()).into_values().collect()
    }

    /// Number of held tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_protocol::TaskKindId;

    fn task(seq: u64, key: &str) -> Task {
        Task {
            sequence_id: SequenceId(seq),
            kind: TaskKindId::new("object.upsert"),
            object_type: "cms.document".into(),
            target_key: key.into(),
            payload: Vec::new(),
            origin: "author".into(),
            created_at: 0,
            groups: Vec::new(),
            schema_version: 1,
        }
    }

    #[test]
    fn approval_pulls_in_earlier_versions_of_the_key() {
        let review = ReviewQueue::new();
        review.hold(task(1, "doc:1"));
        review.hold(task(2, "doc:2"));
        review.hold(task(3, "doc:1"));
        review.hold(task(4, "doc:1"));

        let released: Vec<_> = review
            .release_set(&[SequenceId(3)])
            .iter()
            .map(|t| t.sequence_id.0)
            .collect();
        assert_eq!(released, [1, 3]);
    }

    #[test]
    fn remove_and_drain() {
        let review = ReviewQueue::new();
        review.hold(task(2, "a"));
        review.hold(task(1, "b"));
        assert_eq!(review.list()[0].sequence_id, SequenceId(1));

        assert_eq!(review.remove(&[SequenceId(2), SequenceId(9)]).len(), 1);
        assert_eq!(review.drain().len(), 1);
        assert!(review.is_empty());
    }
}
