//! The replicated unit of change.

use crate::conflict::VersionStamp;
use crate::ids::{GroupTag, SequenceId, ServerId, TaskKindId};
use serde::{Deserialize, Serialize};

/// One captured state change.
///
/// Tasks are created by the task logger on the origin node, which stamps
/// them with a [`SequenceId`] from its monotonic counter. Once created a
/// task is never mutated; the optimizer replaces queue entries instead of
/// editing tasks in place.
///
/// # Fields
///
/// - `sequence_id`: position in the origin's change stream
/// - `kind`: registered task kind that knows how to apply it
/// - `object_type` / `target_key`: what the change affects
/// - `payload`: kind-specific opaque bytes
/// - `origin`: node that produced the change
/// - `created_at`: Unix millis at capture time
/// - `groups`: routing tags (empty means every target)
/// - `schema_version`: payload schema version of the emitting node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Sequence id assigned by the origin's logger.
    pub sequence_id: SequenceId,
    /// Task kind.
    pub kind: TaskKindId,
    /// Affected object type, e.g. `cms.document` or `file`.
    pub object_type: String,
    /// Affected key within the object type.
    pub target_key: String,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
    /// Originating node.
    pub origin: ServerId,
    /// Capture time (Unix millis).
    pub created_at: u64,
    /// Routing tags.
    pub groups: Vec<GroupTag>,
    /// Payload schema version.
    pub schema_version: u16,
}

impl Task {
    /// Returns true if this task and `other` affect the same object.
    #[must_use]
    pub fn same_key(&self, other: &Task) -> bool {
        self.object_type == other.object_type && self.target_key == other.target_key
    }

    /// Returns the stamp used for last-writer-wins reconciliation.
    #[must_use]
    pub fn version_stamp(&self) -> VersionStamp {
        VersionStamp::new(self.created_at, self.origin.clone())
    }

    /// Returns a copy of this task carrying a different payload.
    ///
    /// Used when the optimizer merges entries and when staging rewrites
    /// references; the result keeps the original sequence id.
    #[must_use]
    pub fn with_payload(&self, payload: Vec<u8>) -> Task {
        Task {
            payload,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(seq: u64, key: &str) -> Task {
        Task {
            sequence_id: SequenceId(seq),
            kind: TaskKindId::new("object.upsert"),
            object_type: "cms.document".into(),
            target_key: key.into(),
            payload: b"v1".to_vec(),
            origin: ServerId::new("node-a"),
            created_at: 1_700_000_000_000,
            groups: Vec::new(),
            schema_version: 1,
        }
    }

    #[test]
    fn same_key_ignores_kind_and_sequence() {
        let a = task(1, "doc:5");
        let mut b = task(2, "doc:5");
        b.kind = TaskKindId::new("object.delete");
        assert!(a.same_key(&b));
        assert!(!a.same_key(&task(3, "doc:6")));
    }

    #[test]
    fn with_payload_keeps_identity() {
        let original = task(7, "doc:5");
        let merged = original.with_payload(b"v2".to_vec());
        assert_eq!(merged.sequence_id, SequenceId(7));
        assert_eq!(merged.payload, b"v2");
        assert_eq!(original.payload, b"v1");
    }
}
