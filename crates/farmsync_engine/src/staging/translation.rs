use farmsync_protocol::ServerId;
use parking_lot::RwLock;
use std::collections::HashMap;

type Slot = (ServerId, String, i64);

/// Maps `(target, object_type, source_id)` to the id the target assigned.
///
/// Filled from acks carrying an `assignedId`.
#[derive(Debug, Default)]
pub struct TranslationTable {
    ids: RwLock<HashMap<Slot, i64>>,
}

impl TranslationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the target-side id.
    #[must_use]
    pub fn get(&self, target: &ServerId, object_type: &str, source_id: i64) -> Option<i64> {
        self.ids
            .read()
            .get(&(target.clone(), object_type.to_string(), source_id))
            .copied()
    }

    /// Records a translation, replacing any earlier one.
    pub fn insert(&self, target: &ServerId, object_type: &str, source_id: i64, target_id: i64) {
        self.ids
            .write()
            .insert((target.clone(), object_type.to_string(), source_id), target_id);
    }

    /// Drops every translation for a target.
    pub fn forget_target(&self, target: &ServerId) -> usize {
        let mut ids = self.ids.write();
        let before = ids.len();
        ids.retain(|(t, _, _), _| t != target);
        before - ids.len()
    }

    /// Number of translations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translations_are_per_target() {
        let table = TranslationTable::new();
        let stage: ServerId = "stage".into();
        let prod: ServerId = "prod".into();
        table.insert(&stage, "cms.document", 12, 3012);

        assert_eq!(table.get(&stage, "cms.document", 12), Some(3012));
        assert_eq!(table.get(&prod, "cms.document", 12), None);
        assert_eq!(table.get(&stage, "cms.user", 12), None);

        assert_eq!(table.forget_target(&stage), 1);
        assert!(table.is_empty());
    }
}
