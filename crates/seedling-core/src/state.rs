//! # Parse State
//!
//! Mutable state of one module load: the flags of the enclosing data
//! block, the deletion-candidate set, and the buffers of grouped blocks.

use crate::{DbId, FieldValueMap, ProvenanceRowId, ProvenanceUpdate};
use std::collections::{BTreeMap, BTreeSet};

/// Flags of the current `<data>` block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags {
    /// Existing records are left alone once the module is installed.
    pub noupdate: bool,
    /// Creations and writes are buffered until the block closes.
    pub grouped: bool,
    /// The block is skipped entirely.
    pub skip: bool,
}

/// A creation deferred until the end of a grouped block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCreation {
    pub local_id: String,
    pub values: FieldValueMap,
}

/// A write deferred until the end of a grouped block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub local_id: String,
    pub record: DbId,
    pub row: ProvenanceRowId,
    /// Fields eligible for update.
    pub to_update: FieldValueMap,
    /// Last-synced values before this write.
    pub old_values: FieldValueMap,
}

/// Per-load parse state.
#[derive(Debug, Clone, Default)]
pub struct ParseState {
    pub flags: BlockFlags,
    /// Tracked ids of the module not yet re-declared.
    pub to_delete: BTreeSet<String>,
    creations: BTreeMap<String, Vec<PendingCreation>>,
    writes: BTreeMap<(String, String), Vec<PendingWrite>>,
    provenance_updates: Vec<(ProvenanceRowId, ProvenanceUpdate)>,
}

impl ParseState {
    #[must_use]
    pub fn new(to_delete: BTreeSet<String>) -> Self {
        Self {
            to_delete,
            ..Self::default()
        }
    }

    /// Buffer a creation; a second declaration of the same id is merged
    /// into the first one, later values winning.
    pub fn buffer_creation(&mut self, model: &str, local_id: &str, values: FieldValueMap) {
        let pending = self.creations.entry(model.to_string()).or_default();
        match pending.iter_mut().find(|c| c.local_id == local_id) {
            Some(existing) => existing.values.extend(values),
            None => pending.push(PendingCreation {
                local_id: local_id.to_string(),
                values,
            }),
        }
    }

    /// Buffer a write for `(module, model)`.
    pub fn buffer_write(&mut self, module: &str, model: &str, write: PendingWrite) {
        self.writes
            .entry((module.to_string(), model.to_string()))
            .or_default()
            .push(write);
    }

    /// Buffer a provenance update, flushed at block close.
    pub fn buffer_provenance(&mut self, row: ProvenanceRowId, update: ProvenanceUpdate) {
        self.provenance_updates.push((row, update));
    }

    /// Drain buffered creations, keyed by model.
    pub fn take_creations(&mut self) -> BTreeMap<String, Vec<PendingCreation>> {
        std::mem::take(&mut self.creations)
    }

    /// Drain buffered writes, keyed by `(module, model)`.
    pub fn take_writes(&mut self) -> BTreeMap<(String, String), Vec<PendingWrite>> {
        std::mem::take(&mut self.writes)
    }

    /// Drain buffered provenance updates.
    pub fn take_provenance_updates(&mut self) -> Vec<(ProvenanceRowId, ProvenanceUpdate)> {
        std::mem::take(&mut self.provenance_updates)
    }

    /// Whether anything is waiting to be flushed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.creations.is_empty() || !self.writes.is_empty() || !self.provenance_updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldValue;

    fn values(fields: &[(&str, &str)]) -> FieldValueMap {
        fields
            .iter()
            .map(|(field, value)| (field.to_string(), FieldValue::text(*value)))
            .collect()
    }

    #[test]
    fn redeclared_creation_merges_in_place() {
        let mut state = ParseState::default();
        assert!(!state.is_dirty());
        state.buffer_creation("res.country", "be", values(&[("name", "Belgium"), ("code", "BE")]));
        state.buffer_creation("res.country", "fr", values(&[("name", "France")]));
        state.buffer_creation("res.country", "be", values(&[("name", "Belgique")]));
        assert!(state.is_dirty());

        let creations = state.take_creations();
        let pending = &creations["res.country"];
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].local_id, "be");
        assert_eq!(pending[0].values, values(&[("name", "Belgique"), ("code", "BE")]));
        assert!(!state.is_dirty());
    }
}
