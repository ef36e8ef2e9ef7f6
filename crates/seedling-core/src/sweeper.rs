//! # Orphan Sweeper
//!
//! Post-load deletion of records whose declarations disappeared.
//!
//! Unlike the parse phase, the sweep is not all-or-nothing: each orphan is
//! deleted and committed on its own, and a failed deletion only rolls back
//! itself. Orphans are visited in descending provenance row order, so records
//! created later (typically the dependent ones) go first.
//!
//! When a deletion fails (usually because another record still points at the
//! orphan) the record is deactivated instead if its model has an `active`
//! flag. Its provenance row is kept so a later load retries the deletion.

use crate::primitives::ACTIVE_FIELD;
use crate::report::{OrphanFailure, SweepReport};
use crate::store::{ContextOverride, ObjectStore, scoped};
use crate::{FieldValue, FieldValueMap, ProvenanceRecord, SeedlingError};
use std::collections::BTreeSet;

/// Deletes the orphans of one module load.
pub struct OrphanSweeper<'s, S: ObjectStore> {
    store: &'s mut S,
}

impl<'s, S: ObjectStore> OrphanSweeper<'s, S> {
    pub fn new(store: &'s mut S) -> Self {
        Self { store }
    }

    /// Delete the records behind the ids of `module` left in `to_delete`.
    ///
    /// Only store failures while reading provenance or rolling back abort the
    /// sweep; failed deletions are reported.
    pub fn sweep(
        &mut self,
        module: &str,
        to_delete: &BTreeSet<String>,
    ) -> Result<SweepReport, SeedlingError> {
        let mut report = SweepReport::default();
        if to_delete.is_empty() {
            return Ok(report);
        }

        let mut orphans: Vec<ProvenanceRecord> = {
            let scope = scoped(&mut *self.store, ContextOverride::new().active_test(false));
            scope.provenance(module)?
        };
        orphans.retain(|row| to_delete.contains(&row.local_id));
        orphans.sort_by(|a, b| b.row.cmp(&a.row));

        for orphan in orphans {
            let symbolic_id = orphan.symbolic_id().to_string();
            let Ok(def) = self.store.registry().model(&orphan.model).cloned() else {
                tracing::warn!(
                    "Could not delete id {} of model {} because model no longer exists.",
                    orphan.db_id,
                    orphan.model
                );
                report.stale.push(symbolic_id);
                continue;
            };

            tracing::info!("Deleting {}@{}", orphan.db_id, orphan.model);
            match self.delete(&orphan) {
                Ok(()) => report.deleted.push(symbolic_id),
                Err(err) => {
                    self.store.rollback()?;
                    tracing::error!(
                        "Could not delete id: {} of model {}\n\
                         There should be some relation that points to this resource\n\
                         You should manually fix this and reload the module\n\
                         Error: {}",
                        orphan.db_id,
                        orphan.model,
                        err
                    );
                    let deactivated = def.has_active() && self.deactivate(&orphan)?;
                    report.failed.push(OrphanFailure {
                        symbolic_id,
                        model: orphan.model.clone(),
                        db_id: orphan.db_id,
                        reason: err.to_string(),
                        deactivated,
                    });
                }
            }
        }
        Ok(report)
    }

    fn delete(&mut self, orphan: &ProvenanceRecord) -> Result<(), SeedlingError> {
        let mut scope = scoped(&mut *self.store, ContextOverride::new().active_test(false));
        scope.delete(&orphan.model, &[orphan.db_id])?;
        scope.delete_provenance(&[orphan.row])?;
        scope.commit()
    }

    /// Soft-delete an orphan; `Ok(false)` when that failed too.
    fn deactivate(&mut self, orphan: &ProvenanceRecord) -> Result<bool, SeedlingError> {
        let mut values = FieldValueMap::new();
        values.insert(ACTIVE_FIELD.to_string(), FieldValue::Bool(false));
        let result = {
            let mut scope = scoped(&mut *self.store, ContextOverride::new().active_test(false));
            scope
                .write(&orphan.model, &[(vec![orphan.db_id], values)])
                .and_then(|()| scope.commit())
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                self.store.rollback()?;
                tracing::error!(
                    "Could not deactivate id {} of model {}: {}",
                    orphan.db_id,
                    orphan.model,
                    err
                );
                Ok(false)
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDef, FieldKind, ModelDef, OnDelete, Registry};
    use crate::store::MemoryStore;
    use crate::{DbId, NewProvenance};

    fn registry() -> Registry {
        Registry::from_models([
            ModelDef::new("res.country")
                .with_field("code", FieldDef::new(FieldKind::Char))
                .with_field(
                    "active",
                    FieldDef::new(FieldKind::Boolean).default_value(FieldValue::Bool(true)),
                ),
            ModelDef::new("res.tax").with_field("code", FieldDef::new(FieldKind::Char)),
            ModelDef::new("res.partner").with_field(
                "country",
                FieldDef::many2one("res.country").on_delete(OnDelete::Restrict),
            ),
        ])
    }

    fn track(store: &mut MemoryStore, model: &str, local: &str, values: FieldValueMap) -> DbId {
        let ids = store.create(model, vec![values]).expect("create");
        store
            .create_provenance(vec![NewProvenance {
                module: "geo".to_string(),
                local_id: local.to_string(),
                model: model.to_string(),
                db_id: ids[0],
                values: None,
                fs_values: None,
                noupdate: false,
            }])
            .expect("provenance");
        ids[0]
    }

    fn candidates(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| (*id).to_string()).collect()
    }

    #[test]
    fn deletes_orphans_and_their_provenance() {
        let mut store = MemoryStore::new(registry());
        track(&mut store, "res.tax", "vat", FieldValueMap::new());
        track(&mut store, "res.tax", "kept", FieldValueMap::new());
        store.commit().expect("commit");

        let report = OrphanSweeper::new(&mut store)
            .sweep("geo", &candidates(&["vat"]))
            .expect("sweep");

        assert_eq!(report.deleted, vec!["geo.vat".to_string()]);
        assert_eq!(store.record_count("res.tax"), 1);
        let tracked = store.provenance("geo").expect("provenance");
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].local_id, "kept");
    }

    #[test]
    fn referenced_orphans_are_deactivated() {
        let mut store = MemoryStore::new(registry());
        let be = track(&mut store, "res.country", "be", FieldValueMap::new());
        let mut partner = FieldValueMap::new();
        partner.insert("country".to_string(), FieldValue::Id(be));
        store.create("res.partner", vec![partner]).expect("partner");
        track(&mut store, "res.tax", "vat", FieldValueMap::new());
        store.commit().expect("commit");

        let report = OrphanSweeper::new(&mut store)
            .sweep("geo", &candidates(&["be", "vat"]))
            .expect("sweep");

        // Descending row order: the tax goes first and succeeds.
        assert_eq!(report.deleted, vec!["geo.vat".to_string()]);
        assert_eq!(report.deactivated().collect::<Vec<_>>(), vec!["geo.be"]);
        let country = store.browse("res.country", &[be]).expect("browse");
        assert_eq!(country[0].get("active"), FieldValue::Bool(false));
        assert_eq!(store.provenance("geo").expect("provenance").len(), 1);
    }

    #[test]
    fn orphans_of_unknown_models_are_reported_stale() {
        let mut store = MemoryStore::new(registry());
        store
            .create_provenance(vec![NewProvenance {
                module: "geo".to_string(),
                local_id: "legacy".to_string(),
                model: "res.legacy".to_string(),
                db_id: DbId(3),
                values: None,
                fs_values: None,
                noupdate: false,
            }])
            .expect("provenance");
        store.commit().expect("commit");

        let report = OrphanSweeper::new(&mut store)
            .sweep("geo", &candidates(&["legacy"]))
            .expect("sweep");

        assert_eq!(report.stale, vec!["geo.legacy".to_string()]);
        assert_eq!(store.provenance("geo").expect("provenance").len(), 1);
    }
}
