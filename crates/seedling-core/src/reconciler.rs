//! # Reconciler
//!
//! Three-way merge between the declared value of a field, its live value,
//! and the value last synced from a document.
//!
//! For a tracked symbolic id, each declared field is compared with the live
//! record:
//! - equal: nothing to do
//! - live value equals the baseline (last-synced value, or the model default
//!   if the field was never synced): the field is updated
//! - otherwise a user changed it since the last sync: the field is kept and a
//!   warning is logged
//!
//! Untracked ids are created. In grouped blocks creations and writes are
//! buffered and issued as one store call per model when the block closes.

use crate::expression::{self, EmptyEnvironment};
use crate::primitives::{DEFAULT_LANGUAGE, LEGACY_REFERENCE_SENTINEL_SUFFIX};
use crate::registry::{FieldKind, ModelDef};
use crate::report::{LoadReport, PreservedField};
use crate::resolver::{IdentityResolver, ProvenanceSnapshot, SnapshotUpdate};
use crate::state::{BlockFlags, ParseState, PendingCreation, PendingWrite};
use crate::store::{ContextOverride, ObjectStore, scoped};
use crate::{
    DbId, FieldValue, FieldValueMap, ModuleState, NewProvenance, ProvenanceUpdate, Record,
    SeedlingError, SymbolicId,
};
use std::collections::BTreeSet;

/// Merge engine of one module load.
pub struct Reconciler<'s, S: ObjectStore> {
    store: &'s mut S,
    resolver: IdentityResolver,
    module: String,
    module_state: ModuleState,
    state: ParseState,
    report: LoadReport,
}

impl<'s, S: ObjectStore> Reconciler<'s, S> {
    /// Start a load of `module`.
    ///
    /// Every id tracked for the module becomes a deletion candidate.
    pub fn new(
        store: &'s mut S,
        module: &str,
        module_state: ModuleState,
    ) -> Result<Self, SeedlingError> {
        let to_delete: BTreeSet<String> = {
            let scope = scoped(&mut *store, ContextOverride::new().active_test(false));
            scope
                .provenance(module)?
                .into_iter()
                .map(|row| row.local_id)
                .collect()
        };
        Ok(Self {
            store,
            resolver: IdentityResolver::new(),
            module: module.to_string(),
            module_state,
            state: ParseState::new(to_delete),
            report: LoadReport::new(module),
        })
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    #[must_use]
    pub fn module_state(&self) -> ModuleState {
        self.module_state
    }

    /// The underlying store.
    pub fn store(&mut self) -> &mut S {
        &mut *self.store
    }

    #[must_use]
    pub fn state(&self) -> &ParseState {
        &self.state
    }

    #[must_use]
    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// Resolve a possibly dotted symbolic id of this load.
    pub fn resolve(&mut self, raw: &str) -> Result<DbId, SeedlingError> {
        self.resolver.resolve(&mut *self.store, raw, &self.module)
    }

    /// Flags of the current data block.
    #[must_use]
    pub fn flags(&self) -> BlockFlags {
        self.state.flags
    }

    /// Enter a data block.
    pub fn open_block(&mut self, flags: BlockFlags) {
        self.state.flags = flags;
    }

    /// Leave a data block, flushing its buffers.
    pub fn close_block(&mut self) -> Result<(), SeedlingError> {
        self.flush()?;
        self.state.flags = BlockFlags::default();
        Ok(())
    }

    /// Reconcile one declared record.
    pub fn import_record(
        &mut self,
        model: &str,
        values: FieldValueMap,
        symbolic_id: &str,
    ) -> Result<(), SeedlingError> {
        if symbolic_id.is_empty() {
            return Err(SeedlingError::Structural(format!(
                "a record of {} has no id",
                model
            )));
        }
        let id = SymbolicId::parse(symbolic_id, &self.module)?;
        let def = self.store.registry().model(model)?.clone();

        let mut declared = FieldValueMap::new();
        for (field, value) in values {
            if def.field(&field)?.kind.is_multi_valued() {
                return Err(SeedlingError::UnhandledFieldType {
                    model: def.name.clone(),
                    field,
                });
            }
            let value = def.coerce(&field, value)?;
            declared.insert(field, value);
        }

        let snapshot = self
            .resolver
            .get(&mut *self.store, &id.module, &id.local)?
            .cloned();

        match snapshot {
            Some(snapshot) => self.reconcile_existing(&def, &id, snapshot, declared),
            None if id.module != self.module => Err(SeedlingError::UnresolvedReference(
                format!("Reference to {} not found", id),
            )),
            None if self.state.flags.grouped => {
                self.state.buffer_creation(model, &id.local, declared);
                Ok(())
            }
            None => self.create_records(
                &def,
                vec![PendingCreation {
                    local_id: id.local,
                    values: declared,
                }],
            ),
        }
    }

    fn reconcile_existing(
        &mut self,
        def: &ModelDef,
        id: &SymbolicId,
        snapshot: ProvenanceSnapshot,
        declared: FieldValueMap,
    ) -> Result<(), SeedlingError> {
        if id.module == self.module {
            self.state.to_delete.remove(&id.local);
        }

        if self.state.flags.noupdate && self.module_state != ModuleState::ToInstall {
            self.report.suppressed += 1;
            return Ok(());
        }

        if snapshot.model != def.name {
            return Err(SeedlingError::ModelMismatch {
                id: id.to_string(),
                declared: def.name.clone(),
                tracked: snapshot.model,
            });
        }

        let old_values = snapshot.values.clone().unwrap_or_default();
        let materialized = self
            .resolver
            .get_materialized(&mut *self.store, &id.module, &def.name, snapshot.db_id)?
            .cloned();
        let record = match materialized {
            Some(record) => record,
            None => self.recreate(def, id, &snapshot, &declared)?,
        };

        let mut to_update = FieldValueMap::new();
        for (field, new) in &declared {
            let db = clean_value(def, field, &record)?;
            if &db == new {
                continue;
            }

            let expected = match old_values.get(field) {
                Some(value) => value.clone(),
                None => def.default_for(field)?,
            };
            let db = if def.field(field)?.kind == FieldKind::Reference {
                legacy_reference_sentinel(&expected, db)
            } else {
                db
            };

            if db != expected && (db.is_truthy() || expected.is_truthy()) {
                tracing::warn!(
                    "Field {} of {}@{} not updated (id: {}), because it has changed since the last update",
                    field,
                    record.id,
                    def.name,
                    id
                );
                self.report.preserved.push(PreservedField {
                    symbolic_id: id.to_string(),
                    model: def.name.clone(),
                    db_id: record.id,
                    field: field.clone(),
                });
                continue;
            }

            to_update.insert(field.clone(), new.clone());
        }

        if to_update.is_empty() {
            self.report.unchanged += 1;
        } else {
            self.report.updated += 1;
        }

        let pending = PendingWrite {
            local_id: id.local.clone(),
            record: record.id,
            row: snapshot.row,
            to_update,
            old_values,
        };
        if self.state.flags.grouped {
            self.state.buffer_write(&id.module, &def.name, pending);
        } else {
            self.write_records(&id.module, def, vec![pending])?;
        }

        if snapshot.fs_values.as_ref() != Some(&declared) {
            self.state.buffer_provenance(
                snapshot.row,
                ProvenanceUpdate {
                    fs_values: Some(declared.clone()),
                    ..ProvenanceUpdate::default()
                },
            );
            self.resolver.set(
                &mut *self.store,
                &id.module,
                &id.local,
                SnapshotUpdate {
                    fs_values: Some(declared),
                    ..SnapshotUpdate::default()
                },
            )?;
        }
        Ok(())
    }

    /// Create the record again when its provenance outlived it.
    fn recreate(
        &mut self,
        def: &ModelDef,
        id: &SymbolicId,
        snapshot: &ProvenanceSnapshot,
        declared: &FieldValueMap,
    ) -> Result<Record, SeedlingError> {
        let created = {
            let mut scope = scoped(
                &mut *self.store,
                ContextOverride::new()
                    .module(&id.module)
                    .language(DEFAULT_LANGUAGE),
            );
            scope.create(&def.name, vec![declared.clone()])?
        };
        let new_id = created.first().copied().ok_or_else(|| {
            SeedlingError::Store(format!("creating {} returned no record", def.name))
        })?;

        self.resolver
            .invalidate(&mut *self.store, &id.module, &def.name, Some(&[new_id]))?;
        self.store.write_provenance(&[(
            snapshot.row,
            ProvenanceUpdate {
                db_id: Some(new_id),
                ..ProvenanceUpdate::default()
            },
        )])?;
        self.resolver.set(
            &mut *self.store,
            &id.module,
            &id.local,
            SnapshotUpdate {
                db_id: Some(new_id),
                ..SnapshotUpdate::default()
            },
        )?;
        self.report.recreated += 1;
        tracing::info!("Re-created {} as {}@{}", id, new_id, def.name);

        self.resolver
            .get_materialized(&mut *self.store, &id.module, &def.name, new_id)?
            .cloned()
            .ok_or_else(|| {
                SeedlingError::Store(format!("record {},{} vanished after creation", def.name, new_id))
            })
    }

    /// Create records of one model in a single store call and track them.
    fn create_records(
        &mut self,
        def: &ModelDef,
        creations: Vec<PendingCreation>,
    ) -> Result<(), SeedlingError> {
        if creations.is_empty() {
            return Ok(());
        }

        let vlist = creations.iter().map(|c| c.values.clone()).collect();
        let ids = {
            let mut scope = scoped(
                &mut *self.store,
                ContextOverride::new()
                    .module(&self.module)
                    .language(DEFAULT_LANGUAGE),
            );
            scope.create(&def.name, vlist)?
        };
        if ids.len() != creations.len() {
            return Err(SeedlingError::Store(format!(
                "created {} records of {} instead of {}",
                ids.len(),
                def.name,
                creations.len()
            )));
        }
        self.resolver
            .invalidate(&mut *self.store, &self.module, &def.name, Some(&ids))?;

        let records = self.store.browse(&def.name, &ids)?;
        let mut rows = Vec::with_capacity(creations.len());
        for (creation, db_id) in creations.iter().zip(&ids) {
            let record = records.iter().find(|r| r.id == *db_id).ok_or_else(|| {
                SeedlingError::Store(format!("record {},{} vanished after creation", def.name, db_id))
            })?;
            let cleaned = clean_values(def, creation.values.keys(), record)?;
            rows.push(NewProvenance {
                module: self.module.clone(),
                local_id: creation.local_id.clone(),
                model: def.name.clone(),
                db_id: *db_id,
                values: Some(cleaned.clone()),
                fs_values: Some(cleaned),
                noupdate: self.state.flags.noupdate,
            });
        }

        let row_ids = self.store.create_provenance(rows.clone())?;
        for (row, row_id) in rows.into_iter().zip(row_ids) {
            self.resolver.set(
                &mut *self.store,
                &self.module,
                &row.local_id,
                SnapshotUpdate {
                    db_id: Some(row.db_id),
                    model: Some(row.model),
                    row: Some(row_id),
                    values: row.values,
                    fs_values: row.fs_values,
                },
            )?;
        }
        self.report.created += creations.len();
        Ok(())
    }

    /// Write pending updates of one `(module, model)` in a single store call,
    /// then fold the written values into the provenance baseline.
    fn write_records(
        &mut self,
        module: &str,
        def: &ModelDef,
        writes: Vec<PendingWrite>,
    ) -> Result<(), SeedlingError> {
        let writes: Vec<PendingWrite> = writes
            .into_iter()
            .filter(|w| !w.to_update.is_empty())
            .collect();
        if writes.is_empty() {
            return Ok(());
        }

        let actions: Vec<(Vec<DbId>, FieldValueMap)> = writes
            .iter()
            .map(|w| (vec![w.record], w.to_update.clone()))
            .collect();
        {
            let mut scope = scoped(
                &mut *self.store,
                ContextOverride::new()
                    .module(module)
                    .language(DEFAULT_LANGUAGE),
            );
            scope.write(&def.name, &actions)?;
        }
        let ids: Vec<DbId> = writes.iter().map(|w| w.record).collect();
        self.resolver
            .invalidate(&mut *self.store, module, &def.name, Some(&ids))?;

        for write in writes {
            let cached = self
                .resolver
                .get_materialized(&mut *self.store, module, &def.name, write.record)?
                .cloned();
            let record = match cached {
                Some(record) => record,
                None => self
                    .store
                    .browse(&def.name, &[write.record])?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        SeedlingError::Store(format!(
                            "record {},{} vanished after write",
                            def.name, write.record
                        ))
                    })?,
            };

            let mut merged = write.old_values.clone();
            merged.extend(clean_values(def, write.to_update.keys(), &record)?);
            if merged != write.old_values {
                self.state.buffer_provenance(
                    write.row,
                    ProvenanceUpdate {
                        values: Some(merged.clone()),
                        ..ProvenanceUpdate::default()
                    },
                );
                self.resolver.set(
                    &mut *self.store,
                    module,
                    &write.local_id,
                    SnapshotUpdate {
                        values: Some(merged),
                        ..SnapshotUpdate::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Issue every buffered creation, write and provenance update.
    pub fn flush(&mut self) -> Result<(), SeedlingError> {
        if !self.state.is_dirty() {
            return Ok(());
        }
        for (model, creations) in self.state.take_creations() {
            let def = self.store.registry().model(&model)?.clone();
            tracing::debug!("Creating {} grouped records of {}", creations.len(), model);
            self.create_records(&def, creations)?;
        }
        for ((module, model), writes) in self.state.take_writes() {
            let def = self.store.registry().model(&model)?.clone();
            tracing::debug!("Writing {} grouped records of {}", writes.len(), model);
            self.write_records(&module, &def, writes)?;
        }
        let updates = self.state.take_provenance_updates();
        if !updates.is_empty() {
            self.store.write_provenance(&updates)?;
        }
        Ok(())
    }

    /// End the parse phase: flush and hand back the report and the ids
    /// that were not re-declared.
    pub fn finish(mut self) -> Result<(LoadReport, BTreeSet<String>), SeedlingError> {
        self.flush()?;
        let to_delete = std::mem::take(&mut self.state.to_delete);
        Ok((self.report, to_delete))
    }
}

// =============================================================================
// VALUE CLEANING
// =============================================================================

/// The value of `field` as the store holds it, in the form documents declare.
pub fn clean_value(
    model: &ModelDef,
    field: &str,
    record: &Record,
) -> Result<FieldValue, SeedlingError> {
    match model.field(field)?.kind {
        FieldKind::One2Many | FieldKind::Many2Many => Err(SeedlingError::UnhandledFieldType {
            model: model.name.clone(),
            field: field.to_string(),
        }),
        FieldKind::Reference => Ok(normalize_reference(record.get(field))),
        _ => Ok(record.get(field)),
    }
}

fn clean_values<'f>(
    model: &ModelDef,
    fields: impl Iterator<Item = &'f String>,
    record: &Record,
) -> Result<FieldValueMap, SeedlingError> {
    fields
        .map(|field| Ok((field.clone(), clean_value(model, field, record)?)))
        .collect()
}

/// Bring a `model,id` reference to canonical form; `(5,)` or `[5]` ids
/// become `5`.
fn normalize_reference(value: FieldValue) -> FieldValue {
    let raw = match value {
        FieldValue::Reference(s) | FieldValue::Text(s) => s,
        FieldValue::None | FieldValue::Bool(false) => return FieldValue::None,
        other => return FieldValue::Reference(other.to_string()),
    };
    if raw.is_empty() {
        return FieldValue::None;
    }
    let Some((model, id)) = raw.split_once(',') else {
        return FieldValue::Reference(raw);
    };
    let id = match expression::evaluate(id.trim(), &mut EmptyEnvironment) {
        Ok(FieldValue::List(items)) => items
            .into_iter()
            .next()
            .map(|item| item.to_string())
            .unwrap_or_default(),
        Ok(value) => value.to_string(),
        Err(_) => id.to_string(),
    };
    FieldValue::Reference(format!("{},{}", model, id))
}

/// Compatibility shim for reference fields synced by older releases.
///
/// Those stored an unset reference as `model,0`. When the baseline is such a
/// sentinel and the live value is empty, the live value counts as matching
/// the baseline, so the field can be cleared or set on upgrade.
pub fn legacy_reference_sentinel(expected: &FieldValue, db: FieldValue) -> FieldValue {
    match expected.as_str() {
        Some(s) if s.ends_with(LEGACY_REFERENCE_SENTINEL_SUFFIX) && !db.is_truthy() => {
            expected.clone()
        }
        _ => db,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDef, Registry};
    use crate::store::MemoryStore;

    fn registry() -> Registry {
        Registry::from_models([ModelDef::new("res.partner")
            .with_field("name", FieldDef::new(FieldKind::Char))
            .with_field(
                "lang",
                FieldDef::new(FieldKind::Char).default_value(FieldValue::text("en")),
            )
            .with_field("link", FieldDef::new(FieldKind::Reference))
            .with_field("tags", FieldDef::new(FieldKind::Many2Many).relation("res.partner"))])
    }

    fn values(pairs: &[(&str, FieldValue)]) -> FieldValueMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn load(store: &mut MemoryStore, state: ModuleState, decls: &[(&str, FieldValueMap)]) -> LoadReport {
        let mut reconciler = Reconciler::new(store, "base", state).expect("reconciler");
        for (id, vals) in decls {
            reconciler
                .import_record("res.partner", vals.clone(), id)
                .expect("import");
        }
        let (report, _) = reconciler.finish().expect("finish");
        report
    }

    #[test]
    fn creates_then_skips_unchanged() {
        let mut store = MemoryStore::new(registry());
        let decl = [("p1", values(&[("name", FieldValue::text("Ann"))]))];

        let first = load(&mut store, ModuleState::ToInstall, &decl);
        assert_eq!(first.created, 1);

        store.reset_stats();
        let second = load(&mut store, ModuleState::ToUpgrade, &decl);
        assert_eq!(second.unchanged, 1);
        assert_eq!(store.stats().mutating_calls(), 0);
    }

    #[test]
    fn preserves_user_edits() {
        let mut store = MemoryStore::new(registry());
        load(
            &mut store,
            ModuleState::ToInstall,
            &[("p1", values(&[("name", FieldValue::text("Ann"))]))],
        );
        store
            .write(
                "res.partner",
                &[(vec![DbId(1)], values(&[("name", FieldValue::text("Anna"))]))],
            )
            .expect("user edit");

        let report = load(
            &mut store,
            ModuleState::ToUpgrade,
            &[("p1", values(&[("name", FieldValue::text("Annie"))]))],
        );

        assert_eq!(report.preserved.len(), 1);
        assert_eq!(report.preserved[0].field, "name");
        let record = store.browse("res.partner", &[DbId(1)]).expect("browse");
        assert_eq!(record[0].get("name"), FieldValue::text("Anna"));
    }

    #[test]
    fn first_sync_compares_against_default() {
        let mut store = MemoryStore::new(registry());
        load(
            &mut store,
            ModuleState::ToInstall,
            &[("p1", values(&[("name", FieldValue::text("Ann"))]))],
        );

        // `lang` was never synced and still holds its default: it updates.
        let report = load(
            &mut store,
            ModuleState::ToUpgrade,
            &[(
                "p1",
                values(&[("name", FieldValue::text("Ann")), ("lang", FieldValue::text("fr"))]),
            )],
        );
        assert_eq!(report.updated, 1);
        let record = store.browse("res.partner", &[DbId(1)]).expect("browse");
        assert_eq!(record[0].get("lang"), FieldValue::text("fr"));
    }

    #[test]
    fn multi_valued_fields_are_rejected() {
        let mut store = MemoryStore::new(registry());
        let mut reconciler =
            Reconciler::new(&mut store, "base", ModuleState::ToInstall).expect("reconciler");
        let result = reconciler.import_record(
            "res.partner",
            values(&[("tags", FieldValue::List(Vec::new()))]),
            "p1",
        );
        assert!(matches!(
            result,
            Err(SeedlingError::UnhandledFieldType { .. })
        ));
    }

    #[test]
    fn unknown_cross_module_id_fails() {
        let mut store = MemoryStore::new(registry());
        let mut reconciler =
            Reconciler::new(&mut store, "base", ModuleState::ToInstall).expect("reconciler");
        let result = reconciler.import_record("res.partner", FieldValueMap::new(), "other.p1");
        assert!(matches!(
            result,
            Err(SeedlingError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn reference_normalization() {
        assert_eq!(
            normalize_reference(FieldValue::Reference("action.window,(5,)".to_string())),
            FieldValue::Reference("action.window,5".to_string())
        );
        assert_eq!(
            normalize_reference(FieldValue::Reference("action.window,7".to_string())),
            FieldValue::Reference("action.window,7".to_string())
        );
        assert_eq!(
            normalize_reference(FieldValue::text("")),
            FieldValue::None
        );
    }

    #[test]
    fn legacy_sentinel_matches_empty_live_value() {
        let expected = FieldValue::Reference("res.partner,0".to_string());
        assert_eq!(
            legacy_reference_sentinel(&expected, FieldValue::None),
            expected
        );
        let live = FieldValue::Reference("res.partner,3".to_string());
        assert_eq!(legacy_reference_sentinel(&expected, live.clone()), live);
        assert_eq!(
            legacy_reference_sentinel(&FieldValue::None, FieldValue::None),
            FieldValue::None
        );
    }
}
