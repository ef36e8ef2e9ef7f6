//! # Identity Resolver
//!
//! Per-load cache from symbolic ids to backing records.
//!
//! For every module touched during a load the resolver keeps:
//! - a provenance snapshot per symbolic id (`get` / `set`)
//! - the materialized records those snapshots point at (`get_materialized`)
//!
//! A module is fetched in full on first access. Materialized records are
//! browsed in slices of `BROWSE_SLICE_SIZE` with the active filter off, so
//! deactivated records still resolve. After every create or write the
//! reconciler calls `invalidate`, which re-reads the affected records so
//! later reads within the same load observe the written state.
//!
//! The resolver is owned by one load and dropped with it.

use crate::primitives::{BROWSE_SLICE_SIZE, DEFAULT_LANGUAGE};
use crate::store::{ContextOverride, Domain, ObjectStore, Operator, SearchOrder, scoped};
use crate::{DbId, FieldValue, FieldValueMap, ProvenanceRowId, Record, SeedlingError, SymbolicId};
use std::collections::BTreeMap;

/// Cached view of one provenance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceSnapshot {
    pub db_id: DbId,
    pub model: String,
    pub row: ProvenanceRowId,
    /// Last-synced values.
    pub values: Option<FieldValueMap>,
    /// Values as last declared.
    pub fs_values: Option<FieldValueMap>,
}

/// Partial snapshot update; `None` keeps the cached value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub db_id: Option<DbId>,
    pub model: Option<String>,
    pub row: Option<ProvenanceRowId>,
    pub values: Option<FieldValueMap>,
    pub fs_values: Option<FieldValueMap>,
}

type MaterializedCache = BTreeMap<String, BTreeMap<DbId, Record>>;

/// Symbolic id cache scoped to one load.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    snapshots: BTreeMap<String, BTreeMap<String, ProvenanceSnapshot>>,
    materialized: BTreeMap<String, MaterializedCache>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `module` has been fetched.
    #[must_use]
    pub fn is_loaded(&self, module: &str) -> bool {
        self.snapshots.contains_key(module)
    }

    fn ensure_loaded<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
        module: &str,
    ) -> Result<(), SeedlingError> {
        if !self.is_loaded(module) {
            self.fetch_module(store, module)?;
        }
        Ok(())
    }

    fn fetch_module<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
        module: &str,
    ) -> Result<(), SeedlingError> {
        let mut snapshots = BTreeMap::new();
        let mut ids_by_model: BTreeMap<String, Vec<DbId>> = BTreeMap::new();
        for row in store.provenance(module)? {
            ids_by_model
                .entry(row.model.clone())
                .or_default()
                .push(row.db_id);
            snapshots.insert(
                row.local_id,
                ProvenanceSnapshot {
                    db_id: row.db_id,
                    model: row.model,
                    row: row.row,
                    values: row.values,
                    fs_values: row.fs_values,
                },
            );
        }

        let mut materialized = MaterializedCache::new();
        for (model, mut ids) in ids_by_model {
            if !store.registry().contains(&model) {
                continue;
            }
            ids.sort();
            let cache = materialized.entry(model.clone()).or_default();
            for slice in ids.chunks(BROWSE_SLICE_SIZE) {
                let domain = Domain::new().with(
                    "id",
                    Operator::In,
                    FieldValue::List(slice.iter().map(|id| FieldValue::Int(id.0)).collect()),
                );
                let found = {
                    let scope = scoped(&mut *store, ContextOverride::new().active_test(false));
                    scope.search(&model, &domain, SearchOrder::IdAsc)?
                };
                let records = {
                    let scope = scoped(&mut *store, ContextOverride::new().language(DEFAULT_LANGUAGE));
                    scope.browse(&model, &found)?
                };
                for record in records {
                    cache.insert(record.id, record);
                }
            }
        }

        self.snapshots.insert(module.to_string(), snapshots);
        self.materialized.insert(module.to_string(), materialized);
        Ok(())
    }

    /// Provenance snapshot of `module.local`, fetching the module if needed.
    pub fn get<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
        module: &str,
        local: &str,
    ) -> Result<Option<&ProvenanceSnapshot>, SeedlingError> {
        self.ensure_loaded(store, module)?;
        Ok(self.snapshots.get(module).and_then(|ids| ids.get(local)))
    }

    /// Merge `update` into the snapshot of `module.local`.
    ///
    /// Creating a snapshot requires `db_id`, `model` and `row`.
    pub fn set<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
        module: &str,
        local: &str,
        update: SnapshotUpdate,
    ) -> Result<(), SeedlingError> {
        self.ensure_loaded(store, module)?;
        let ids = self.snapshots.entry(module.to_string()).or_default();

        if let Some(snapshot) = ids.get_mut(local) {
            if let Some(db_id) = update.db_id {
                snapshot.db_id = db_id;
            }
            if let Some(model) = update.model {
                snapshot.model = model;
            }
            if let Some(row) = update.row {
                snapshot.row = row;
            }
            if let Some(values) = update.values {
                snapshot.values = Some(values);
            }
            if let Some(fs_values) = update.fs_values {
                snapshot.fs_values = Some(fs_values);
            }
            return Ok(());
        }

        match (update.db_id, update.model, update.row) {
            (Some(db_id), Some(model), Some(row)) => {
                ids.insert(
                    local.to_string(),
                    ProvenanceSnapshot {
                        db_id,
                        model,
                        row,
                        values: update.values,
                        fs_values: update.fs_values,
                    },
                );
                Ok(())
            }
            _ => Err(SeedlingError::Store(format!(
                "incomplete identity for {}.{}",
                module, local
            ))),
        }
    }

    /// Cached record `model,db_id` materialized on behalf of `module`.
    pub fn get_materialized<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
        module: &str,
        model: &str,
        db_id: DbId,
    ) -> Result<Option<&Record>, SeedlingError> {
        self.ensure_loaded(store, module)?;
        Ok(self
            .materialized
            .get(module)
            .and_then(|models| models.get(model))
            .and_then(|records| records.get(&db_id)))
    }

    /// Re-read records after a create or write.
    ///
    /// With `ids = None`, every cached record of `model` is refreshed.
    /// Records that no longer exist are dropped from the cache.
    pub fn invalidate<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
        module: &str,
        model: &str,
        ids: Option<&[DbId]>,
    ) -> Result<(), SeedlingError> {
        let Some(models) = self.materialized.get_mut(module) else {
            return Ok(());
        };
        let cache = models.entry(model.to_string()).or_default();
        let ids: Vec<DbId> = match ids {
            Some(ids) => ids.to_vec(),
            None => cache.keys().copied().collect(),
        };
        if ids.is_empty() {
            return Ok(());
        }

        store.purge_cached(model, &ids);
        let records = {
            let scope = scoped(&mut *store, ContextOverride::new().language(DEFAULT_LANGUAGE));
            scope.browse(model, &ids)?
        };
        for id in &ids {
            cache.remove(id);
        }
        for record in records {
            cache.insert(record.id, record);
        }
        Ok(())
    }

    /// Resolve a possibly dotted symbolic id to its database identity.
    pub fn resolve<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
        raw: &str,
        default_module: &str,
    ) -> Result<DbId, SeedlingError> {
        let id = SymbolicId::parse(raw, default_module)?;
        self.get(store, &id.module, &id.local)?
            .map(|snapshot| snapshot.db_id)
            .ok_or_else(|| SeedlingError::UnresolvedReference(format!("Reference to {} not found", id)))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDef, FieldKind, ModelDef, Registry};
    use crate::store::MemoryStore;
    use crate::NewProvenance;

    fn store_with_country() -> (MemoryStore, DbId) {
        let registry = Registry::from_models([ModelDef::new("res.country")
            .with_field("code", FieldDef::new(FieldKind::Char))
            .with_field(
                "active",
                FieldDef::new(FieldKind::Boolean).default_value(FieldValue::Bool(true)),
            )]);
        let mut store = MemoryStore::new(registry);
        let mut values = FieldValueMap::new();
        values.insert("code".to_string(), FieldValue::text("BE"));
        values.insert("active".to_string(), FieldValue::Bool(false));
        let ids = store.create("res.country", vec![values]).expect("create");
        store
            .create_provenance(vec![NewProvenance {
                module: "geo".to_string(),
                local_id: "be".to_string(),
                model: "res.country".to_string(),
                db_id: ids[0],
                values: None,
                fs_values: None,
                noupdate: false,
            }])
            .expect("provenance");
        (store, ids[0])
    }

    #[test]
    fn resolves_local_and_dotted_ids() {
        let (mut store, id) = store_with_country();
        let mut resolver = IdentityResolver::new();

        assert_eq!(resolver.resolve(&mut store, "be", "geo").expect("resolve"), id);
        assert_eq!(
            resolver.resolve(&mut store, "geo.be", "sale").expect("resolve"),
            id
        );
    }

    #[test]
    fn unknown_reference_fails() {
        let (mut store, _) = store_with_country();
        let mut resolver = IdentityResolver::new();

        let err = resolver
            .resolve(&mut store, "geo.fr", "geo")
            .expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "Unresolved reference: Reference to geo.fr not found"
        );
    }

    #[test]
    fn materializes_inactive_records() {
        let (mut store, id) = store_with_country();
        let mut resolver = IdentityResolver::new();

        let record = resolver
            .get_materialized(&mut store, "geo", "res.country", id)
            .expect("materialize")
            .expect("record cached");
        assert_eq!(record.get("code"), FieldValue::text("BE"));
        assert!(store.context().active_test);
    }

    #[test]
    fn set_merges_without_clobbering() {
        let (mut store, id) = store_with_country();
        let mut resolver = IdentityResolver::new();
        let mut values = FieldValueMap::new();
        values.insert("code".to_string(), FieldValue::text("BE"));

        resolver
            .set(
                &mut store,
                "geo",
                "be",
                SnapshotUpdate {
                    values: Some(values.clone()),
                    ..SnapshotUpdate::default()
                },
            )
            .expect("set");

        let snapshot = resolver
            .get(&mut store, "geo", "be")
            .expect("get")
            .expect("snapshot");
        assert_eq!(snapshot.db_id, id);
        assert_eq!(snapshot.values, Some(values));
    }

    #[test]
    fn set_requires_complete_identity_for_new_ids() {
        let (mut store, _) = store_with_country();
        let mut resolver = IdentityResolver::new();
        let result = resolver.set(&mut store, "geo", "nl", SnapshotUpdate::default());
        assert!(result.is_err());
    }

    #[test]
    fn invalidate_observes_writes_and_deletes() {
        let (mut store, id) = store_with_country();
        let mut resolver = IdentityResolver::new();
        resolver.get(&mut store, "geo", "be").expect("load");

        let mut values = FieldValueMap::new();
        values.insert("code".to_string(), FieldValue::text("BEL"));
        store
            .write("res.country", &[(vec![id], values)])
            .expect("write");
        resolver
            .invalidate(&mut store, "geo", "res.country", Some(&[id]))
            .expect("invalidate");
        let record = resolver
            .get_materialized(&mut store, "geo", "res.country", id)
            .expect("materialize")
            .expect("record cached");
        assert_eq!(record.get("code"), FieldValue::text("BEL"));

        store.delete("res.country", &[id]).expect("delete");
        resolver
            .invalidate(&mut store, "geo", "res.country", None)
            .expect("invalidate");
        assert!(
            resolver
                .get_materialized(&mut store, "geo", "res.country", id)
                .expect("materialize")
                .is_none()
        );
    }
}
