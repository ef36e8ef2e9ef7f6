//! # redb-backed Object Store
//!
//! A disk-backed object store using the redb embedded database.
//!
//! The working state lives in a `MemoryStore`; `commit` writes the
//! difference against the last committed snapshot in a single redb write
//! transaction, so every commit is ACID and a crash never leaves half a
//! load on disk. `rollback` discards the working state.
//!
//! Every stored value carries the persistence header (`formats` module).

use crate::formats::{decode, encode};
use crate::registry::Registry;
use crate::store::{
    Context, Domain, MemoryStore, ObjectStore, SearchOrder, StoreState, StoreStats,
};
use crate::{
    DbId, FieldValueMap, NewProvenance, ProvenanceRecord, ProvenanceRowId, ProvenanceUpdate,
    Record, SeedlingError,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::Path;

/// Table for records: (model, id) -> serialized field values
const RECORDS: TableDefinition<(&str, i64), &[u8]> = TableDefinition::new("records");

/// Table for provenance: row id -> serialized provenance row
const PROVENANCE: TableDefinition<u64, &[u8]> = TableDefinition::new("provenance");

/// Table for id sequences: model -> last issued id
const SEQUENCES: TableDefinition<&str, i64> = TableDefinition::new("sequences");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

/// Table for installed modules: name -> install marker
const MODULES: TableDefinition<&str, u64> = TableDefinition::new("modules");

const LAST_ROW_KEY: &str = "last_provenance_row";

fn io_error(e: impl Display) -> SeedlingError {
    SeedlingError::IoError(e.to_string())
}

/// A disk-backed object store using redb.
pub struct RedbStore {
    /// The redb database handle.
    db: Database,
    /// Working state and committed snapshot.
    inner: MemoryStore,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("models", &self.inner.registry().len())
            .field("provenance_rows", &self.inner.state().provenance.len())
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store database at the given path.
    pub fn open(path: impl AsRef<Path>, registry: Registry) -> Result<Self, SeedlingError> {
        let db = Database::create(path.as_ref()).map_err(io_error)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(io_error)?;
            let _ = write_txn.open_table(RECORDS).map_err(io_error)?;
            let _ = write_txn.open_table(PROVENANCE).map_err(io_error)?;
            let _ = write_txn.open_table(SEQUENCES).map_err(io_error)?;
            let _ = write_txn.open_table(METADATA).map_err(io_error)?;
            let _ = write_txn.open_table(MODULES).map_err(io_error)?;
            write_txn.commit().map_err(io_error)?;
        }

        let state = Self::load_state(&db)?;
        Ok(Self {
            db,
            inner: MemoryStore::from_state(registry, state),
        })
    }

    fn load_state(db: &Database) -> Result<StoreState, SeedlingError> {
        let read_txn = db.begin_read().map_err(io_error)?;
        let mut state = StoreState::default();

        let records = read_txn.open_table(RECORDS).map_err(io_error)?;
        for entry in records.iter().map_err(io_error)? {
            let (key, value) = entry.map_err(io_error)?;
            let (model, id) = key.value();
            let values: FieldValueMap = decode(value.value())?;
            state
                .tables
                .entry(model.to_string())
                .or_default()
                .insert(DbId(id), values);
        }

        let provenance = read_txn.open_table(PROVENANCE).map_err(io_error)?;
        for entry in provenance.iter().map_err(io_error)? {
            let (key, value) = entry.map_err(io_error)?;
            let row: ProvenanceRecord = decode(value.value())?;
            state.provenance.insert(ProvenanceRowId(key.value()), row);
        }

        let sequences = read_txn.open_table(SEQUENCES).map_err(io_error)?;
        for entry in sequences.iter().map_err(io_error)? {
            let (key, value) = entry.map_err(io_error)?;
            state.sequences.insert(key.value().to_string(), value.value());
        }

        let metadata = read_txn.open_table(METADATA).map_err(io_error)?;
        state.last_row = metadata
            .get(LAST_ROW_KEY)
            .map_err(io_error)?
            .map(|v| v.value())
            .unwrap_or(0);

        let modules = read_txn.open_table(MODULES).map_err(io_error)?;
        for entry in modules.iter().map_err(io_error)? {
            let (key, _) = entry.map_err(io_error)?;
            state.installed.insert(key.value().to_string());
        }

        Ok(state)
    }

    /// Write the working state's changes since the last commit.
    fn persist(&self) -> Result<(), SeedlingError> {
        let state = self.inner.state();
        let committed = self.inner.committed();
        if state == committed {
            return Ok(());
        }

        let write_txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut records = write_txn.open_table(RECORDS).map_err(io_error)?;
            for (model, table) in &committed.tables {
                for id in table.keys() {
                    let kept = state
                        .tables
                        .get(model)
                        .is_some_and(|t| t.contains_key(id));
                    if !kept {
                        records.remove((model.as_str(), id.0)).map_err(io_error)?;
                    }
                }
            }
            for (model, table) in &state.tables {
                for (id, values) in table {
                    let previous = committed.tables.get(model).and_then(|t| t.get(id));
                    if previous != Some(values) {
                        let bytes = encode(values)?;
                        records
                            .insert((model.as_str(), id.0), bytes.as_slice())
                            .map_err(io_error)?;
                    }
                }
            }

            let mut provenance = write_txn.open_table(PROVENANCE).map_err(io_error)?;
            for row in committed.provenance.keys() {
                if !state.provenance.contains_key(row) {
                    provenance.remove(row.0).map_err(io_error)?;
                }
            }
            for (row, record) in &state.provenance {
                if committed.provenance.get(row) != Some(record) {
                    let bytes = encode(record)?;
                    provenance
                        .insert(row.0, bytes.as_slice())
                        .map_err(io_error)?;
                }
            }

            let mut sequences = write_txn.open_table(SEQUENCES).map_err(io_error)?;
            for (model, last) in &state.sequences {
                if committed.sequences.get(model) != Some(last) {
                    sequences.insert(model.as_str(), *last).map_err(io_error)?;
                }
            }

            let mut metadata = write_txn.open_table(METADATA).map_err(io_error)?;
            metadata
                .insert(LAST_ROW_KEY, state.last_row)
                .map_err(io_error)?;

            let mut modules = write_txn.open_table(MODULES).map_err(io_error)?;
            for module in committed.installed.difference(&state.installed) {
                modules.remove(module.as_str()).map_err(io_error)?;
            }
            for module in state.installed.difference(&committed.installed) {
                modules.insert(module.as_str(), 1u64).map_err(io_error)?;
            }
        }
        write_txn.commit().map_err(io_error)?;
        Ok(())
    }

    /// Call counters of the working store.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    /// Reset the call counters.
    pub fn reset_stats(&self) {
        self.inner.reset_stats();
    }

    /// Number of records stored for `model`.
    #[must_use]
    pub fn record_count(&self, model: &str) -> usize {
        self.inner.record_count(model)
    }
}

impl ObjectStore for RedbStore {
    fn registry(&self) -> &Registry {
        self.inner.registry()
    }

    fn context(&self) -> &Context {
        self.inner.context()
    }

    fn set_context(&mut self, context: Context) -> Context {
        self.inner.set_context(context)
    }

    fn search(
        &self,
        model: &str,
        domain: &Domain,
        order: SearchOrder,
    ) -> Result<Vec<DbId>, SeedlingError> {
        self.inner.search(model, domain, order)
    }

    fn browse(&self, model: &str, ids: &[DbId]) -> Result<Vec<Record>, SeedlingError> {
        self.inner.browse(model, ids)
    }

    fn create(
        &mut self,
        model: &str,
        values: Vec<FieldValueMap>,
    ) -> Result<Vec<DbId>, SeedlingError> {
        self.inner.create(model, values)
    }

    fn write(
        &mut self,
        model: &str,
        actions: &[(Vec<DbId>, FieldValueMap)],
    ) -> Result<(), SeedlingError> {
        self.inner.write(model, actions)
    }

    fn delete(&mut self, model: &str, ids: &[DbId]) -> Result<(), SeedlingError> {
        self.inner.delete(model, ids)
    }

    fn provenance(&self, module: &str) -> Result<Vec<ProvenanceRecord>, SeedlingError> {
        self.inner.provenance(module)
    }

    fn create_provenance(
        &mut self,
        rows: Vec<NewProvenance>,
    ) -> Result<Vec<ProvenanceRowId>, SeedlingError> {
        self.inner.create_provenance(rows)
    }

    fn write_provenance(
        &mut self,
        updates: &[(ProvenanceRowId, ProvenanceUpdate)],
    ) -> Result<(), SeedlingError> {
        self.inner.write_provenance(updates)
    }

    fn delete_provenance(&mut self, rows: &[ProvenanceRowId]) -> Result<(), SeedlingError> {
        self.inner.delete_provenance(rows)
    }

    fn installed_modules(&self) -> Result<BTreeSet<String>, SeedlingError> {
        self.inner.installed_modules()
    }

    fn mark_installed(&mut self, module: &str) -> Result<(), SeedlingError> {
        self.inner.mark_installed(module)
    }

    fn commit(&mut self) -> Result<(), SeedlingError> {
        self.persist()?;
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), SeedlingError> {
        self.inner.rollback()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldValue;
    use crate::registry::{FieldDef, FieldKind, ModelDef};
    use tempfile::tempdir;

    fn registry() -> Registry {
        Registry::from_models([ModelDef::new("res.country")
            .with_field("name", FieldDef::new(FieldKind::Char))
            .with_field("code", FieldDef::new(FieldKind::Char))])
    }

    fn country(code: &str) -> FieldValueMap {
        let mut values = FieldValueMap::new();
        values.insert("code".to_string(), FieldValue::text(code));
        values
    }

    #[test]
    fn recovery_persistence_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");

        {
            let mut store = RedbStore::open(&db_path, registry()).expect("open db");
            store
                .create("res.country", vec![country("BE"), country("FR")])
                .expect("create");
            store
                .create_provenance(vec![NewProvenance {
                    module: "base".to_string(),
                    local_id: "be".to_string(),
                    model: "res.country".to_string(),
                    db_id: DbId(1),
                    values: Some(country("BE")),
                    fs_values: Some(country("BE")),
                    noupdate: false,
                }])
                .expect("provenance");
            store.mark_installed("base").expect("install");
            store.commit().expect("commit");
        }

        {
            let mut store = RedbStore::open(&db_path, registry()).expect("open db");
            assert_eq!(store.record_count("res.country"), 2);
            let rows = store.provenance("base").expect("provenance");
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].fs_values, Some(country("BE")));
            assert!(store.installed_modules().expect("modules").contains("base"));

            // Sequences survive: the next id continues after the last one.
            let ids = store
                .create("res.country", vec![country("DE")])
                .expect("create");
            assert_eq!(ids, vec![DbId(3)]);
        }
    }

    #[test]
    fn uncommitted_changes_are_not_persisted() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");

        {
            let mut store = RedbStore::open(&db_path, registry()).expect("open db");
            store
                .create("res.country", vec![country("BE")])
                .expect("create");
        }

        let store = RedbStore::open(&db_path, registry()).expect("open db");
        assert_eq!(store.record_count("res.country"), 0);
    }

    #[test]
    fn deletions_are_persisted() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");

        {
            let mut store = RedbStore::open(&db_path, registry()).expect("open db");
            let ids = store
                .create("res.country", vec![country("BE"), country("FR")])
                .expect("create");
            store.commit().expect("commit");
            store.delete("res.country", &ids[..1]).expect("delete");
            store.commit().expect("commit");
        }

        let store = RedbStore::open(&db_path, registry()).expect("open db");
        let records = store
            .browse("res.country", &[DbId(1), DbId(2)])
            .expect("browse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, DbId(2));
    }

    #[test]
    fn rollback_discards_working_state() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        let mut store = RedbStore::open(&db_path, registry()).expect("open db");

        store
            .create("res.country", vec![country("BE")])
            .expect("create");
        store.rollback().expect("rollback");
        store.commit().expect("commit");

        assert_eq!(store.record_count("res.country"), 0);
    }
}
