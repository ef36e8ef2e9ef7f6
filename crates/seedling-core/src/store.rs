//! # Object Store
//!
//! The collaborator the engine reconciles against.
//!
//! `ObjectStore` is the only seam between the loader and persistent
//! records. Two backends implement it:
//! - `MemoryStore` (this module): BTreeMap-based, deterministic ids
//! - `RedbStore` (`storage` module): the same working state, persisted on commit
//!
//! ## Context
//!
//! Every store call runs under a `Context` (`module`, `language`,
//! `active_test`). Overrides are applied with `scoped`, which returns a
//! guard restoring the previous context when dropped. Nothing leaves the
//! context mutated after a call.

use crate::primitives::{ACTIVE_FIELD, DEFAULT_LANGUAGE};
use crate::registry::{FieldKind, ModelDef, OnDelete, Registry};
use crate::{
    DbId, FieldValue, FieldValueMap, NewProvenance, ProvenanceRecord, ProvenanceRowId,
    ProvenanceUpdate, Record, SeedlingError,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};

// =============================================================================
// CONTEXT
// =============================================================================

/// Ambient parameters of store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /// Module on whose behalf records are written.
    pub module: Option<String>,
    /// Language of translatable values.
    pub language: String,
    /// When true, searches skip records whose `active` flag is false.
    pub active_test: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            module: None,
            language: DEFAULT_LANGUAGE.to_string(),
            active_test: true,
        }
    }
}

/// A set of context values to apply for the duration of a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextOverride {
    module: Option<String>,
    language: Option<String>,
    active_test: Option<bool>,
}

impl ContextOverride {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }

    #[must_use]
    pub fn language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    #[must_use]
    pub fn active_test(mut self, active_test: bool) -> Self {
        self.active_test = Some(active_test);
        self
    }

    fn apply(&self, base: &Context) -> Context {
        Context {
            module: self.module.clone().or_else(|| base.module.clone()),
            language: self
                .language
                .clone()
                .unwrap_or_else(|| base.language.clone()),
            active_test: self.active_test.unwrap_or(base.active_test),
        }
    }
}

/// Guard holding a store under an overridden context.
///
/// Derefs to the store; the previous context is restored on drop.
pub struct Scoped<'a, S: ObjectStore + ?Sized> {
    store: &'a mut S,
    previous: Option<Context>,
}

/// Apply `overrides` to `store` until the returned guard is dropped.
pub fn scoped<S: ObjectStore + ?Sized>(store: &mut S, overrides: ContextOverride) -> Scoped<'_, S> {
    let next = overrides.apply(store.context());
    let previous = store.set_context(next);
    Scoped {
        store,
        previous: Some(previous),
    }
}

impl<S: ObjectStore + ?Sized> Deref for Scoped<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: ObjectStore + ?Sized> DerefMut for Scoped<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

impl<S: ObjectStore + ?Sized> Drop for Scoped<'_, S> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.store.set_context(previous);
        }
    }
}

// =============================================================================
// SEARCH DOMAINS
// =============================================================================

/// Comparison operator of a search criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Like,
    ILike,
}

impl Operator {
    /// Parse an operator as written in a domain.
    pub fn parse(raw: &str) -> Result<Self, SeedlingError> {
        Ok(match raw {
            "=" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "in" => Self::In,
            "not in" => Self::NotIn,
            "like" => Self::Like,
            "ilike" => Self::ILike,
            other => {
                return Err(SeedlingError::InvalidExpression(format!(
                    "unknown domain operator \"{}\"",
                    other
                )));
            }
        })
    }
}

/// One `(field, operator, value)` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub field: String,
    pub operator: Operator,
    pub value: FieldValue,
}

/// A conjunction of criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Domain {
    criteria: Vec<Criterion>,
}

impl Domain {
    /// The empty domain matches every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a criterion (builder style).
    #[must_use]
    pub fn with(mut self, field: &str, operator: Operator, value: FieldValue) -> Self {
        self.criteria.push(Criterion {
            field: field.to_string(),
            operator,
            value,
        });
        self
    }

    /// Build a domain from an evaluated expression: a list of
    /// `(field, operator, value)` triples.
    pub fn from_value(value: &FieldValue) -> Result<Self, SeedlingError> {
        let invalid = || SeedlingError::InvalidExpression(format!("invalid domain: {}", value));
        let FieldValue::List(items) = value else {
            return Err(invalid());
        };
        let mut domain = Self::new();
        for item in items {
            match item {
                FieldValue::List(triple) => match triple.as_slice() {
                    [FieldValue::Text(field), FieldValue::Text(op), operand] => {
                        domain = domain.with(field, Operator::parse(op)?, operand.clone());
                    }
                    _ => return Err(invalid()),
                },
                _ => return Err(invalid()),
            }
        }
        Ok(domain)
    }

    /// Whether any criterion constrains `field`.
    #[must_use]
    pub fn mentions(&self, field: &str) -> bool {
        self.criteria.iter().any(|c| c.field == field)
    }

    /// Evaluate the domain against a record.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.criteria.iter().all(|criterion| {
            let stored = if criterion.field == "id" {
                FieldValue::Int(record.id.0)
            } else {
                record.get(&criterion.field)
            };
            criterion_matches(criterion.operator, &stored, &criterion.value)
        })
    }
}

/// Identities and references compare as their plain counterparts.
fn normalize(value: &FieldValue) -> FieldValue {
    match value {
        FieldValue::Id(id) => FieldValue::Int(id.0),
        FieldValue::Reference(s) => FieldValue::Text(s.clone()),
        FieldValue::List(items) => FieldValue::List(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

fn compare(left: &FieldValue, right: &FieldValue) -> Option<Ordering> {
    match (left, right) {
        (FieldValue::Int(a), FieldValue::Int(b)) => Some(a.cmp(b)),
        (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
        (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn criterion_matches(operator: Operator, stored: &FieldValue, operand: &FieldValue) -> bool {
    let stored = normalize(stored);
    let operand = normalize(operand);
    match operator {
        Operator::Eq => stored == operand,
        Operator::Ne => stored != operand,
        Operator::Lt => compare(&stored, &operand) == Some(Ordering::Less),
        Operator::Le => matches!(
            compare(&stored, &operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Gt => compare(&stored, &operand) == Some(Ordering::Greater),
        Operator::Ge => matches!(
            compare(&stored, &operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::In | Operator::NotIn => {
            let found = match &operand {
                FieldValue::List(items) => items.contains(&stored),
                _ => false,
            };
            found == (operator == Operator::In)
        }
        Operator::Like | Operator::ILike => match (&stored, &operand) {
            (FieldValue::Text(text), FieldValue::Text(pattern)) => {
                if operator == Operator::ILike {
                    like(&pattern.to_lowercase(), &text.to_lowercase())
                } else {
                    like(pattern, text)
                }
            }
            _ => false,
        },
    }
}

/// SQL-style pattern match: `%` matches any run, `_` any single character.
fn like(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

/// Result ordering of `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchOrder {
    #[default]
    IdAsc,
    IdDesc,
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Storage-agnostic interface for record and provenance persistence.
///
/// All ids returned by `search` and `create` are in a deterministic order.
pub trait ObjectStore {
    /// Model metadata of this store.
    fn registry(&self) -> &Registry;

    /// The current context.
    fn context(&self) -> &Context;

    /// Replace the context, returning the previous one.
    fn set_context(&mut self, context: Context) -> Context;

    /// Ids of records of `model` matching `domain`.
    ///
    /// Inactive records are skipped when the context's `active_test` is set,
    /// the model has an `active` flag, and the domain does not mention it.
    fn search(
        &self,
        model: &str,
        domain: &Domain,
        order: SearchOrder,
    ) -> Result<Vec<DbId>, SeedlingError>;

    /// Materialize records. Ids that do not exist are absent from the result.
    fn browse(&self, model: &str, ids: &[DbId]) -> Result<Vec<Record>, SeedlingError>;

    /// Create records in one call, returning their ids in input order.
    fn create(
        &mut self,
        model: &str,
        values: Vec<FieldValueMap>,
    ) -> Result<Vec<DbId>, SeedlingError>;

    /// Apply several `(ids, values)` write actions in one call.
    fn write(
        &mut self,
        model: &str,
        actions: &[(Vec<DbId>, FieldValueMap)],
    ) -> Result<(), SeedlingError>;

    /// Delete records, applying every referencing field's deletion policy.
    fn delete(&mut self, model: &str, ids: &[DbId]) -> Result<(), SeedlingError>;

    /// Drop any cached reads of the given records.
    fn purge_cached(&mut self, _model: &str, _ids: &[DbId]) {}

    /// Provenance rows of `module`, ascending by row.
    fn provenance(&self, module: &str) -> Result<Vec<ProvenanceRecord>, SeedlingError>;

    /// Create provenance rows, returning their row ids in input order.
    fn create_provenance(
        &mut self,
        rows: Vec<NewProvenance>,
    ) -> Result<Vec<ProvenanceRowId>, SeedlingError>;

    /// Apply provenance updates in one call.
    fn write_provenance(
        &mut self,
        updates: &[(ProvenanceRowId, ProvenanceUpdate)],
    ) -> Result<(), SeedlingError>;

    /// Delete provenance rows.
    fn delete_provenance(&mut self, rows: &[ProvenanceRowId]) -> Result<(), SeedlingError>;

    /// Modules that are installed or being upgraded.
    fn installed_modules(&self) -> Result<BTreeSet<String>, SeedlingError>;

    /// Record a module as installed.
    fn mark_installed(&mut self, module: &str) -> Result<(), SeedlingError>;

    /// Make the working state durable.
    fn commit(&mut self) -> Result<(), SeedlingError>;

    /// Discard everything since the last commit.
    fn rollback(&mut self) -> Result<(), SeedlingError>;
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

/// Call counters of a `MemoryStore`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub search_calls: usize,
    pub browse_calls: usize,
    pub create_calls: usize,
    pub records_created: usize,
    pub write_calls: usize,
    pub records_written: usize,
    pub delete_calls: usize,
    pub records_deleted: usize,
}

impl StoreStats {
    /// Number of calls that modified records.
    #[must_use]
    pub fn mutating_calls(&self) -> usize {
        self.create_calls + self.write_calls + self.delete_calls
    }
}

/// The complete persistent state of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub(crate) tables: BTreeMap<String, BTreeMap<DbId, FieldValueMap>>,
    /// Last id issued per model.
    pub(crate) sequences: BTreeMap<String, i64>,
    pub(crate) provenance: BTreeMap<ProvenanceRowId, ProvenanceRecord>,
    /// Last provenance row issued.
    pub(crate) last_row: u64,
    pub(crate) installed: BTreeSet<String>,
}

impl StoreState {
    fn table(&self, model: &str) -> Option<&BTreeMap<DbId, FieldValueMap>> {
        self.tables.get(model)
    }
}

/// In-memory object store.
///
/// Uses BTreeMap for deterministic iteration order. `commit` snapshots
/// the working state, `rollback` restores the snapshot.
#[derive(Debug)]
pub struct MemoryStore {
    registry: Registry,
    context: Context,
    state: StoreState,
    committed: StoreState,
    stats: Cell<StoreStats>,
}

impl MemoryStore {
    /// Create an empty store over `registry`.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self::from_state(registry, StoreState::default())
    }

    pub(crate) fn from_state(registry: Registry, state: StoreState) -> Self {
        Self {
            registry,
            context: Context::default(),
            committed: state.clone(),
            state,
            stats: Cell::new(StoreStats::default()),
        }
    }

    pub(crate) fn state(&self) -> &StoreState {
        &self.state
    }

    pub(crate) fn committed(&self) -> &StoreState {
        &self.committed
    }

    /// Call counters since creation or the last `reset_stats`.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats.get()
    }

    /// Reset the call counters.
    pub fn reset_stats(&self) {
        self.stats.set(StoreStats::default());
    }

    /// Number of records stored for `model`.
    #[must_use]
    pub fn record_count(&self, model: &str) -> usize {
        self.state.table(model).map_or(0, BTreeMap::len)
    }

    fn bump(&self, update: impl FnOnce(&mut StoreStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    /// Coerce `values` and check that every many-to-one target exists.
    fn prepare(
        &self,
        model: &ModelDef,
        values: FieldValueMap,
    ) -> Result<FieldValueMap, SeedlingError> {
        let mut prepared = FieldValueMap::new();
        for (field, value) in values {
            let value = model.coerce(&field, value)?;
            let def = model.field(&field)?;
            if let (FieldKind::Many2One, FieldValue::Id(target)) = (def.kind, &value) {
                let relation = def.relation.as_deref().unwrap_or_default();
                let exists = self
                    .state
                    .table(relation)
                    .is_some_and(|table| table.contains_key(target));
                if !exists {
                    return Err(SeedlingError::Integrity(format!(
                        "{}.{} points at missing record {},{}",
                        model.name, field, relation, target
                    )));
                }
            }
            prepared.insert(field, value);
        }
        Ok(prepared)
    }
}

impl ObjectStore for MemoryStore {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn set_context(&mut self, context: Context) -> Context {
        std::mem::replace(&mut self.context, context)
    }

    fn search(
        &self,
        model: &str,
        domain: &Domain,
        order: SearchOrder,
    ) -> Result<Vec<DbId>, SeedlingError> {
        let def = self.registry.model(model)?;
        self.bump(|s| s.search_calls += 1);

        let filter_active =
            self.context.active_test && def.has_active() && !domain.mentions(ACTIVE_FIELD);
        let mut ids: Vec<DbId> = self
            .state
            .table(model)
            .into_iter()
            .flatten()
            .filter(|(id, values)| {
                let record = Record::new(**id, (*values).clone());
                domain.matches(&record)
                    && (!filter_active || record.get(ACTIVE_FIELD) == FieldValue::Bool(true))
            })
            .map(|(id, _)| *id)
            .collect();

        if order == SearchOrder::IdDesc {
            ids.reverse();
        }
        Ok(ids)
    }

    fn browse(&self, model: &str, ids: &[DbId]) -> Result<Vec<Record>, SeedlingError> {
        self.registry.model(model)?;
        self.bump(|s| s.browse_calls += 1);

        let Some(table) = self.state.table(model) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| table.get(id).map(|values| Record::new(*id, values.clone())))
            .collect())
    }

    fn create(
        &mut self,
        model: &str,
        values: Vec<FieldValueMap>,
    ) -> Result<Vec<DbId>, SeedlingError> {
        let def = self.registry.model(model)?.clone();
        let count = values.len();

        let mut rows = Vec::with_capacity(count);
        for given in values {
            let mut row = self.prepare(&def, given)?;
            for field in def.fields.keys() {
                if !row.contains_key(field) {
                    row.insert(field.clone(), def.default_for(field)?);
                }
            }
            rows.push(row);
        }

        let sequence = self.state.sequences.entry(model.to_string()).or_insert(0);
        let table = self.state.tables.entry(model.to_string()).or_default();
        let mut ids = Vec::with_capacity(count);
        for row in rows {
            *sequence += 1;
            let id = DbId(*sequence);
            table.insert(id, row);
            ids.push(id);
        }

        self.bump(|s| {
            s.create_calls += 1;
            s.records_created += count;
        });
        Ok(ids)
    }

    fn write(
        &mut self,
        model: &str,
        actions: &[(Vec<DbId>, FieldValueMap)],
    ) -> Result<(), SeedlingError> {
        let def = self.registry.model(model)?.clone();

        let mut prepared = Vec::with_capacity(actions.len());
        for (ids, values) in actions {
            for id in ids {
                let exists = self
                    .state
                    .table(model)
                    .is_some_and(|table| table.contains_key(id));
                if !exists {
                    return Err(SeedlingError::Store(format!(
                        "record {},{} does not exist",
                        model, id
                    )));
                }
            }
            prepared.push((ids, self.prepare(&def, values.clone())?));
        }

        let mut written = 0;
        let table = self.state.tables.entry(model.to_string()).or_default();
        for (ids, values) in prepared {
            for id in ids {
                if let Some(row) = table.get_mut(id) {
                    row.extend(values.clone());
                    written += 1;
                }
            }
        }

        self.bump(|s| {
            s.write_calls += 1;
            s.records_written += written;
        });
        Ok(())
    }

    fn delete(&mut self, model: &str, ids: &[DbId]) -> Result<(), SeedlingError> {
        self.registry.model(model)?;

        let doomed: BTreeSet<(String, DbId)> =
            ids.iter().map(|id| (model.to_string(), *id)).collect();
        let mut next = self.state.clone();
        let mut queue: Vec<(String, DbId)> = doomed.iter().cloned().collect();
        let mut deleted: BTreeSet<(String, DbId)> = BTreeSet::new();

        while let Some((target_model, target)) = queue.pop() {
            let removed = next
                .tables
                .get_mut(&target_model)
                .and_then(|table| table.remove(&target));
            if removed.is_none() || !deleted.insert((target_model.clone(), target)) {
                continue;
            }

            let target_def = self.registry.model(&target_model)?;
            for (referencing, field, field_def) in target_def.referencing(&self.registry) {
                let Some(table) = next.tables.get_mut(&referencing.name) else {
                    continue;
                };
                for (rid, row) in table.iter_mut() {
                    if row.get(field) != Some(&FieldValue::Id(target)) {
                        continue;
                    }
                    let key = (referencing.name.clone(), *rid);
                    if doomed.contains(&key) || deleted.contains(&key) {
                        continue;
                    }
                    match field_def.on_delete {
                        OnDelete::Restrict => {
                            return Err(SeedlingError::Integrity(format!(
                                "{},{} is referenced by {},{} through {}",
                                target_model, target, referencing.name, rid, field
                            )));
                        }
                        OnDelete::SetNull => {
                            row.insert(field.to_string(), FieldValue::None);
                        }
                        OnDelete::Cascade => queue.push(key),
                    }
                }
            }
        }

        self.state = next;
        let count = deleted.len();
        self.bump(|s| {
            s.delete_calls += 1;
            s.records_deleted += count;
        });
        Ok(())
    }

    fn provenance(&self, module: &str) -> Result<Vec<ProvenanceRecord>, SeedlingError> {
        Ok(self
            .state
            .provenance
            .values()
            .filter(|row| row.module == module)
            .cloned()
            .collect())
    }

    fn create_provenance(
        &mut self,
        rows: Vec<NewProvenance>,
    ) -> Result<Vec<ProvenanceRowId>, SeedlingError> {
        let mut created = Vec::with_capacity(rows.len());
        for new in rows {
            let duplicate = self
                .state
                .provenance
                .values()
                .any(|row| row.module == new.module && row.local_id == new.local_id);
            if duplicate {
                return Err(SeedlingError::Store(format!(
                    "provenance for {}.{} already exists",
                    new.module, new.local_id
                )));
            }
            self.state.last_row += 1;
            let row = ProvenanceRowId(self.state.last_row);
            self.state.provenance.insert(
                row,
                ProvenanceRecord {
                    row,
                    module: new.module,
                    local_id: new.local_id,
                    model: new.model,
                    db_id: new.db_id,
                    values: new.values,
                    fs_values: new.fs_values,
                    noupdate: new.noupdate,
                },
            );
            created.push(row);
        }
        Ok(created)
    }

    fn write_provenance(
        &mut self,
        updates: &[(ProvenanceRowId, ProvenanceUpdate)],
    ) -> Result<(), SeedlingError> {
        for (row, update) in updates {
            let record = self.state.provenance.get_mut(row).ok_or_else(|| {
                SeedlingError::Store(format!("provenance row {} does not exist", row.0))
            })?;
            update.apply(record);
        }
        Ok(())
    }

    fn delete_provenance(&mut self, rows: &[ProvenanceRowId]) -> Result<(), SeedlingError> {
        for row in rows {
            self.state.provenance.remove(row);
        }
        Ok(())
    }

    fn installed_modules(&self) -> Result<BTreeSet<String>, SeedlingError> {
        Ok(self.state.installed.clone())
    }

    fn mark_installed(&mut self, module: &str) -> Result<(), SeedlingError> {
        self.state.installed.insert(module.to_string());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SeedlingError> {
        self.committed = self.state.clone();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SeedlingError> {
        self.state = self.committed.clone();
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
