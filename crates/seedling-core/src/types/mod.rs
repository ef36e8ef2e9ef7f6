//! # Core Type Definitions
//!
//! This module contains all core types for the Seedling reconciliation engine:
//! - Identifiers (`DbId`, `ProvenanceRowId`, `SymbolicId`)
//! - Field values (`FieldValue`, `FieldValueMap`, `Record`)
//! - Provenance rows (`ProvenanceRecord`, `NewProvenance`, `ProvenanceUpdate`)
//! - Module lifecycle (`ModuleState`)
//! - Error types (`SeedlingError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Backing-store identity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DbId(pub i64);

impl fmt::Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row identifier of a provenance record.
///
/// Rows are numbered in creation order, so descending row order is the
/// reverse creation (and therefore reverse dependency) order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ProvenanceRowId(pub u64);

/// Stable, human-assigned identifier of a declared record: `(module, local_id)`.
///
/// Written `module.local_id` when cross-referencing another module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolicId {
    /// The declaration set (module) owning the identifier.
    pub module: String,
    /// The identifier local to its module.
    pub local: String,
}

impl SymbolicId {
    /// Create a new symbolic identifier.
    #[must_use]
    pub fn new(module: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            local: local.into(),
        }
    }

    /// Parse a possibly dotted identifier.
    ///
    /// A bare `local_id` belongs to `default_module`; `module.local_id` names
    /// another module explicitly. More than one dot is rejected.
    pub fn parse(raw: &str, default_module: &str) -> Result<Self, SeedlingError> {
        match raw.split_once('.') {
            None if raw.is_empty() => Err(SeedlingError::Structural(
                "symbolic id must not be empty".to_string(),
            )),
            None => Ok(Self::new(default_module, raw)),
            Some((_, local)) if local.contains('.') => Err(SeedlingError::Structural(format!(
                "\"{}\" contains too many dots; symbolic ids contain at most one dot, \
                 as in module.local_id",
                raw
            ))),
            Some((module, local)) if module.is_empty() || local.is_empty() => Err(
                SeedlingError::Structural(format!("malformed symbolic id \"{}\"", raw)),
            ),
            Some((module, local)) => Ok(Self::new(module, local)),
        }
    }
}

impl fmt::Display for SymbolicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.local)
    }
}

// =============================================================================
// FIELD VALUES
// =============================================================================

/// A raw field value, as declared or as materialized from the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Absent / NULL.
    #[default]
    None,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Character data.
    Text(String),
    /// Resolved many-to-one identity.
    Id(DbId),
    /// `"model,id"` reference string.
    Reference(String),
    /// List or tuple value (expression results, search domains).
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Create a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Truthiness: `None`, `false`, `0`, empty text and empty lists are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Text(s) | Self::Reference(s) => !s.is_empty(),
            Self::Id(_) => true,
            Self::List(items) => !items.is_empty(),
        }
    }

    /// Get the value as a string slice (text and reference values only).
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Reference(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer (integer and identity values only).
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Id(id) => Some(id.0),
            _ => None,
        }
    }

    /// Get the value as a store identity.
    #[must_use]
    pub fn as_id(&self) -> Option<DbId> {
        self.as_int().map(DbId)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) | Self::Reference(s) => write!(f, "{}", s),
            Self::Id(id) => write!(f, "{}", id),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Mapping field name -> raw value.
pub type FieldValueMap = BTreeMap<String, FieldValue>;

/// A materialized store record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The record identity.
    pub id: DbId,
    /// All stored field values.
    pub values: FieldValueMap,
}

impl Record {
    /// Create a new record.
    #[must_use]
    pub fn new(id: DbId, values: FieldValueMap) -> Self {
        Self { id, values }
    }

    /// Get a field value, `FieldValue::None` when unset.
    #[must_use]
    pub fn get(&self, field: &str) -> FieldValue {
        self.values.get(field).cloned().unwrap_or_default()
    }
}

// =============================================================================
// PROVENANCE
// =============================================================================

/// Persisted mapping from a symbolic identifier to its backing record.
///
/// Ground truth for merge decisions; survives across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Row identifier (creation order).
    pub row: ProvenanceRowId,
    /// Owning module.
    pub module: String,
    /// Symbolic id local to the module.
    pub local_id: String,
    /// Model of the backing record.
    pub model: String,
    /// Identity of the backing record.
    pub db_id: DbId,
    /// Last-synced (cleaned) field values.
    pub values: Option<FieldValueMap>,
    /// Values as last declared in the document.
    pub fs_values: Option<FieldValueMap>,
    /// Whether the record was declared inside an update-suppressed block.
    pub noupdate: bool,
}

impl ProvenanceRecord {
    /// The symbolic identifier this row tracks.
    #[must_use]
    pub fn symbolic_id(&self) -> SymbolicId {
        SymbolicId::new(&self.module, &self.local_id)
    }
}

/// A provenance row about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProvenance {
    pub module: String,
    pub local_id: String,
    pub model: String,
    pub db_id: DbId,
    pub values: Option<FieldValueMap>,
    pub fs_values: Option<FieldValueMap>,
    pub noupdate: bool,
}

/// Partial update of a provenance row; `None` leaves the column untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProvenanceUpdate {
    pub db_id: Option<DbId>,
    pub values: Option<FieldValueMap>,
    pub fs_values: Option<FieldValueMap>,
}

impl ProvenanceUpdate {
    /// Apply this update to a stored row.
    pub fn apply(&self, record: &mut ProvenanceRecord) {
        if let Some(db_id) = self.db_id {
            record.db_id = db_id;
        }
        if let Some(values) = &self.values {
            record.values = Some(values.clone());
        }
        if let Some(fs_values) = &self.fs_values {
            record.fs_values = Some(fs_values.clone());
        }
    }
}

// =============================================================================
// MODULE LIFECYCLE
// =============================================================================

/// Lifecycle state of the module being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// First load of the module: update-suppressed blocks still apply.
    ToInstall,
    /// Reload of an installed module.
    ToUpgrade,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur while loading module data.
///
/// - Every fatal error aborts the parse-and-reconcile phase
/// - Use `Result<T, SeedlingError>` for fallible operations
/// - Non-fatal conditions (user-modified fields, failed orphan deletions)
///   are logged and reported, never raised
#[derive(Debug, Error)]
pub enum SeedlingError {
    /// Bad tag nesting or an unsupported tag inside a delegated unit.
    #[error("Structural error: {0}")]
    Structural(String),

    /// A symbolic id was declared twice without the update flag.
    #[error("Duplicate id: \"{0}\"")]
    DuplicateIdentity(String),

    /// A `ref`, `search` or cross-module id did not resolve to exactly one record.
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    /// A multi-valued relational field cannot be reconciled.
    #[error("Unhandled field {field} of {model}")]
    UnhandledFieldType { model: String, field: String },

    /// The model is not known to the registry.
    #[error("The model {0} does not exist")]
    UnknownModel(String),

    /// The field is not declared on the model.
    #[error("The field {field} does not exist on {model}")]
    UnknownField { model: String, field: String },

    /// A tracked symbolic id was redeclared under another model.
    #[error(
        "Record {id} tries to overwrite data with the wrong model: {declared} (tracked as {tracked})"
    )]
    ModelMismatch {
        id: String,
        declared: String,
        tracked: String,
    },

    /// A value cannot be coerced to the field's kind.
    #[error("Invalid value {value:?} for field {field} of {model}")]
    InvalidValue {
        model: String,
        field: String,
        value: String,
    },

    /// A restricted expression failed to parse or evaluate.
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// A tag attribute has an unusable value.
    #[error("Invalid attribute {attribute}=\"{value}\" on tag {tag}")]
    InvalidAttribute {
        tag: String,
        attribute: String,
        value: String,
    },

    /// The document is not well-formed XML.
    #[error("XML error: {0}")]
    Xml(String),

    /// A deletion was blocked by a referencing record.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// The store rejected an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fatal error raised while parsing a document, with its location.
    #[error("{source} (at byte {position}: {state})")]
    Document {
        state: String,
        position: u64,
        #[source]
        source: Box<SeedlingError>,
    },
}

impl SeedlingError {
    /// The underlying error, with document location wrappers removed.
    #[must_use]
    pub fn root_cause(&self) -> &SeedlingError {
        match self {
            Self::Document { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_id_defaults_to_current_module() {
        let id = SymbolicId::parse("menu_root", "base").expect("parse");
        assert_eq!(id, SymbolicId::new("base", "menu_root"));
    }

    #[test]
    fn symbolic_id_cross_module() {
        let id = SymbolicId::parse("party.party_form", "sale").expect("parse");
        assert_eq!(id.module, "party");
        assert_eq!(id.local, "party_form");
        assert_eq!(id.to_string(), "party.party_form");
    }

    #[test]
    fn symbolic_id_rejects_too_many_dots() {
        let result = SymbolicId::parse("a.b.c", "base");
        assert!(matches!(result, Err(SeedlingError::Structural(_))));
    }

    #[test]
    fn truthiness() {
        assert!(!FieldValue::None.is_truthy());
        assert!(!FieldValue::Bool(false).is_truthy());
        assert!(!FieldValue::Int(0).is_truthy());
        assert!(!FieldValue::text("").is_truthy());
        assert!(!FieldValue::List(Vec::new()).is_truthy());
        assert!(FieldValue::Id(DbId(3)).is_truthy());
        assert!(FieldValue::text("x").is_truthy());
    }

    #[test]
    fn provenance_update_is_partial() {
        let mut record = ProvenanceRecord {
            row: ProvenanceRowId(1),
            module: "base".to_string(),
            local_id: "a".to_string(),
            model: "res.partner".to_string(),
            db_id: DbId(4),
            values: None,
            fs_values: Some(FieldValueMap::new()),
            noupdate: false,
        };
        let mut values = FieldValueMap::new();
        values.insert("name".to_string(), FieldValue::text("A"));

        ProvenanceUpdate {
            values: Some(values.clone()),
            ..ProvenanceUpdate::default()
        }
        .apply(&mut record);

        assert_eq!(record.db_id, DbId(4));
        assert_eq!(record.values, Some(values));
        assert_eq!(record.fs_values, Some(FieldValueMap::new()));
    }

    #[test]
    fn root_cause_unwraps_document_errors() {
        let err = SeedlingError::Document {
            state: "In tag record: model m with id x.".to_string(),
            position: 12,
            source: Box::new(SeedlingError::DuplicateIdentity("x".to_string())),
        };
        assert!(matches!(
            err.root_cause(),
            SeedlingError::DuplicateIdentity(_)
        ));
    }
}
