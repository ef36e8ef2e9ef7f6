//! # Model Registry
//!
//! Field metadata for every model the store knows about.
//!
//! The registry answers three questions for the reconciler:
//! - which models exist (`contains`, `known_models`)
//! - what kind a field has (`ModelDef::field`)
//! - what a field's freshly computed default is (`ModelDef::default_for`)
//!
//! It also owns value coercion: declared literals are converted to the
//! field's kind before any comparison or store call, so an unchanged
//! declaration always compares equal to what the store holds.

use crate::primitives::{
    ACTIVE_FIELD, MODEL_ACTION, MODEL_ACTION_REPORT, MODEL_ACTION_URL, MODEL_ACTION_WINDOW,
    MODEL_ACTION_WINDOW_VIEW, MODEL_ACTION_WIZARD, MODEL_ICON, MODEL_MENU, MODEL_VIEW,
};
use crate::{DbId, FieldValue, SeedlingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// FIELD METADATA
// =============================================================================

/// Kind of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Char,
    Text,
    Integer,
    Boolean,
    Selection,
    #[serde(rename = "many2one")]
    Many2One,
    Reference,
    #[serde(rename = "one2many")]
    One2Many,
    #[serde(rename = "many2many")]
    Many2Many,
}

impl FieldKind {
    /// Multi-valued relational kinds cannot be reconciled field by field.
    #[must_use]
    pub fn is_multi_valued(self) -> bool {
        matches!(self, Self::One2Many | Self::Many2Many)
    }

    /// Kinds whose value points at another record.
    #[must_use]
    pub fn is_relational(self) -> bool {
        matches!(self, Self::Many2One | Self::One2Many | Self::Many2Many)
    }
}

/// What happens to a many-to-one when its target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    /// Clear the referencing field.
    #[default]
    SetNull,
    /// Refuse the deletion.
    Restrict,
    /// Delete the referencing record too.
    Cascade,
}

/// Definition of a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub kind: FieldKind,
    /// Target model of relational fields.
    #[serde(default)]
    pub relation: Option<String>,
    /// Value used when a record is created without this field.
    #[serde(default)]
    pub default: FieldValue,
    #[serde(default)]
    pub on_delete: OnDelete,
}

impl FieldDef {
    /// Create a field of the given kind with no default.
    #[must_use]
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            relation: None,
            default: FieldValue::None,
            on_delete: OnDelete::SetNull,
        }
    }

    /// Many-to-one field pointing at `relation`.
    #[must_use]
    pub fn many2one(relation: &str) -> Self {
        Self::new(FieldKind::Many2One).relation(relation)
    }

    /// Set the relation target.
    #[must_use]
    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    /// Set the default value.
    #[must_use]
    pub fn default_value(mut self, value: FieldValue) -> Self {
        self.default = value;
        self
    }

    /// Set the deletion policy.
    #[must_use]
    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = on_delete;
        self
    }
}

// =============================================================================
// MODEL METADATA
// =============================================================================

/// Definition of a model: its name and fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
}

impl ModelDef {
    /// Create a model without fields.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field (builder style).
    #[must_use]
    pub fn with_field(mut self, name: &str, def: FieldDef) -> Self {
        self.fields.insert(name.to_string(), def);
        self
    }

    /// Look up a field definition.
    pub fn field(&self, name: &str) -> Result<&FieldDef, SeedlingError> {
        self.fields
            .get(name)
            .ok_or_else(|| SeedlingError::UnknownField {
                model: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Whether the model supports soft deletion through an `active` flag.
    #[must_use]
    pub fn has_active(&self) -> bool {
        self.fields
            .get(ACTIVE_FIELD)
            .is_some_and(|def| def.kind == FieldKind::Boolean)
    }

    /// Freshly computed default of a field, already coerced.
    pub fn default_for(&self, field: &str) -> Result<FieldValue, SeedlingError> {
        let def = self.field(field)?;
        self.coerce(field, def.default.clone())
    }

    /// Coerce a raw value to the kind of `field`.
    pub fn coerce(&self, field: &str, value: FieldValue) -> Result<FieldValue, SeedlingError> {
        let def = self.field(field)?;
        let invalid = |value: &FieldValue| SeedlingError::InvalidValue {
            model: self.name.clone(),
            field: field.to_string(),
            value: value.to_string(),
        };

        let coerced = match (def.kind, value) {
            (FieldKind::Char | FieldKind::Text | FieldKind::Selection, value) => match value {
                FieldValue::None | FieldValue::Bool(false) => FieldValue::None,
                FieldValue::Text(s) => FieldValue::Text(s),
                FieldValue::List(_) => return Err(invalid(&value)),
                other => FieldValue::Text(other.to_string()),
            },
            (FieldKind::Integer, value) => match value {
                FieldValue::None => FieldValue::None,
                FieldValue::Int(i) => FieldValue::Int(i),
                FieldValue::Id(id) => FieldValue::Int(id.0),
                FieldValue::Bool(b) => FieldValue::Int(i64::from(b)),
                FieldValue::Text(ref s) if s.trim().is_empty() => FieldValue::None,
                FieldValue::Text(ref s) => {
                    FieldValue::Int(s.trim().parse().map_err(|_| invalid(&value))?)
                }
                other => return Err(invalid(&other)),
            },
            (FieldKind::Boolean, value) => match value {
                FieldValue::None => FieldValue::Bool(false),
                FieldValue::Bool(b) => FieldValue::Bool(b),
                FieldValue::Int(i) => FieldValue::Bool(i != 0),
                FieldValue::Text(ref s) => match s.trim() {
                    "" | "0" | "false" | "False" => FieldValue::Bool(false),
                    "1" | "true" | "True" => FieldValue::Bool(true),
                    _ => return Err(invalid(&value)),
                },
                other => return Err(invalid(&other)),
            },
            (FieldKind::Many2One, value) => match value {
                FieldValue::None | FieldValue::Bool(false) => FieldValue::None,
                FieldValue::Id(id) => FieldValue::Id(id),
                FieldValue::Int(i) => FieldValue::Id(DbId(i)),
                FieldValue::Text(ref s) if s.trim().is_empty() => FieldValue::None,
                FieldValue::Text(ref s) => {
                    FieldValue::Id(DbId(s.trim().parse().map_err(|_| invalid(&value))?))
                }
                other => return Err(invalid(&other)),
            },
            (FieldKind::Reference, value) => match value {
                FieldValue::None | FieldValue::Bool(false) => FieldValue::None,
                FieldValue::Text(s) | FieldValue::Reference(s) if s.is_empty() => FieldValue::None,
                FieldValue::Text(s) | FieldValue::Reference(s) => FieldValue::Reference(s),
                other => return Err(invalid(&other)),
            },
            (FieldKind::One2Many | FieldKind::Many2Many, value) => match value {
                FieldValue::None => FieldValue::List(Vec::new()),
                FieldValue::List(items) => FieldValue::List(items),
                other => return Err(invalid(&other)),
            },
        };
        Ok(coerced)
    }

    /// Relational fields of other models that point at this one.
    pub fn referencing<'r>(
        &self,
        registry: &'r Registry,
    ) -> impl Iterator<Item = (&'r ModelDef, &'r str, &'r FieldDef)> {
        let target = self.name.clone();
        registry.models.values().flat_map(move |model| {
            let target = target.clone();
            model.fields.iter().filter_map(move |(name, def)| {
                (def.kind == FieldKind::Many2One && def.relation.as_deref() == Some(&target))
                    .then_some((model, name.as_str(), def))
            })
        })
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// The set of models known to a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    models: BTreeMap<String, ModelDef>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the models the menu shorthand needs.
    #[must_use]
    pub fn builtin() -> Self {
        let active = || FieldDef::new(FieldKind::Boolean).default_value(FieldValue::Bool(true));
        let char = || FieldDef::new(FieldKind::Char);
        let integer = || FieldDef::new(FieldKind::Integer);

        let mut registry = Self::new();
        registry.register(
            ModelDef::new(MODEL_ICON)
                .with_field("name", char())
                .with_field("path", char()),
        );
        registry.register(
            ModelDef::new(MODEL_VIEW)
                .with_field("model", char())
                .with_field("type", FieldDef::new(FieldKind::Selection))
                .with_field("field_childs", char())
                .with_field("arch", FieldDef::new(FieldKind::Text)),
        );
        registry.register(
            ModelDef::new(MODEL_ACTION)
                .with_field("name", char())
                .with_field("type", char())
                .with_field("icon", FieldDef::many2one(MODEL_ICON))
                .with_field("active", active()),
        );
        for (subtype, extra) in [
            (MODEL_ACTION_REPORT, "report_name"),
            (MODEL_ACTION_WINDOW, "res_model"),
            (MODEL_ACTION_WIZARD, "wiz_name"),
            (MODEL_ACTION_URL, "url"),
        ] {
            registry.register(
                ModelDef::new(subtype)
                    .with_field(
                        "action",
                        FieldDef::many2one(MODEL_ACTION).on_delete(OnDelete::Cascade),
                    )
                    .with_field(extra, char())
                    .with_field("active", active()),
            );
        }
        registry.register(
            ModelDef::new(MODEL_ACTION_WINDOW_VIEW)
                .with_field("sequence", integer())
                .with_field(
                    "act_window",
                    FieldDef::many2one(MODEL_ACTION_WINDOW).on_delete(OnDelete::Cascade),
                )
                .with_field(
                    "view",
                    FieldDef::many2one(MODEL_VIEW).on_delete(OnDelete::Cascade),
                ),
        );
        registry.register(
            ModelDef::new(MODEL_MENU)
                .with_field("name", char())
                .with_field("sequence", integer())
                .with_field(
                    "parent",
                    FieldDef::many2one(MODEL_MENU).on_delete(OnDelete::Cascade),
                )
                .with_field("icon", char())
                .with_field("action", FieldDef::new(FieldKind::Reference))
                .with_field("active", active()),
        );
        registry
    }

    /// Builtin models extended (or overridden) by `models`.
    #[must_use]
    pub fn from_models(models: impl IntoIterator<Item = ModelDef>) -> Self {
        let mut registry = Self::builtin();
        for model in models {
            registry.register(model);
        }
        registry
    }

    /// Register a model, replacing any previous definition of the same name.
    pub fn register(&mut self, model: ModelDef) {
        self.models.insert(model.name.clone(), model);
    }

    /// Look up a model, failing with `UnknownModel`.
    pub fn model(&self, name: &str) -> Result<&ModelDef, SeedlingError> {
        self.models
            .get(name)
            .ok_or_else(|| SeedlingError::UnknownModel(name.to_string()))
    }

    /// Whether a model is known.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Names of all known models, sorted.
    pub fn known_models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Number of known models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Check that every relational field names a known model.
    pub fn validate(&self) -> Result<(), SeedlingError> {
        for model in self.models.values() {
            for (name, def) in &model.fields {
                if !def.kind.is_relational() {
                    continue;
                }
                match def.relation.as_deref() {
                    Some(target) if self.contains(target) => {}
                    Some(target) => {
                        return Err(SeedlingError::Config(format!(
                            "field {}.{} points at unknown model {}",
                            model.name, name, target
                        )));
                    }
                    None => {
                        return Err(SeedlingError::Config(format!(
                            "relational field {}.{} has no relation",
                            model.name, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
