//! # Record Handler
//!
//! Handles `<record model=".." id=".." update="0|1">` and its `<field>`
//! children.
//!
//! A field's value comes from the first attribute present among `search`,
//! `ref` and `eval`; otherwise from its character data. Fields of
//! `type="xml"` carry markup: wrapping CDATA markers are stripped and
//! `%(symbolic_id)d` / `%(symbolic_id)s` placeholders are replaced with the
//! database id of the referenced record.

use super::{Attributes, Next, TagHandler};
use crate::expression::{self, EmptyEnvironment, Environment};
use crate::primitives::{MAX_FIELD_TEXT_LENGTH, TAG_FIELD, TAG_RECORD};
use crate::reconciler::Reconciler;
use crate::store::{ContextOverride, Domain, ObjectStore, SearchOrder, scoped};
use crate::{DbId, FieldValue, FieldValueMap, SeedlingError};
use chrono::{Local, Utc};
use std::collections::BTreeSet;
use std::fmt::Write;

const CDATA_OPEN: &str = "<![cdata[";
const CDATA_CLOSE: &str = "]]>";

/// The field currently being read.
#[derive(Debug)]
struct OpenField {
    name: String,
    markup: bool,
    /// Value taken from a `search`, `ref` or `eval` attribute.
    resolved: Option<FieldValue>,
    text: String,
}

/// Handler of `<record>` units.
#[derive(Debug, Default)]
pub struct RecordHandler {
    /// Ids declared so far in this load.
    seen: BTreeSet<String>,
    model: Option<String>,
    symbolic_id: Option<String>,
    update: bool,
    values: FieldValueMap,
    field: Option<OpenField>,
}

impl RecordHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn open_record<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError> {
        let model = attributes.require(TAG_RECORD, "model")?;
        self.model = Some(model.to_string());
        self.symbolic_id = attributes.get("id").map(str::to_string);
        reconciler.store().registry().model(model)?;
        self.symbolic_id = Some(attributes.require(TAG_RECORD, "id")?.to_string());
        self.update = attributes.flag(TAG_RECORD, "update")?;
        self.values = FieldValueMap::new();
        self.field = None;
        Ok(())
    }

    fn open_field<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError> {
        if self.field.is_some() {
            return Err(SeedlingError::Structural(
                "Tags 'field' cannot be nested.".to_string(),
            ));
        }
        let name = attributes.require(TAG_FIELD, "name")?.to_string();
        let markup = attributes.get("type") == Some("xml");

        let resolved = if let Some(search) = attributes.non_empty("search") {
            Some(self.search(reconciler, &name, search)?)
        } else if let Some(reference) = attributes.non_empty("ref") {
            Some(FieldValue::Id(reconciler.resolve(reference)?))
        } else if let Some(source) = attributes.non_empty("eval") {
            Some(expression::evaluate(
                source,
                &mut DocumentEnvironment { reconciler },
            )?)
        } else {
            None
        };

        self.field = Some(OpenField {
            name,
            markup,
            resolved,
            text: String::new(),
        });
        Ok(())
    }

    /// Run a `search` domain against the target model of `field`.
    fn search<S: ObjectStore>(
        &self,
        reconciler: &mut Reconciler<'_, S>,
        field: &str,
        source: &str,
    ) -> Result<FieldValue, SeedlingError> {
        let model = self.model.as_deref().unwrap_or_default();
        let target = reconciler
            .store()
            .registry()
            .model(model)?
            .field(field)?
            .relation
            .clone()
            .ok_or_else(|| SeedlingError::InvalidAttribute {
                tag: TAG_FIELD.to_string(),
                attribute: "search".to_string(),
                value: source.to_string(),
            })?;

        let domain = Domain::from_value(&expression::evaluate(source, &mut EmptyEnvironment)?)?;
        let found = {
            let scope = scoped(reconciler.store(), ContextOverride::new().active_test(false));
            scope.search(&target, &domain, SearchOrder::IdAsc)?
        };
        match found.as_slice() {
            [id] => Ok(FieldValue::Id(*id)),
            _ => Err(SeedlingError::UnresolvedReference(format!(
                "search {} on {} matched {} records",
                source,
                target,
                found.len()
            ))),
        }
    }

    fn close_field<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
    ) -> Result<(), SeedlingError> {
        let field = self.field.take().ok_or_else(|| {
            SeedlingError::Structural("closing tag 'field' without an open field".to_string())
        })?;
        let value = match field.resolved {
            Some(value) => value,
            None if field.markup => {
                let text = strip_cdata_markers(&field.text);
                FieldValue::Text(substitute_placeholders(text, |id| reconciler.resolve(id))?)
            }
            None => FieldValue::Text(field.text),
        };
        self.values.insert(field.name, value);
        Ok(())
    }

    fn close_record<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
    ) -> Result<(), SeedlingError> {
        let model = self.model.clone().unwrap_or_default();
        let id = self.symbolic_id.clone().unwrap_or_default();
        if self.seen.contains(&id) && !self.update {
            return Err(SeedlingError::DuplicateIdentity(id));
        }
        let values = std::mem::take(&mut self.values);
        reconciler.import_record(&model, values, &id)?;
        self.seen.insert(id);
        Ok(())
    }
}

impl TagHandler for RecordHandler {
    fn on_start<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError> {
        match tag {
            TAG_RECORD => self.open_record(reconciler, attributes),
            TAG_FIELD => self.open_field(reconciler, attributes),
            other => Err(SeedlingError::Structural(format!(
                "Tags '{}' not supported inside tag record.",
                other
            ))),
        }
    }

    fn on_characters(&mut self, text: &str) -> Result<(), SeedlingError> {
        let Some(field) = self.field.as_mut() else {
            return Ok(());
        };
        if field.resolved.is_some() {
            return Ok(());
        }
        if field.text.len() + text.len() > MAX_FIELD_TEXT_LENGTH {
            return Err(SeedlingError::Structural(format!(
                "field {} exceeds {} bytes",
                field.name, MAX_FIELD_TEXT_LENGTH
            )));
        }
        field.text.push_str(text);
        Ok(())
    }

    fn on_end<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
    ) -> Result<Next, SeedlingError> {
        match tag {
            TAG_FIELD => {
                self.close_field(reconciler)?;
                Ok(Next::Stay)
            }
            TAG_RECORD => {
                self.close_record(reconciler)?;
                Ok(Next::Release)
            }
            other => Err(SeedlingError::Structural(format!(
                "Unexpected closing tag '{}'",
                other
            ))),
        }
    }

    fn current_state(&self) -> String {
        format!(
            "In tag record: model {} with id {}.",
            self.model.as_deref().unwrap_or("?"),
            self.symbolic_id.as_deref().unwrap_or("?")
        )
    }
}

// =============================================================================
// EXPRESSION BINDINGS
// =============================================================================

/// Names bound inside `eval` attributes.
///
/// - `version`: major.minor of this release
/// - `ref(id)`: database id of a symbolic id
/// - `obj(...)`: always `1`
/// - `time.strftime(format)`, `time.time()`
struct DocumentEnvironment<'r, 's, S: ObjectStore> {
    reconciler: &'r mut Reconciler<'s, S>,
}

fn release_version() -> &'static str {
    let version = env!("CARGO_PKG_VERSION");
    version
        .rsplit_once('.')
        .map_or(version, |(major_minor, _)| major_minor)
}

impl<S: ObjectStore> Environment for DocumentEnvironment<'_, '_, S> {
    fn lookup(&mut self, name: &str) -> Result<Option<FieldValue>, SeedlingError> {
        Ok(match name {
            "version" => Some(FieldValue::text(release_version())),
            _ => None,
        })
    }

    fn call(
        &mut self,
        name: &str,
        args: Vec<FieldValue>,
    ) -> Result<Option<FieldValue>, SeedlingError> {
        let invalid = |message: String| SeedlingError::InvalidExpression(message);
        match (name, args.as_slice()) {
            ("ref", [FieldValue::Text(id)]) => {
                Ok(Some(FieldValue::Id(self.reconciler.resolve(id)?)))
            }
            ("ref", _) => Err(invalid("ref() takes one symbolic id".to_string())),
            ("obj", _) => Ok(Some(FieldValue::Int(1))),
            ("time.strftime", [FieldValue::Text(format)]) => {
                let mut out = String::new();
                write!(out, "{}", Local::now().format(format))
                    .map_err(|_| invalid(format!("invalid time format \"{}\"", format)))?;
                Ok(Some(FieldValue::Text(out)))
            }
            ("time.time", []) => Ok(Some(FieldValue::Int(Utc::now().timestamp()))),
            ("time.strftime" | "time.time", _) => {
                Err(invalid(format!("bad arguments to {}()", name)))
            }
            _ => Ok(None),
        }
    }
}

// =============================================================================
// MARKUP FIELDS
// =============================================================================

/// Remove a wrapping `<![CDATA[` ... `]]>` pair, matched case-insensitively.
#[must_use]
pub fn strip_cdata_markers(text: &str) -> &str {
    let mut text = text;
    let start = text.trim_start();
    if start
        .get(..CDATA_OPEN.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(CDATA_OPEN))
    {
        text = &start[CDATA_OPEN.len()..];
    }
    let end = text.trim_end();
    if let Some(stripped) = end.strip_suffix(CDATA_CLOSE) {
        text = stripped;
    }
    text
}

/// Replace `%(symbolic_id)d` and `%(symbolic_id)s` with resolved ids.
///
/// `%%` is copied through untouched and never starts a placeholder; any
/// other `%` is literal. Unlike printf-style formatting, `%%` is not
/// collapsed to a single `%`.
pub fn substitute_placeholders(
    text: &str,
    mut resolve: impl FnMut(&str) -> Result<DbId, SeedlingError>,
) -> Result<String, SeedlingError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("%%") {
            out.push_str("%%");
            rest = after;
            continue;
        }
        if let Some(inner) = tail.strip_prefix("%(")
            && let Some(close) = inner.find(')')
        {
            let id = &inner[..close];
            let after = &inner[close + 1..];
            if !id.is_empty()
                && let Some(after) = after.strip_prefix('d').or_else(|| after.strip_prefix('s'))
            {
                out.push_str(&resolve(id)?.to_string());
                rest = after;
                continue;
            }
        }
        out.push('%');
        rest = &tail[1..];
    }
    out.push_str(rest);
    Ok(out)
}
