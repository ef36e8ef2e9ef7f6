//! # Tag Handlers
//!
//! A tag handler takes over the event stream for one declarative unit
//! (`<record>` or `<menuitem>`), assembles its field values, and hands them
//! to the reconciler when the unit closes.
//!
//! The dispatcher holds at most one active handler. `on_end` tells it whether
//! the handler keeps the stream (`Next::Stay`) or gives it back
//! (`Next::Release`).

pub mod menuitem;
pub mod record;

pub use menuitem::MenuitemHandler;
pub use record::RecordHandler;

use crate::SeedlingError;
use crate::reconciler::Reconciler;
use crate::store::ObjectStore;
use std::collections::BTreeMap;

/// What the dispatcher does after a handler saw a closing tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// The handler keeps receiving events.
    Stay,
    /// The unit is complete; events return to the dispatcher.
    Release,
}

/// Event sink for one declarative unit.
pub trait TagHandler {
    /// A start tag, including the one that activated the handler.
    fn on_start<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError>;

    /// Character data inside the unit.
    fn on_characters(&mut self, text: &str) -> Result<(), SeedlingError>;

    /// An end tag.
    fn on_end<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
    ) -> Result<Next, SeedlingError>;

    /// Where the handler is, for error reports.
    fn current_state(&self) -> String;
}

/// Attributes of a start tag, unescaped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    values: BTreeMap<String, String>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute (builder style).
    #[must_use]
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    /// Raw attribute value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Attribute value, with empty values treated as absent.
    #[must_use]
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|value| !value.is_empty())
    }

    /// A mandatory attribute.
    pub fn require(&self, tag: &str, name: &str) -> Result<&str, SeedlingError> {
        self.non_empty(name).ok_or_else(|| {
            SeedlingError::Structural(format!("tag {} requires attribute '{}'", tag, name))
        })
    }

    /// A `0`/`1` flag; absent means `false`.
    pub fn flag(&self, tag: &str, name: &str) -> Result<bool, SeedlingError> {
        match self.get(name).map(str::trim) {
            None | Some("" | "0" | "false" | "False") => Ok(false),
            Some("1" | "true" | "True") => Ok(true),
            Some(other) => Err(SeedlingError::InvalidAttribute {
                tag: tag.to_string(),
                attribute: name.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_numeric_and_literal_forms() {
        let attributes = Attributes::new()
            .with("noupdate", "1")
            .with("grouped", "False")
            .with("skiptest", "maybe");

        assert!(attributes.flag("data", "noupdate").expect("flag"));
        assert!(!attributes.flag("data", "grouped").expect("flag"));
        assert!(!attributes.flag("data", "depends").expect("flag"));
        assert!(matches!(
            attributes.flag("data", "skiptest"),
            Err(SeedlingError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn empty_attributes_count_as_absent() {
        let attributes = Attributes::new().with("icon", "");
        assert_eq!(attributes.get("icon"), Some(""));
        assert_eq!(attributes.non_empty("icon"), None);
        assert!(attributes.require("menuitem", "icon").is_err());
    }
}
