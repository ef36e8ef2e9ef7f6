//! # Streaming Dispatcher
//!
//! Drives a `quick-xml` event stream through the tag handlers.
//!
//! The dispatcher itself handles the root element and `<data>` blocks:
//! - `noupdate="1"`: existing records are left alone after install
//! - `grouped="1"`: creations and writes are buffered until `</data>`
//! - `depends="a,b"`: the block is skipped unless every module is installed
//! - `skiptest="1"`: the block is skipped in test mode
//!
//! `<record>` and `<menuitem>` activate their handler, which then receives
//! every event until it releases the stream. Other tags outside a handler
//! are logged and ignored.
//!
//! Any error aborts the document and is wrapped with the byte position and
//! the active handler's description of where it was.

use crate::handlers::{Attributes, MenuitemHandler, Next, RecordHandler, TagHandler};
use crate::primitives::{MAX_DOCUMENT_SIZE, TAG_DATA, TAG_MENUITEM, TAG_RECORD, TAG_ROOT};
use crate::reconciler::Reconciler;
use crate::state::BlockFlags;
use crate::store::ObjectStore;
use crate::SeedlingError;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeSet;
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Record,
    Menuitem,
}

fn xml_error(err: impl std::fmt::Display) -> SeedlingError {
    SeedlingError::Xml(err.to_string())
}

/// Event router for the documents of one module load.
///
/// Handlers persist across documents, so duplicate ids are detected across
/// the whole load.
#[derive(Debug)]
pub struct StreamingDispatcher {
    record: RecordHandler,
    menuitem: MenuitemHandler,
    active: Option<HandlerKind>,
    /// Inside a `<data>` block whose flags skip it.
    skipping: bool,
    /// Modules installed or being loaded.
    installed: BTreeSet<String>,
    test_mode: bool,
    max_document_size: u64,
}

impl StreamingDispatcher {
    /// Create a dispatcher; `installed` decides `depends` blocks.
    #[must_use]
    pub fn new(installed: BTreeSet<String>) -> Self {
        Self {
            record: RecordHandler::new(),
            menuitem: MenuitemHandler::new(),
            active: None,
            skipping: false,
            installed,
            test_mode: false,
            max_document_size: MAX_DOCUMENT_SIZE,
        }
    }

    /// Honor `skiptest` flags.
    #[must_use]
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    #[must_use]
    pub fn with_max_document_size(mut self, max: u64) -> Self {
        self.max_document_size = max;
        self
    }

    /// Where parsing currently is.
    #[must_use]
    pub fn current_state(&self) -> String {
        match self.active {
            Some(HandlerKind::Record) => self.record.current_state(),
            Some(HandlerKind::Menuitem) => self.menuitem.current_state(),
            None => "Outside any record.".to_string(),
        }
    }

    /// Parse a document held in memory.
    pub fn parse_bytes<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        document: &[u8],
    ) -> Result<(), SeedlingError> {
        if document.len() as u64 > self.max_document_size {
            return Err(SeedlingError::Structural(format!(
                "document of {} bytes exceeds the limit of {} bytes",
                document.len(),
                self.max_document_size
            )));
        }
        self.parse(reconciler, document)
    }

    /// Parse one document, reconciling each unit as it closes.
    pub fn parse<S: ObjectStore, R: BufRead>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        source: R,
    ) -> Result<(), SeedlingError> {
        self.active = None;
        self.skipping = false;

        let mut reader = Reader::from_reader(source);
        let mut buf = Vec::new();
        loop {
            let event = reader.read_event_into(&mut buf);
            let position = reader.buffer_position() as u64;
            let step = match event {
                Ok(Event::Eof) => break,
                Ok(event) => self.handle(reconciler, event),
                Err(err) => Err(xml_error(err)),
            };
            let step = step.and_then(|()| {
                if position > self.max_document_size {
                    Err(SeedlingError::Structural(format!(
                        "document exceeds the limit of {} bytes",
                        self.max_document_size
                    )))
                } else {
                    Ok(())
                }
            });
            if let Err(err) = step {
                return Err(self.fail(err, position));
            }
            buf.clear();
        }

        if self.active.is_some() {
            let position = reader.buffer_position() as u64;
            let err = SeedlingError::Structural("document ended inside a unit".to_string());
            return Err(self.fail(err, position));
        }
        Ok(())
    }

    fn fail(&mut self, source: SeedlingError, position: u64) -> SeedlingError {
        let state = self.current_state();
        tracing::error!("Error while parsing at byte {}: {}", position, state);
        self.active = None;
        self.skipping = false;
        SeedlingError::Document {
            state,
            position,
            source: Box::new(source),
        }
    }

    fn handle<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        event: Event<'_>,
    ) -> Result<(), SeedlingError> {
        match event {
            Event::Start(e) => {
                let (tag, attributes) = read_start(&e)?;
                self.start(reconciler, &tag, &attributes)
            }
            Event::Empty(e) => {
                let (tag, attributes) = read_start(&e)?;
                self.start(reconciler, &tag, &attributes)?;
                self.end(reconciler, &tag)
            }
            Event::End(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                self.end(reconciler, &tag)
            }
            Event::Text(e) => {
                let text = e.decode().map_err(xml_error)?;
                self.characters(&text)
            }
            Event::CData(e) => self.characters(&String::from_utf8_lossy(&e)),
            Event::GeneralRef(e) => {
                let text = match e.resolve_char_ref().map_err(xml_error)? {
                    Some(c) => c.to_string(),
                    None => {
                        let name = e.decode().map_err(xml_error)?;
                        quick_xml::escape::resolve_predefined_entity(&name)
                            .map(str::to_string)
                            .ok_or_else(|| {
                                SeedlingError::Xml(format!("unknown entity &{};", name))
                            })?
                    }
                };
                self.characters(&text)
            }
            _ => Ok(()),
        }
    }

    fn start<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError> {
        if self.skipping {
            return Ok(());
        }
        match self.active {
            Some(HandlerKind::Record) => return self.record.on_start(reconciler, tag, attributes),
            Some(HandlerKind::Menuitem) => {
                return self.menuitem.on_start(reconciler, tag, attributes);
            }
            None => {}
        }
        match tag {
            TAG_ROOT => Ok(()),
            TAG_DATA => {
                let flags = self.block_flags(attributes)?;
                self.skipping = flags.skip;
                reconciler.open_block(flags);
                Ok(())
            }
            TAG_RECORD => self.activate(reconciler, HandlerKind::Record, tag, attributes),
            TAG_MENUITEM => self.activate(reconciler, HandlerKind::Menuitem, tag, attributes),
            other => {
                tracing::info!("Tag {} not supported", other);
                Ok(())
            }
        }
    }

    fn activate<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        kind: HandlerKind,
        tag: &str,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError> {
        self.active = Some(kind);
        match kind {
            HandlerKind::Record => self.record.on_start(reconciler, tag, attributes),
            HandlerKind::Menuitem => self.menuitem.on_start(reconciler, tag, attributes),
        }
    }

    fn block_flags(&self, attributes: &Attributes) -> Result<BlockFlags, SeedlingError> {
        let mut flags = BlockFlags {
            noupdate: attributes.flag(TAG_DATA, "noupdate")?,
            grouped: attributes.flag(TAG_DATA, "grouped")?,
            skip: false,
        };
        if let Some(depends) = attributes.non_empty("depends") {
            let missing: Vec<&str> = depends
                .split(',')
                .map(str::trim)
                .filter(|module| !module.is_empty() && !self.installed.contains(*module))
                .collect();
            if !missing.is_empty() {
                tracing::info!("Skipping data block, modules not installed: {}", missing.join(", "));
                flags.skip = true;
            }
        }
        if self.test_mode && attributes.flag(TAG_DATA, "skiptest")? {
            flags.skip = true;
        }
        Ok(flags)
    }

    fn characters(&mut self, text: &str) -> Result<(), SeedlingError> {
        if self.skipping {
            return Ok(());
        }
        match self.active {
            Some(HandlerKind::Record) => self.record.on_characters(text),
            Some(HandlerKind::Menuitem) => self.menuitem.on_characters(text),
            None => Ok(()),
        }
    }

    fn end<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
    ) -> Result<(), SeedlingError> {
        if self.skipping {
            if tag == TAG_DATA {
                self.skipping = false;
                reconciler.open_block(BlockFlags::default());
            }
            return Ok(());
        }
        if let Some(kind) = self.active {
            let next = match kind {
                HandlerKind::Record => self.record.on_end(reconciler, tag)?,
                HandlerKind::Menuitem => self.menuitem.on_end(reconciler, tag)?,
            };
            if next == Next::Release {
                self.active = None;
            }
            return Ok(());
        }
        if tag == TAG_DATA {
            reconciler.close_block()?;
        }
        Ok(())
    }
}

fn read_start(e: &BytesStart<'_>) -> Result<(String, Attributes), SeedlingError> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Attributes::new();
    for attr in e.attributes() {
        let attr = attr.map_err(xml_error)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value);
        let value = quick_xml::escape::unescape(&raw).map_err(xml_error)?;
        attributes.insert(&key, &value);
    }
    Ok((tag, attributes))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDef, FieldKind, ModelDef, Registry};
    use crate::store::MemoryStore;
    use crate::{DbId, FieldValue, ModuleState};

    fn registry() -> Registry {
        Registry::from_models([ModelDef::new("res.country")
            .with_field("name", FieldDef::new(FieldKind::Char))
            .with_field("code", FieldDef::new(FieldKind::Char))
            .with_field(
                "active",
                FieldDef::new(FieldKind::Boolean).default_value(FieldValue::Bool(true)),
            )])
    }

    fn load(store: &mut MemoryStore, dispatcher: &mut StreamingDispatcher, doc: &str) -> Result<(), SeedlingError> {
        let mut reconciler = Reconciler::new(store, "geo", ModuleState::ToInstall)?;
        dispatcher.parse_bytes(&mut reconciler, doc.as_bytes())?;
        reconciler.finish().map(|_| ())
    }

    fn installed() -> BTreeSet<String> {
        BTreeSet::from(["geo".to_string()])
    }

    #[test]
    fn records_are_created_and_root_tags_ignored() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        load(
            &mut store,
            &mut dispatcher,
            r#"<?xml version="1.0"?>
            <seedling>
              <comment>ignored</comment>
              <data>
                <record model="res.country" id="be">
                  <field name="name">Belgium &amp; co</field>
                  <field name="code">BE</field>
                </record>
              </data>
            </seedling>"#,
        )
        .expect("load");

        let records = store.browse("res.country", &[DbId(1)]).expect("browse");
        assert_eq!(records[0].get("name"), FieldValue::text("Belgium & co"));
        assert_eq!(records[0].get("code"), FieldValue::text("BE"));
    }

    #[test]
    fn unsupported_tag_in_record_reports_location() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        let err = load(
            &mut store,
            &mut dispatcher,
            r#"<seedling><data>
                <record model="res.country" id="be"><bogus/></record>
            </data></seedling>"#,
        )
        .expect_err("must fail");

        assert!(matches!(
            &err,
            SeedlingError::Document { state, source, .. }
                if state == "In tag record: model res.country with id be."
                    && matches!(**source, SeedlingError::Structural(_))
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        let err = load(
            &mut store,
            &mut dispatcher,
            r#"<seedling><data>
                <record model="res.country" id="be"><field name="code">BE</field></record>
                <record model="res.country" id="be"><field name="code">BE</field></record>
            </data></seedling>"#,
        )
        .expect_err("must fail");
        assert!(matches!(err.root_cause(), SeedlingError::DuplicateIdentity(_)));
    }

    #[test]
    fn update_flag_allows_redeclaration() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        load(
            &mut store,
            &mut dispatcher,
            r#"<seedling><data>
                <record model="res.country" id="be"><field name="code">BE</field></record>
                <record model="res.country" id="be" update="1"><field name="code">BEL</field></record>
            </data></seedling>"#,
        )
        .expect("load");
        assert_eq!(store.record_count("res.country"), 1);
    }

    #[test]
    fn blocks_with_missing_dependencies_are_skipped() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        load(
            &mut store,
            &mut dispatcher,
            r#"<seedling>
                <data depends="geo,sale">
                    <record model="res.country" id="be"><bogus/></record>
                </data>
                <data depends="geo">
                    <record model="res.country" id="fr"><field name="code">FR</field></record>
                </data>
            </seedling>"#,
        )
        .expect("load");
        assert_eq!(store.record_count("res.country"), 1);
    }

    #[test]
    fn skiptest_only_applies_in_test_mode() {
        let doc = r#"<seedling><data skiptest="1">
            <record model="res.country" id="be"><field name="code">BE</field></record>
        </data></seedling>"#;

        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed()).with_test_mode(true);
        load(&mut store, &mut dispatcher, doc).expect("load");
        assert_eq!(store.record_count("res.country"), 0);

        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        load(&mut store, &mut dispatcher, doc).expect("load");
        assert_eq!(store.record_count("res.country"), 1);
    }

    #[test]
    fn grouped_block_creates_in_one_call() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        load(
            &mut store,
            &mut dispatcher,
            r#"<seedling><data grouped="1">
                <record model="res.country" id="be"><field name="code">BE</field></record>
                <record model="res.country" id="fr"><field name="code">FR</field></record>
                <record model="res.country" id="nl"><field name="code">NL</field></record>
            </data></seedling>"#,
        )
        .expect("load");
        assert_eq!(store.record_count("res.country"), 3);
        assert_eq!(store.stats().create_calls, 1);
    }

    #[test]
    fn oversized_documents_are_rejected() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed()).with_max_document_size(8);
        let err = load(&mut store, &mut dispatcher, "<seedling></seedling>").expect_err("too big");
        assert!(matches!(err, SeedlingError::Structural(_)));
    }

    #[test]
    fn malformed_xml_is_fatal() {
        let mut store = MemoryStore::new(registry());
        let mut dispatcher = StreamingDispatcher::new(installed());
        let err = load(
            &mut store,
            &mut dispatcher,
            "<seedling><data></seedling>",
        )
        .expect_err("mismatched tags");
        assert!(matches!(err.root_cause(), SeedlingError::Xml(_)));
    }
}
