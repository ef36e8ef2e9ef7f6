//! # Property-Based Tests
//!
//! Invariants of module loads checked with proptest:
//! reloads are write-free, batching never changes outcomes, and markup
//! without placeholders passes through untouched.

use proptest::collection::vec;
use proptest::prelude::*;
use seedling_core::handlers::record::substitute_placeholders;
use seedling_core::{
    FieldDef, FieldKind, FieldValueMap, LoadOptions, ModelDef, Registry, SeedlingError, Session,
};

// =============================================================================
// HELPERS
// =============================================================================

fn registry() -> Registry {
    Registry::from_models([ModelDef::new("res.partner")
        .with_field("name", FieldDef::new(FieldKind::Char))
        .with_field("priority", FieldDef::new(FieldKind::Integer))])
}

/// A document declaring one partner per `(name, priority)` pair.
fn document(partners: &[(String, i64)], grouped: bool) -> String {
    let mut xml = String::from("<seedling>");
    xml.push_str(if grouped { "<data grouped=\"1\">" } else { "<data>" });
    for (index, (name, priority)) in partners.iter().enumerate() {
        xml.push_str(&format!(
            "<record model=\"res.partner\" id=\"p{}\">\
             <field name=\"name\">{}</field>\
             <field name=\"priority\">{}</field>\
             </record>",
            index, name, priority
        ));
    }
    xml.push_str("</data></seedling>");
    xml
}

fn load(session: &mut Session, xml: &str) -> Result<(), SeedlingError> {
    session.load_module("crm", &[xml.as_bytes()], LoadOptions::default())?;
    Ok(())
}

fn snapshot(session: &Session) -> Vec<(String, FieldValueMap)> {
    let mut rows = Vec::new();
    for row in session.provenance("crm").expect("provenance") {
        let records = session
            .store()
            .browse(&row.model, &[row.db_id])
            .expect("browse");
        for record in records {
            rows.push((row.local_id.clone(), record.values));
        }
    }
    rows
}

fn partners() -> impl Strategy<Value = Vec<(String, i64)>> {
    vec(("[a-z]{1,8}", 0i64..1000), 1..20)
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Loading the same documents twice performs no record writes the second time.
    #[test]
    fn reload_is_idempotent(partners in partners()) {
        let xml = document(&partners, false);
        let mut session = Session::new(registry());
        load(&mut session, &xml).expect("install");
        let before = snapshot(&session);

        session.reset_stats();
        load(&mut session, &xml).expect("reload");

        prop_assert_eq!(session.stats().mutating_calls(), 0);
        prop_assert_eq!(snapshot(&session), before);
    }

    /// Grouped and ungrouped blocks converge to the same records.
    #[test]
    fn grouped_loads_match_ungrouped_loads(
        first in partners(),
        second in partners(),
    ) {
        let mut plain = Session::new(registry());
        let mut batched = Session::new(registry());

        load(&mut plain, &document(&first, false)).expect("plain install");
        load(&mut batched, &document(&first, true)).expect("grouped install");
        prop_assert_eq!(snapshot(&plain), snapshot(&batched));

        load(&mut plain, &document(&second, false)).expect("plain upgrade");
        load(&mut batched, &document(&second, true)).expect("grouped upgrade");
        prop_assert_eq!(snapshot(&plain), snapshot(&batched));
    }

    /// Markup without placeholders is returned unchanged.
    #[test]
    fn text_without_placeholders_is_unchanged(text in "[a-zA-Z0-9 %<>/=\"]{0,64}") {
        let out = substitute_placeholders(&text, |id| {
            Err(SeedlingError::UnresolvedReference(id.to_string()))
        })
        .expect("nothing to resolve");
        prop_assert_eq!(out, text);
    }

    /// An escaped percent sign never starts a placeholder.
    #[test]
    fn escaped_percent_is_never_substituted(id in "[a-z_]{1,12}") {
        let text = format!("%%({})d", id);
        let out = substitute_placeholders(&text, |id| {
            Err(SeedlingError::UnresolvedReference(id.to_string()))
        })
        .expect("nothing to resolve");
        prop_assert_eq!(out, text);
    }
}
