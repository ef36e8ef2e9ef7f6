//! # Menuitem Handler
//!
//! Shorthand for a `ui.menu` record:
//!
//! ```xml
//! <menuitem id="menu_partner" parent="menu_root" action="act_partner" sequence="10"/>
//! ```
//!
//! The action is looked up across the action subtypes; its name becomes the
//! default menu name, and its type and first view choose the default icon.

use super::{Attributes, Next, TagHandler};
use crate::expression::{self, EmptyEnvironment};
use crate::primitives::{
    ACTION_SUBTYPES, ICON_CALENDAR, ICON_FORM, ICON_GENERIC, ICON_GRAPH, ICON_LIST, ICON_REPORT,
    ICON_TREE, ICON_URL, ICON_WIZARD, MODEL_ACTION, MODEL_ACTION_REPORT, MODEL_ACTION_URL,
    MODEL_ACTION_WINDOW, MODEL_ACTION_WINDOW_VIEW, MODEL_ACTION_WIZARD, MODEL_ICON, MODEL_MENU,
    MODEL_VIEW, TAG_MENUITEM,
};
use crate::reconciler::Reconciler;
use crate::store::{Domain, ObjectStore, Operator, SearchOrder};
use crate::{DbId, FieldValue, FieldValueMap, Record, SeedlingError};

/// What a menu needs to know about its action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ActionInfo {
    name: FieldValue,
    /// Action type, e.g. `action.window`.
    kind: String,
    /// Icon configured on the action.
    icon: Option<String>,
    /// Type of the first view of a window action.
    view_type: Option<String>,
    field_childs: bool,
}

impl ActionInfo {
    /// Icon used when neither the menu nor the action names one.
    fn default_icon(&self) -> Option<&'static str> {
        match self.kind.as_str() {
            MODEL_ACTION_WIZARD => Some(ICON_WIZARD),
            MODEL_ACTION_REPORT => Some(ICON_REPORT),
            MODEL_ACTION_WINDOW => match self.view_type.as_deref() {
                Some("tree") if self.field_childs => Some(ICON_TREE),
                Some("tree") => Some(ICON_LIST),
                Some("form") => Some(ICON_FORM),
                Some("graph") => Some(ICON_GRAPH),
                Some("calendar") => Some(ICON_CALENDAR),
                _ => None,
            },
            MODEL_ACTION_URL => Some(ICON_URL),
            _ => Some(ICON_GENERIC),
        }
    }
}

/// Handler of `<menuitem>` units.
#[derive(Debug, Default)]
pub struct MenuitemHandler {
    symbolic_id: Option<String>,
    values: FieldValueMap,
}

impl MenuitemHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn build<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError> {
        self.symbolic_id = attributes.get("id").map(str::to_string);
        self.values = FieldValueMap::new();
        let id = attributes.require(TAG_MENUITEM, "id")?;

        if attributes.non_empty("groups").is_some() {
            return Err(SeedlingError::Structural(format!(
                "menuitem {}: please use separate records for groups",
                id
            )));
        }

        let mut values = FieldValueMap::new();
        for name in ["name", "icon"] {
            if let Some(value) = attributes.non_empty(name) {
                values.insert(name.to_string(), FieldValue::text(value));
            }
        }
        if let Some(sequence) = attributes.non_empty("sequence") {
            let sequence = sequence
                .trim()
                .parse()
                .map_err(|_| SeedlingError::InvalidAttribute {
                    tag: TAG_MENUITEM.to_string(),
                    attribute: "sequence".to_string(),
                    value: sequence.to_string(),
                })?;
            values.insert("sequence".to_string(), FieldValue::Int(sequence));
        }
        if let Some(active) = attributes.non_empty("active") {
            let active = expression::evaluate(active, &mut EmptyEnvironment)?;
            values.insert("active".to_string(), FieldValue::Bool(active.is_truthy()));
        }
        if let Some(parent) = attributes.non_empty("parent") {
            values.insert("parent".to_string(), FieldValue::Id(reconciler.resolve(parent)?));
        }

        let mut action_name = FieldValue::None;
        if let Some(action) = attributes.non_empty("action") {
            let action_id = reconciler.resolve(action)?;
            let info = lookup_action(reconciler.store(), action_id)?;

            values.insert(
                "action".to_string(),
                FieldValue::Reference(format!("{},{}", info.kind, action_id)),
            );
            if attributes.non_empty("icon").is_none() {
                let icon = info
                    .icon
                    .clone()
                    .or_else(|| info.default_icon().map(str::to_string));
                if let Some(icon) = icon {
                    values.insert("icon".to_string(), FieldValue::Text(icon));
                }
            }
            action_name = info.name;
        }

        if !values.get("name").is_some_and(FieldValue::is_truthy) {
            if !action_name.is_truthy() {
                return Err(SeedlingError::Structural(format!(
                    "menuitem {}: provide at least a 'name' or an 'action' attribute",
                    id
                )));
            }
            values.insert("name".to_string(), action_name);
        }

        self.values = values;
        Ok(())
    }
}

impl TagHandler for MenuitemHandler {
    fn on_start<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
        attributes: &Attributes,
    ) -> Result<(), SeedlingError> {
        if tag != TAG_MENUITEM {
            return Err(SeedlingError::Structural(format!(
                "Tags '{}' not supported inside tag menuitem.",
                tag
            )));
        }
        self.build(reconciler, attributes)
    }

    fn on_characters(&mut self, _text: &str) -> Result<(), SeedlingError> {
        Ok(())
    }

    fn on_end<S: ObjectStore>(
        &mut self,
        reconciler: &mut Reconciler<'_, S>,
        tag: &str,
    ) -> Result<Next, SeedlingError> {
        if tag != TAG_MENUITEM {
            return Ok(Next::Stay);
        }
        let id = self.symbolic_id.clone().unwrap_or_default();
        let values = std::mem::take(&mut self.values);
        reconciler.import_record(MODEL_MENU, values, &id)?;
        Ok(Next::Release)
    }

    fn current_state(&self) -> String {
        format!(
            "Tag menuitem with id: {}",
            self.symbolic_id.as_deref().unwrap_or("?")
        )
    }
}

// =============================================================================
// ACTION LOOKUP
// =============================================================================

fn first<S: ObjectStore + ?Sized>(
    store: &S,
    model: &str,
    id: DbId,
) -> Result<Option<Record>, SeedlingError> {
    if !store.registry().contains(model) {
        return Ok(None);
    }
    Ok(store.browse(model, &[id])?.into_iter().next())
}

/// Find the action behind `action_id`: a subtype record whose base action
/// has the matching type, else a generic action record.
fn lookup_action<S: ObjectStore + ?Sized>(
    store: &S,
    action_id: DbId,
) -> Result<ActionInfo, SeedlingError> {
    for subtype in ACTION_SUBTYPES {
        let Some(record) = first(store, subtype, action_id)? else {
            continue;
        };
        let Some(base_id) = record.get("action").as_id() else {
            continue;
        };
        let Some(base) = first(store, MODEL_ACTION, base_id)? else {
            continue;
        };
        if base.get("type").as_str() == Some(subtype) {
            return describe(store, &base, subtype, Some(action_id));
        }
    }

    let base = first(store, MODEL_ACTION, action_id)?.ok_or_else(|| {
        SeedlingError::UnresolvedReference(format!("action {} not found", action_id))
    })?;
    let kind = base.get("type").as_str().unwrap_or(MODEL_ACTION).to_string();
    describe(store, &base, &kind, None)
}

fn describe<S: ObjectStore + ?Sized>(
    store: &S,
    base: &Record,
    kind: &str,
    subtype_id: Option<DbId>,
) -> Result<ActionInfo, SeedlingError> {
    let icon = match base.get("icon").as_id() {
        Some(icon_id) => first(store, MODEL_ICON, icon_id)?
            .and_then(|icon| icon.get("name").as_str().map(str::to_string)),
        None => None,
    };

    let mut info = ActionInfo {
        name: base.get("name"),
        kind: kind.to_string(),
        icon,
        ..ActionInfo::default()
    };

    if let (MODEL_ACTION_WINDOW, Some(window_id)) = (kind, subtype_id)
        && let Some(view) = first_view(store, window_id)?
    {
        info.view_type = view.get("type").as_str().map(str::to_string);
        info.field_childs = view.get("field_childs").is_truthy();
    }
    Ok(info)
}

/// The lowest-sequence view of a window action; unsequenced views sort last.
fn first_view<S: ObjectStore + ?Sized>(
    store: &S,
    window_id: DbId,
) -> Result<Option<Record>, SeedlingError> {
    if !store.registry().contains(MODEL_ACTION_WINDOW_VIEW) {
        return Ok(None);
    }
    let domain = Domain::new().with("act_window", Operator::Eq, FieldValue::Id(window_id));
    let ids = store.search(MODEL_ACTION_WINDOW_VIEW, &domain, SearchOrder::IdAsc)?;
    let mut links = store.browse(MODEL_ACTION_WINDOW_VIEW, &ids)?;
    links.sort_by_key(|link| {
        let sequence = link.get("sequence").as_int();
        (sequence.is_none(), sequence, link.id)
    });

    for link in links {
        if let Some(view_id) = link.get("view").as_id()
            && let Some(view) = first(store, MODEL_VIEW, view_id)?
        {
            return Ok(Some(view));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::store::MemoryStore;
    use crate::ModuleState;

    fn values(pairs: &[(&str, FieldValue)]) -> FieldValueMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn declare_window_action(reconciler: &mut Reconciler<'_, MemoryStore>, field_childs: &str) {
        reconciler
            .import_record(
                MODEL_ACTION,
                values(&[
                    ("name", FieldValue::text("Partners")),
                    ("type", FieldValue::text(MODEL_ACTION_WINDOW)),
                ]),
                "act_partner_base",
            )
            .expect("action");
        let base = reconciler.resolve("act_partner_base").expect("base");
        reconciler
            .import_record(
                MODEL_ACTION_WINDOW,
                values(&[
                    ("action", FieldValue::Id(base)),
                    ("res_model", FieldValue::text("res.partner")),
                ]),
                "act_partner",
            )
            .expect("window");
        reconciler
            .import_record(
                MODEL_VIEW,
                values(&[
                    ("model", FieldValue::text("res.partner")),
                    ("type", FieldValue::text("tree")),
                    ("field_childs", FieldValue::text(field_childs)),
                ]),
                "partner_view_tree",
            )
            .expect("view");
        let window = reconciler.resolve("act_partner").expect("window");
        let view = reconciler.resolve("partner_view_tree").expect("view");
        reconciler
            .import_record(
                MODEL_ACTION_WINDOW_VIEW,
                values(&[
                    ("sequence", FieldValue::Int(10)),
                    ("act_window", FieldValue::Id(window)),
                    ("view", FieldValue::Id(view)),
                ]),
                "act_partner_view_tree",
            )
            .expect("window view");
    }

    fn menu(reconciler: &mut Reconciler<'_, MemoryStore>, attributes: &Attributes) -> Record {
        let mut handler = MenuitemHandler::new();
        TagHandler::on_start(&mut handler, reconciler, TAG_MENUITEM, attributes).expect("start");
        let next = TagHandler::on_end(&mut handler, reconciler, TAG_MENUITEM).expect("end");
        assert_eq!(next, Next::Release);

        let id = reconciler
            .resolve(attributes.get("id").expect("id"))
            .expect("menu");
        reconciler
            .store()
            .browse(MODEL_MENU, &[id])
            .expect("browse")
            .remove(0)
    }

    #[test]
    fn window_action_with_flat_tree_view_gets_list_icon() {
        let mut store = MemoryStore::new(Registry::builtin());
        let mut reconciler =
            Reconciler::new(&mut store, "party", ModuleState::ToInstall).expect("reconciler");
        declare_window_action(&mut reconciler, "");

        let record = menu(
            &mut reconciler,
            &Attributes::new()
                .with("id", "menu_partner")
                .with("action", "act_partner")
                .with("sequence", "5"),
        );
        assert_eq!(record.get("icon"), FieldValue::text(ICON_LIST));
        assert_eq!(record.get("name"), FieldValue::text("Partners"));
        assert_eq!(record.get("sequence"), FieldValue::Int(5));
        let window = reconciler.resolve("act_partner").expect("window");
        assert_eq!(
            record.get("action"),
            FieldValue::Reference(format!("{},{}", MODEL_ACTION_WINDOW, window))
        );
    }

    #[test]
    fn window_action_with_child_field_gets_tree_icon() {
        let mut store = MemoryStore::new(Registry::builtin());
        let mut reconciler =
            Reconciler::new(&mut store, "party", ModuleState::ToInstall).expect("reconciler");
        declare_window_action(&mut reconciler, "childs");

        let record = menu(
            &mut reconciler,
            &Attributes::new()
                .with("id", "menu_partner")
                .with("action", "act_partner"),
        );
        assert_eq!(record.get("icon"), FieldValue::text(ICON_TREE));
    }

    #[test]
    fn explicit_icon_and_name_win() {
        let mut store = MemoryStore::new(Registry::builtin());
        let mut reconciler =
            Reconciler::new(&mut store, "party", ModuleState::ToInstall).expect("reconciler");
        declare_window_action(&mut reconciler, "");

        let record = menu(
            &mut reconciler,
            &Attributes::new()
                .with("id", "menu_partner")
                .with("name", "Contacts")
                .with("icon", "star")
                .with("action", "act_partner"),
        );
        assert_eq!(record.get("icon"), FieldValue::text("star"));
        assert_eq!(record.get("name"), FieldValue::text("Contacts"));
    }

    #[test]
    fn default_icons_by_action_type() {
        let info = |kind: &str| ActionInfo {
            kind: kind.to_string(),
            ..ActionInfo::default()
        };
        assert_eq!(info(MODEL_ACTION_WIZARD).default_icon(), Some(ICON_WIZARD));
        assert_eq!(info(MODEL_ACTION_REPORT).default_icon(), Some(ICON_REPORT));
        assert_eq!(info(MODEL_ACTION_URL).default_icon(), Some(ICON_URL));
        assert_eq!(info(MODEL_ACTION).default_icon(), Some(ICON_GENERIC));
        let form = ActionInfo {
            view_type: Some("form".to_string()),
            ..info(MODEL_ACTION_WINDOW)
        };
        assert_eq!(form.default_icon(), Some(ICON_FORM));
    }

    #[test]
    fn groups_attribute_is_rejected() {
        let mut store = MemoryStore::new(Registry::builtin());
        let mut reconciler =
            Reconciler::new(&mut store, "party", ModuleState::ToInstall).expect("reconciler");
        let mut handler = MenuitemHandler::new();
        let result = TagHandler::on_start(
            &mut handler,
            &mut reconciler,
            TAG_MENUITEM,
            &Attributes::new()
                .with("id", "menu_x")
                .with("name", "X")
                .with("groups", "group_admin"),
        );
        assert!(matches!(result, Err(SeedlingError::Structural(_))));
    }

    #[test]
    fn name_or_action_is_required() {
        let mut store = MemoryStore::new(Registry::builtin());
        let mut reconciler =
            Reconciler::new(&mut store, "party", ModuleState::ToInstall).expect("reconciler");
        let mut handler = MenuitemHandler::new();
        let result = TagHandler::on_start(
            &mut handler,
            &mut reconciler,
            TAG_MENUITEM,
            &Attributes::new().with("id", "menu_x"),
        );
        assert!(matches!(result, Err(SeedlingError::Structural(_))));
    }
}
