//! # Innate Primitives
//!
//! Hardcoded runtime constants for the Seedling engine.
//!
//! Documents carry the data; the tag vocabulary, the model names the
//! menu handler joins against, and the resource limits are fixed here.

// =============================================================================
// DOCUMENT VOCABULARY
// =============================================================================

/// Root element of a module data document.
pub const TAG_ROOT: &str = "seedling";

/// Block element grouping record declarations under shared flags.
pub const TAG_DATA: &str = "data";

/// Generic record declaration.
pub const TAG_RECORD: &str = "record";

/// Field value inside a record declaration.
pub const TAG_FIELD: &str = "field";

/// Menu entry shorthand.
pub const TAG_MENUITEM: &str = "menuitem";

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Magic bytes for the Seedling binary format header.
///
/// - File Header = Magic Bytes ("SEED") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"SEED";

/// Current serialization format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum size of a single document, in bytes (32 MB).
pub const MAX_DOCUMENT_SIZE: u64 = 32 * 1024 * 1024;

/// Maximum accumulated character data for one field (4 MB).
pub const MAX_FIELD_TEXT_LENGTH: usize = 4 * 1024 * 1024;

/// Number of records fetched per browse when warming the identity cache.
pub const BROWSE_SLICE_SIZE: usize = 1000;

/// Maximum nesting depth of a restricted expression.
pub const MAX_EXPRESSION_DEPTH: usize = 64;

// =============================================================================
// CONTEXT
// =============================================================================

/// Language every load runs under.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Activity flag field; models carrying it support soft deletion.
pub const ACTIVE_FIELD: &str = "active";

/// Suffix of an unset reference as stored by older releases.
pub const LEGACY_REFERENCE_SENTINEL_SUFFIX: &str = ",0";

// =============================================================================
// MENU MODELS
// =============================================================================

pub const MODEL_MENU: &str = "ui.menu";
pub const MODEL_ACTION: &str = "action";
pub const MODEL_ACTION_REPORT: &str = "action.report";
pub const MODEL_ACTION_WINDOW: &str = "action.window";
pub const MODEL_ACTION_WIZARD: &str = "action.wizard";
pub const MODEL_ACTION_URL: &str = "action.url";
pub const MODEL_ACTION_WINDOW_VIEW: &str = "action.window.view";
pub const MODEL_VIEW: &str = "ui.view";
pub const MODEL_ICON: &str = "ui.icon";

/// Action subtypes searched, in order, when a menu names an action.
pub const ACTION_SUBTYPES: [&str; 4] = [
    MODEL_ACTION_REPORT,
    MODEL_ACTION_WINDOW,
    MODEL_ACTION_WIZARD,
    MODEL_ACTION_URL,
];

// =============================================================================
// DEFAULT MENU ICONS
// =============================================================================

pub const ICON_WIZARD: &str = "executable";
pub const ICON_REPORT: &str = "print";
pub const ICON_TREE: &str = "tree";
pub const ICON_LIST: &str = "list";
pub const ICON_FORM: &str = "new-record";
pub const ICON_GRAPH: &str = "graph";
pub const ICON_CALENDAR: &str = "calendar";
pub const ICON_URL: &str = "browser";
pub const ICON_GENERIC: &str = "new";
