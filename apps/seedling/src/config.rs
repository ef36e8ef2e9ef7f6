//! # Configuration
//!
//! The binary reads a TOML file (default `seedling.toml`):
//!
//! ```toml
//! database = "seedling.redb"
//! test_mode = false
//! max_document_size = 33554432
//!
//! [[models]]
//! name = "res.country"
//!
//! [models.fields.code]
//! kind = "char"
//!
//! [models.fields.active]
//! kind = "boolean"
//! default = { bool = true }
//! ```
//!
//! Declared models extend the builtin registry. Command-line flags override
//! file values.

use seedling_core::primitives::MAX_DOCUMENT_SIZE;
use seedling_core::{LoadOptions, ModelDef, Registry, SeedlingError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "seedling.toml";

/// Database used when neither the file nor `--database` names one.
pub const DEFAULT_DATABASE: &str = "seedling.redb";

/// Maximum configuration file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

fn default_max_document_size() -> u64 {
    MAX_DOCUMENT_SIZE
}

/// Parsed `seedling.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path of the redb database.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Skip `<data skiptest="1">` blocks.
    #[serde(default)]
    pub test_mode: bool,
    /// Largest accepted document, in bytes.
    #[serde(default = "default_max_document_size")]
    pub max_document_size: u64,
    /// Models added to the builtin registry.
    #[serde(default)]
    pub models: Vec<ModelDef>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            test_mode: false,
            max_document_size: MAX_DOCUMENT_SIZE,
            models: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, SeedlingError> {
        let config: Self =
            toml::from_str(text).map_err(|e| SeedlingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, SeedlingError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            SeedlingError::IoError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(SeedlingError::Config(format!(
                "{} has {} bytes, more than the limit of {} bytes",
                path.display(),
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            SeedlingError::IoError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Load `path` when given; otherwise the default file if it exists.
    pub fn discover(path: Option<&Path>) -> Result<Self, SeedlingError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::from_file(default)
                } else {
                    tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<(), SeedlingError> {
        if self.max_document_size == 0 {
            return Err(SeedlingError::Config(
                "max_document_size must be positive".to_string(),
            ));
        }
        if let Some(model) = self.models.iter().find(|model| model.name.trim().is_empty()) {
            return Err(SeedlingError::Config(format!(
                "model with fields {:?} has no name",
                model.fields.keys().collect::<Vec<_>>()
            )));
        }
        self.registry().map(|_| ())
    }

    /// The builtin registry extended with the configured models.
    pub fn registry(&self) -> Result<Registry, SeedlingError> {
        let registry = Registry::from_models(self.models.iter().cloned());
        registry.validate()?;
        Ok(registry)
    }

    #[must_use]
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            test_mode: self.test_mode,
            max_document_size: self.max_document_size,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use seedling_core::{FieldKind, FieldValue, OnDelete};

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").expect("parse");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn models_extend_the_builtin_registry() {
        let config = Config::from_toml(
            r#"
            database = "data/geo.redb"

            [[models]]
            name = "res.country"

            [models.fields.code]
            kind = "char"

            [models.fields.active]
            kind = "boolean"
            default = { bool = true }

            [[models]]
            name = "res.partner"

            [models.fields.country]
            kind = "many2one"
            relation = "res.country"
            on_delete = "restrict"
            "#,
        )
        .expect("parse");

        assert_eq!(config.database, PathBuf::from("data/geo.redb"));
        let registry = config.registry().expect("registry");
        assert!(registry.contains("ui.menu"));
        let country = registry.model("res.country").expect("model");
        assert_eq!(country.default_for("active").expect("default"), FieldValue::Bool(true));
        let partner = registry.model("res.partner").expect("model");
        let field = partner.field("country").expect("field");
        assert_eq!(field.kind, FieldKind::Many2One);
        assert_eq!(field.on_delete, OnDelete::Restrict);
    }

    #[test]
    fn dangling_relations_are_rejected() {
        let result = Config::from_toml(
            r#"
            [[models]]
            name = "res.partner"

            [models.fields.country]
            kind = "many2one"
            relation = "res.country"
            "#,
        );
        assert!(matches!(result, Err(SeedlingError::Config(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = Config::from_toml("databse = \"typo.redb\"");
        assert!(matches!(result, Err(SeedlingError::Config(_))));
    }

    #[test]
    fn zero_document_size_is_rejected() {
        let result = Config::from_toml("max_document_size = 0");
        assert!(matches!(result, Err(SeedlingError::Config(_))));
    }
}
