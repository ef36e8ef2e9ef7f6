//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.
//! The `run_*` functions do the work and return data; the `cmd_*` wrappers
//! print it as text or JSON.

use crate::config::Config;
use seedling_core::{LoadReport, ProvenanceRecord, SeedlingError, Session};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// =============================================================================
// PATH VALIDATION
// =============================================================================

/// Resolve a document path to a regular file.
///
/// Canonicalizing resolves `..` and symlinks and fails for missing paths.
fn validate_file_path(path: &Path) -> Result<PathBuf, SeedlingError> {
    let canonical = path.canonicalize().map_err(|e| {
        SeedlingError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(SeedlingError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Open the configured database with the configured registry.
pub fn open_session(config: &Config) -> Result<Session, SeedlingError> {
    Session::with_redb(&config.database, config.registry()?)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), SeedlingError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| SeedlingError::SerializationError(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create an empty database, replacing an existing one when forced.
pub fn run_init(config: &Config, force: bool) -> Result<(), SeedlingError> {
    let path = &config.database;
    if path.exists() {
        if !force {
            return Err(SeedlingError::Config(format!(
                "Database {} already exists. Use --force to overwrite.",
                path.display()
            )));
        }
        std::fs::remove_file(path).map_err(|e| {
            SeedlingError::IoError(format!("Cannot remove {}: {}", path.display(), e))
        })?;
    }
    open_session(config)?;
    tracing::info!("Initialized database {}", path.display());
    Ok(())
}

pub fn cmd_init(config: &Config, force: bool) -> Result<(), SeedlingError> {
    run_init(config, force)?;
    println!("Initialized empty database at {:?}", config.database);
    Ok(())
}

// =============================================================================
// LOAD COMMAND
// =============================================================================

/// Load `files` as the data of `module` and sweep its orphans.
pub fn run_load(
    config: &Config,
    module: &str,
    files: &[PathBuf],
) -> Result<LoadReport, SeedlingError> {
    if module.trim().is_empty() {
        return Err(SeedlingError::Config("module name is empty".to_string()));
    }
    let paths = files
        .iter()
        .map(|file| validate_file_path(file))
        .collect::<Result<Vec<_>, _>>()?;

    let mut session = open_session(config)?;
    session.load_files(module, &paths, config.load_options())
}

pub fn cmd_load(
    config: &Config,
    json_mode: bool,
    module: &str,
    files: &[PathBuf],
) -> Result<(), SeedlingError> {
    tracing::info!("Loading {} document(s) for module {}", files.len(), module);
    let report = run_load(config, module, files)?;

    if json_mode {
        return print_json(&report);
    }

    println!("Module {} loaded", report.module);
    println!("================");
    println!("Created:    {}", report.created);
    println!("Updated:    {}", report.updated);
    println!("Unchanged:  {}", report.unchanged);
    println!("Recreated:  {}", report.recreated);
    println!("Suppressed: {}", report.suppressed);

    if !report.preserved.is_empty() {
        println!();
        println!("Kept user changes:");
        for field in &report.preserved {
            println!("  {} ({}@{}): {}", field.symbolic_id, field.db_id, field.model, field.field);
        }
    }

    let sweep = &report.sweep;
    println!();
    println!("Orphans deleted: {}", sweep.deleted.len());
    for id in &sweep.deleted {
        println!("  {}", id);
    }
    for failure in &sweep.failed {
        let outcome = if failure.deactivated {
            "deactivated"
        } else {
            "kept"
        };
        println!(
            "  {} ({}@{}) {}: {}",
            failure.symbolic_id, failure.db_id, failure.model, outcome, failure.reason
        );
    }
    for id in &sweep.stale {
        println!("  {} kept: model no longer exists", id);
    }

    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Tracked id count per installed module.
pub fn run_status(config: &Config) -> Result<BTreeMap<String, usize>, SeedlingError> {
    let session = open_session(config)?;
    let mut modules = BTreeMap::new();
    for module in session.installed_modules()? {
        let tracked = session.provenance(&module)?.len();
        modules.insert(module, tracked);
    }
    Ok(modules)
}

pub fn cmd_status(config: &Config, json_mode: bool) -> Result<(), SeedlingError> {
    let modules = run_status(config)?;

    if json_mode {
        let output = serde_json::json!({
            "database": config.database.to_string_lossy(),
            "test_mode": config.test_mode,
            "modules": modules,
        });
        return print_json(&output);
    }

    println!("Seedling Status");
    println!("===============");
    println!("Database: {:?}", config.database);
    println!();
    if modules.is_empty() {
        println!("No modules installed");
    }
    for (module, tracked) in &modules {
        println!("{:<24} {} tracked ids", module, tracked);
    }

    Ok(())
}

// =============================================================================
// PROVENANCE COMMAND
// =============================================================================

pub fn run_provenance(config: &Config, module: &str) -> Result<Vec<ProvenanceRecord>, SeedlingError> {
    open_session(config)?.provenance(module)
}

pub fn cmd_provenance(config: &Config, json_mode: bool, module: &str) -> Result<(), SeedlingError> {
    let rows = run_provenance(config, module)?;

    if json_mode {
        let output: Vec<_> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "id": row.symbolic_id().to_string(),
                    "model": row.model,
                    "db_id": row.db_id,
                    "noupdate": row.noupdate,
                })
            })
            .collect();
        return print_json(&output);
    }

    if rows.is_empty() {
        println!("No ids tracked for module {}", module);
        return Ok(());
    }
    for row in &rows {
        let flag = if row.noupdate { " (noupdate)" } else { "" };
        println!(
            "{:<40} {}@{}{}",
            row.symbolic_id().to_string(),
            row.db_id,
            row.model,
            flag
        );
    }

    Ok(())
}

// =============================================================================
// MODELS COMMAND
// =============================================================================

pub fn cmd_models(config: &Config, json_mode: bool) -> Result<(), SeedlingError> {
    let registry = config.registry()?;

    if json_mode {
        return print_json(&registry);
    }

    for name in registry.known_models() {
        let model = registry.model(name)?;
        println!("{}", name);
        for (field, def) in &model.fields {
            match &def.relation {
                Some(relation) => println!("  {:<20} {:?} -> {}", field, def.kind, relation),
                None => println!("  {:<20} {:?}", field, def.kind),
            }
        }
    }

    Ok(())
}
