//! # Seedling CLI Module
//!
//! This module implements the CLI interface for Seedling.
//!
//! ## Available Commands
//!
//! - `init` - Initialize a new database
//! - `load` - Load data documents for a module
//! - `status` - Show installed modules and tracked ids
//! - `provenance` - List the ids tracked for a module
//! - `models` - Show the model registry

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use seedling_core::SeedlingError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Seedling - module data loader
///
/// Loads declarative data documents into a database without clobbering
/// records that users edited since the last load.
#[derive(Parser, Debug)]
#[command(name = "seedling")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file [default: seedling.toml if present]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the database (overrides the configuration file)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Skip data blocks marked `skiptest`
    #[arg(long, global = true)]
    pub test_mode: bool,

    /// Output in JSON format (for programmatic access)
    #[arg(long = "json", global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Load data documents as the data of a module
    Load {
        /// Module owning the documents
        #[arg(short, long)]
        module: String,

        /// Documents, parsed in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show installed modules and tracked ids
    Status,

    /// List the ids tracked for a module
    Provenance {
        /// Module to inspect
        #[arg(short, long)]
        module: String,
    },

    /// Show the model registry
    Models,
}

impl Cli {
    /// The configuration file with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<Config, SeedlingError> {
        let mut config = Config::discover(self.config.as_deref())?;
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if self.test_mode {
            config.test_mode = true;
        }
        Ok(config)
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), SeedlingError> {
    let config = cli.resolve_config()?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&config, force),
        Some(Commands::Load { module, files }) => cmd_load(&config, json_mode, &module, &files),
        Some(Commands::Status) => cmd_status(&config, json_mode),
        Some(Commands::Provenance { module }) => cmd_provenance(&config, json_mode, &module),
        Some(Commands::Models) => cmd_models(&config, json_mode),
        None => {
            // No subcommand - show status by default
            cmd_status(&config, json_mode)
        }
    }
}
