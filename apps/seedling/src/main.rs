//! # Seedling - Module Data Loader
//!
//! The main binary for the Seedling reconciliation engine.
//!
//! ## Usage
//!
//! ```bash
//! # Create the database named in seedling.toml
//! seedling init
//!
//! # Install or upgrade a module from its data documents
//! seedling load -m geo data/countries.xml data/menus.xml
//!
//! # Inspect what is tracked
//! seedling status
//! seedling provenance -m geo --json
//! ```

use clap::Parser;
use seedling::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // Parse CLI arguments
    let cli = cli::Cli::parse();

    // Initialize tracing - SEEDLING_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("SEEDLING_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let default_filter = if cli.verbose {
        "seedling=debug,seedling_core=debug"
    } else {
        "seedling=info,seedling_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    // Display startup banner
    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    // Execute command
    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Seedling startup banner.
fn print_banner() {
    println!(
        r#"
  seedling v{}
  declarative module data, user edits kept
"#,
        env!("CARGO_PKG_VERSION")
    );
}
