//! # Seedling
//!
//! Command-line front end of `seedling-core`: configuration loading and the
//! CLI commands. The binary in `main.rs` only sets up logging and dispatches.

pub mod cli;
pub mod config;

pub use config::Config;
