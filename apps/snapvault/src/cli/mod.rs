//! # snapvault CLI Module
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server
//! - `status` - Show store configuration and identity counts
//! - `ingest` - Ingest raw extractions from a JSON file
//! - `hash` - Print the content hash of an extraction without storing it
//! - `identities` - List known identities
//! - `history` - List an identity's snapshots, newest first
//! - `current` - Show an identity's current snapshot
//! - `select` / `active` / `deselect` - Manage the active identity
//! - `resolve` - Print the active identity's canonical state
//! - `gc` - Run retention once, or on a timer with `--watch`

mod commands;

use crate::config::{Config, ConfigError, DEFAULT_CONFIG_FILE};
use clap::{Parser, Subcommand};
use snapvault_core::VaultError;
use std::path::PathBuf;
use thiserror::Error;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// snapvault - idempotent session snapshot store
///
/// Deduplicates captured browser-session extractions into a content-addressed
/// history per identity with one atomically-updated current pointer.
#[derive(Parser, Debug)]
#[command(name = "snapvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML config file
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Store root directory (overrides config and SNAPVAULT_ROOT)
    #[arg(short = 'R', long, global = true)]
    pub root: Option<PathBuf>,

    /// Storage backend: "file" (JSON files) or "redb" (embedded database)
    #[arg(short = 'B', long, global = true)]
    pub backend: Option<String>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Show store configuration and identity counts
    Status,

    /// Ingest raw extractions from a JSON file (one object or an array)
    Ingest {
        /// Path to the input file
        #[arg(short, long)]
        file: PathBuf,

        /// Identity to ingest under; defaults to each payload's own hint
        #[arg(short, long)]
        identity: Option<String>,
    },

    /// Print the content hash of an extraction without storing it
    Hash {
        /// Path to the input file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List known identities
    Identities,

    /// List an identity's snapshots, newest first
    History {
        /// Identity to inspect
        identity: String,
    },

    /// Show an identity's current snapshot
    Current {
        /// Identity to inspect
        identity: String,
    },

    /// Select the identity downstream automation should use
    Select {
        /// Identity to select
        identity: String,
    },

    /// Show the active selection
    Active,

    /// Clear the active selection
    Deselect,

    /// Print the active identity's canonical state
    Resolve,

    /// Run retention
    Gc {
        /// Limit the pass to one identity
        #[arg(short, long)]
        identity: Option<String>,

        /// Keep running on the configured retention interval
        #[arg(short, long)]
        watch: bool,
    },
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("{0}")]
    Io(String),

    #[error("invalid input: {0}")]
    Input(String),
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Resolve configuration: file, then environment, then flags.
pub fn resolve_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(&cli.config)?;
    config.apply_env()?;
    config.apply_overrides(cli.root.clone(), cli.backend.clone())?;
    Ok(config)
}

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let config = resolve_config(&cli)?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(&config, &host, port).await,
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Ingest { file, identity }) => {
            cmd_ingest(&config, json_mode, &file, identity.as_deref())
        }
        Some(Commands::Hash { file }) => cmd_hash(&config, json_mode, &file),
        Some(Commands::Identities) => cmd_identities(&config, json_mode),
        Some(Commands::History { identity }) => cmd_history(&config, json_mode, &identity),
        Some(Commands::Current { identity }) => cmd_current(&config, json_mode, &identity),
        Some(Commands::Select { identity }) => cmd_select(&config, json_mode, &identity),
        Some(Commands::Active) => cmd_active(&config, json_mode),
        Some(Commands::Deselect) => cmd_deselect(&config, json_mode),
        Some(Commands::Resolve) => cmd_resolve(&config),
        Some(Commands::Gc { identity, watch }) => {
            cmd_gc(&config, json_mode, identity.as_deref(), watch).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "snapvault",
            "history",
            "u1",
            "--backend",
            "redb",
            "--json-mode",
        ])
        .unwrap();
        assert!(cli.json_mode);
        assert_eq!(cli.backend.as_deref(), Some("redb"));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(matches!(cli.command, Some(Commands::History { identity }) if identity == "u1"));
    }

    #[test]
    fn gc_watch_flag() {
        let cli = Cli::try_parse_from(["snapvault", "gc", "--watch"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Gc {
                identity: None,
                watch: true
            })
        ));
    }

    #[test]
    fn flags_override_config_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cli = Cli::try_parse_from([
            "snapvault",
            "--config",
            tmp.path().join("absent.toml").to_str().unwrap(),
            "--root",
            tmp.path().to_str().unwrap(),
            "status",
        ])
        .unwrap();
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.store.root, tmp.path());
    }
}
