//! # snapvault - Session Snapshot Store
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 apps/snapvault (THE BINARY)              │
//! │                                                          │
//! │  ┌─────────────┐   ┌─────────────┐   ┌───────────────┐  │
//! │  │    CLI      │   │  HTTP API   │   │ Retention     │  │
//! │  │   (clap)    │   │   (axum)    │   │ timer (tokio) │  │
//! │  └──────┬──────┘   └──────┬──────┘   └───────┬───────┘  │
//! │         └─────────────────┼──────────────────┘          │
//! │                           ▼                             │
//! │                  ┌────────────────┐                     │
//! │                  │ snapvault-core │                     │
//! │                  │  (THE LOGIC)   │                     │
//! │                  └────────────────┘                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! snapvault server --host 0.0.0.0 --port 8080
//! snapvault ingest -f extraction.json
//! snapvault select u1
//! snapvault resolve
//! ```

use clap::Parser;
use snapvault::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // SNAPVAULT_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("SNAPVAULT_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.verbose {
        "snapvault=debug,snapvault_core=debug,tower_http=debug"
    } else {
        "snapvault=info,snapvault_core=info,tower_http=debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // Logs go to stderr so JSON command output stays parseable.
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

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    eprintln!(
        r#"
  ┌─┐┌┐┌┌─┐┌─┐┬  ┬┌─┐┬ ┬┬  ┌┬┐
  └─┐│││├─┤├─┘└┐┌┘├─┤│ ││   │
  └─┘┘└┘┴ ┴┴   └┘ ┴ ┴└─┘┴─┘ ┴

  Session Snapshot Store v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
