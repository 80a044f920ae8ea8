//! # CLI Command Implementations

use super::CliError;
use crate::api::{self, AppState};
use crate::config::Config;
use serde::Serialize;
use snapvault_core::{
    ContentHash, IdentityId, PointerStore, RawExtraction, RetentionReport, ValidationError, Vault,
    VaultError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// INPUT FILES
// =============================================================================

/// Maximum input file size (10 MB). A single extraction is a few KB.
const MAX_INPUT_FILE_SIZE: u64 = 10 * 1024 * 1024;

fn validate_file_size(path: &Path, max_size: u64) -> Result<(), CliError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| CliError::Io(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(CliError::Input(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve symlinks and `..`, and require a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, CliError> {
    let canonical = path.canonicalize().map_err(|e| {
        CliError::Io(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(CliError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Read one extraction object, or an array of them.
pub fn read_extractions(path: &Path) -> Result<Vec<RawExtraction>, CliError> {
    let path = validate_file_path(path)?;
    validate_file_size(&path, MAX_INPUT_FILE_SIZE)?;

    let content = std::fs::read_to_string(&path)
        .map_err(|e| CliError::Io(format!("Failed to read file: {}", e)))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| CliError::Input(e.to_string()))?;

    let parsed = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<RawExtraction>, _>>(),
        other => serde_json::from_value(other).map(|raw| vec![raw]),
    };
    parsed.map_err(|e| CliError::Input(e.to_string()))
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

fn parse_identity(raw: &str) -> Result<IdentityId, CliError> {
    IdentityId::new(raw).map_err(|e| CliError::Vault(e.into()))
}

/// The identity an extraction is ingested under: the flag, else its own hint.
fn identity_for(flag: Option<&str>, raw: &RawExtraction) -> Result<IdentityId, CliError> {
    match flag.or(raw.user_id.as_deref()) {
        Some(id) => parse_identity(id.trim()),
        None => Err(CliError::Vault(
            ValidationError::MissingIdentity.into(),
        )),
    }
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

pub async fn cmd_server(config: &Config, host: &str, port: u16) -> Result<(), CliError> {
    let vault = config.open_vault()?;
    let retention = config.retention_interval();

    println!("snapvault Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:      {}", host);
    println!("  Port:      {}", port);
    println!("  Backend:   {}", config.store.backend);
    println!("  Root:      {}", config.store.root.display());
    match retention {
        Some(every) => println!("  Retention: every {}s", every.as_secs()),
        None => println!("  Retention: inline only"),
    }
    println!();
    println!("Endpoints:");
    println!("  POST /identities/{{id}}/extractions - Ingest an extraction");
    println!("  GET  /identities/{{id}}/history     - History");
    println!("  GET  /identities/{{id}}/current     - Current snapshot");
    println!("  PUT  /selection                   - Select active identity");
    println!("  GET  /selection/resolve           - Active canonical state");
    println!("  GET  /health                      - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", host, port);
    let state = AppState::new(vault, config.request_timeout());
    api::run_server(&addr, state, retention)
        .await
        .map_err(|e| CliError::Io(format!("Server error: {}", e)))
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

pub fn cmd_status(config: &Config, json_mode: bool) -> Result<(), CliError> {
    let vault = config.open_vault()?;
    let identities = vault.identities()?;
    let active = vault.active()?;
    let retention = vault.options().retention;

    if json_mode {
        let output = serde_json::json!({
            "root": config.store.root.to_string_lossy(),
            "backend": vault.backend_name(),
            "identities": identities.len(),
            "active": active.as_ref().map(|a| a.selected_identity_id.as_str()),
            "ttl_secs": retention.ttl.as_secs(),
            "max_versions": retention.max_versions,
        });
        print_json(&output);
        return Ok(());
    }

    println!("snapvault Status");
    println!("================");
    println!("Root:         {}", config.store.root.display());
    println!("Backend:      {}", vault.backend_name());
    println!();
    println!("Identities:   {}", identities.len());
    match &active {
        Some(a) => println!("Active:       {}", a.selected_identity_id),
        None => println!("Active:       (none)"),
    }
    println!("TTL:          {}s", retention.ttl.as_secs());
    println!("Max versions: {}", retention.max_versions);

    Ok(())
}

// =============================================================================
// INGEST / HASH COMMANDS
// =============================================================================

/// Ingest every extraction in `file`. Rejected entries are reported and
/// counted; the command fails if any were rejected.
pub fn cmd_ingest(
    config: &Config,
    json_mode: bool,
    file: &Path,
    identity: Option<&str>,
) -> Result<(), CliError> {
    let extractions = read_extractions(file)?;
    let vault = config.open_vault()?;

    let mut receipts = Vec::with_capacity(extractions.len());
    let mut rejected = 0usize;

    for (index, raw) in extractions.iter().enumerate() {
        let outcome = identity_for(identity, raw)
            .and_then(|id| vault.ingest(&id, raw).map(|r| (id, r)).map_err(CliError::from));
        match outcome {
            Ok((id, receipt)) => {
                if !json_mode {
                    println!(
                        "[{}] {} {} {}",
                        index,
                        id,
                        receipt.status.as_str(),
                        receipt.hash.short()
                    );
                }
                receipts.push(serde_json::json!({
                    "index": index,
                    "identityId": id,
                    "receipt": receipt,
                }));
            }
            Err(e) => {
                rejected += 1;
                tracing::warn!(index, error = %e, "Extraction rejected");
                receipts.push(serde_json::json!({
                    "index": index,
                    "error": e.to_string(),
                }));
            }
        }
    }

    if json_mode {
        print_json(&receipts);
    } else {
        println!();
        println!(
            "Processed {} extraction(s), {} rejected",
            extractions.len(),
            rejected
        );
    }

    if rejected > 0 {
        return Err(CliError::Input(format!(
            "{} of {} extraction(s) rejected",
            rejected,
            extractions.len()
        )));
    }
    Ok(())
}

/// Canonicalize and hash without touching the store.
pub fn cmd_hash(config: &Config, json_mode: bool, file: &Path) -> Result<(), CliError> {
    let canonicalizer = config.canonicalizer()?;
    let extractions = read_extractions(file)?;

    let mut rows = Vec::with_capacity(extractions.len());
    for raw in &extractions {
        let state = canonicalizer
            .canonicalize(raw)
            .map_err(|e| CliError::Vault(e.into()))?;
        let hash = ContentHash::of(&state)?;
        if !json_mode {
            println!("{}  {}", hash, state.identity_id);
        }
        rows.push(serde_json::json!({
            "identityId": state.identity_id,
            "hash": hash,
            "credentials": state.credentials.len(),
        }));
    }

    if json_mode {
        print_json(&rows);
    }
    Ok(())
}

// =============================================================================
// INSPECTION COMMANDS
// =============================================================================

pub fn cmd_identities(config: &Config, json_mode: bool) -> Result<(), CliError> {
    let identities = config.open_vault()?.identities()?;
    if json_mode {
        print_json(&identities);
    } else {
        for id in &identities {
            println!("{}", id);
        }
    }
    Ok(())
}

pub fn cmd_history(config: &Config, json_mode: bool, identity: &str) -> Result<(), CliError> {
    let identity = parse_identity(identity)?;
    let vault = config.open_vault()?;
    let history = vault.list_history(&identity)?;
    let current = vault.store().read(&identity)?;

    if json_mode {
        print_json(&history);
        return Ok(());
    }

    println!("History for {} ({} snapshot(s))", identity, history.len());
    for snapshot in &history {
        let marker = match &current {
            Some(p) if p.hash == snapshot.hash => "*",
            _ => " ",
        };
        println!(
            "{} {}  {}  {} credential(s)",
            marker,
            snapshot.hash.short(),
            snapshot.captured_at.to_rfc3339(),
            snapshot.canonical_state.credentials.len()
        );
    }
    Ok(())
}

pub fn cmd_current(config: &Config, json_mode: bool, identity: &str) -> Result<(), CliError> {
    let identity = parse_identity(identity)?;
    let Some((pointer, snapshot)) = config.open_vault()?.current(&identity)? else {
        return Err(VaultError::IdentityNotFound(identity).into());
    };

    if json_mode {
        print_json(&serde_json::json!({ "pointer": pointer, "snapshot": snapshot }));
        return Ok(());
    }

    println!("Identity:    {}", pointer.identity_id);
    println!("Hash:        {}", pointer.hash);
    println!("Updated:     {}", pointer.updated_at.to_rfc3339());
    println!("Captured:    {}", snapshot.captured_at.to_rfc3339());
    println!("Credentials: {}", snapshot.canonical_state.credentials.len());
    Ok(())
}

// =============================================================================
// SELECTION COMMANDS
// =============================================================================

pub fn cmd_select(config: &Config, json_mode: bool, identity: &str) -> Result<(), CliError> {
    let identity = parse_identity(identity)?;
    let selection = config.open_vault()?.select_identity(&identity)?;
    if json_mode {
        print_json(&selection);
    } else {
        println!("Selected {}", selection.selected_identity_id);
    }
    Ok(())
}

pub fn cmd_active(config: &Config, json_mode: bool) -> Result<(), CliError> {
    let active = config.open_vault()?.active()?;
    if json_mode {
        print_json(&active);
        return Ok(());
    }
    match active {
        Some(a) => println!(
            "{} (since {})",
            a.selected_identity_id,
            a.selected_at.to_rfc3339()
        ),
        None => println!("No active identity"),
    }
    Ok(())
}

pub fn cmd_deselect(config: &Config, json_mode: bool) -> Result<(), CliError> {
    let cleared = config.open_vault()?.clear_selection()?;
    if json_mode {
        print_json(&serde_json::json!({ "cleared": cleared }));
    } else if cleared {
        println!("Selection cleared");
    } else {
        println!("No selection to clear");
    }
    Ok(())
}

/// Always JSON: the output is meant for automation.
pub fn cmd_resolve(config: &Config) -> Result<(), CliError> {
    let state = config.open_vault()?.resolve_active()?;
    print_json(&state);
    Ok(())
}

// =============================================================================
// GC COMMAND
// =============================================================================

fn run_gc(vault: &Vault, identity: Option<&IdentityId>) -> Result<Vec<RetentionReport>, CliError> {
    match identity {
        Some(id) => Ok(vec![vault.collect(id)?]),
        None => Ok(vault.collect_all()?),
    }
}

fn print_reports(reports: &[RetentionReport], json_mode: bool) {
    if json_mode {
        print_json(&reports);
        return;
    }
    for report in reports {
        let id = report
            .identity_id
            .as_ref()
            .map(|i| i.as_str())
            .unwrap_or("-");
        println!(
            "{}: examined {}, deleted {}, failed {}, protected {}",
            id,
            report.examined,
            report.deleted.len(),
            report.failed.len(),
            report.protected.len()
        );
    }
}

/// Run retention once, or every retention interval until Ctrl+C.
pub async fn cmd_gc(
    config: &Config,
    json_mode: bool,
    identity: Option<&str>,
    watch: bool,
) -> Result<(), CliError> {
    let identity = identity.map(parse_identity).transpose()?;
    let vault = Arc::new(config.open_vault()?);

    if !watch {
        let reports = run_gc(&vault, identity.as_ref())?;
        print_reports(&reports, json_mode);
        return Ok(());
    }

    let Some(every) = config.retention_interval() else {
        return Err(CliError::Input(
            "--watch needs retention.interval_secs > 0".to_string(),
        ));
    };
    tracing::info!(interval_secs = every.as_secs(), "Watching; Ctrl+C to stop");

    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let vault = vault.clone();
                let identity = identity.clone();
                let reports = tokio::task::spawn_blocking(move || run_gc(&vault, identity.as_ref()))
                    .await
                    .map_err(|e| CliError::Io(format!("Retention task failed: {}", e)))?;
                match reports {
                    Ok(reports) => print_reports(&reports, json_mode),
                    Err(e) => tracing::warn!(error = %e, "Retention pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping retention watch");
                return Ok(());
            }
        }
    }
}
