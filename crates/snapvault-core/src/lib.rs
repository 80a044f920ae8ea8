//! # snapvault-core
//!
//! The idempotent session snapshot store - THE LOGIC.
//!
//! Turns a noisy, possibly duplicated, possibly concurrent stream of captured
//! browser-session extractions into a deduplicated, content-addressed history
//! per identity, with one atomically-updated "current" pointer per identity,
//! bounded retention, and a separate active-selection record for downstream
//! automation.
//!
//! ## Data Flow
//!
//! ```text
//! RawExtraction ─► Canonicalizer ─► ContentHash ─► SnapshotStore::put
//!                                                   └─► PointerStore::compare_and_swap
//!                                                        └─► retention::collect
//! ```
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies (pure Rust, blocking I/O)
//! - Canonicalization and hashing are pure functions
//! - Snapshots are write-once; the pointer is the only mutable record and it
//!   only moves by compare-and-swap

// =============================================================================
// MODULES
// =============================================================================

pub mod canonical;
pub mod hasher;
pub mod primitives;
pub mod retention;
pub mod selection;
pub mod store;
pub mod types;
pub mod vault;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{ContentHash, ErrorKind, IdentityId, ValidationError, VaultError};

// =============================================================================
// RE-EXPORTS: Canonicalization
// =============================================================================

pub use canonical::{
    CanonicalPolicy, CanonicalState, Canonicalizer, CredentialToken, RawCookie, RawExtraction,
};
pub use hasher::canonical_bytes;

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use store::{
    ActiveSelection, Backend, CasOutcome, CurrentPointer, FileStore, PointerStore, PutOutcome,
    RedbStore, SelectionStore, Snapshot, SnapshotStore, VaultStore, open_store,
};

// =============================================================================
// RE-EXPORTS: Ingestion, Retention, Selection
// =============================================================================

pub use retention::{RetentionPolicy, RetentionReport, plan_eviction};
pub use selection::SelectionRegistry;
pub use vault::{IngestReceipt, IngestStatus, Vault, VaultOptions};
