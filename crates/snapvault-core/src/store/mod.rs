//! # Store Module
//!
//! Durable records and the three store contracts:
//!
//! - [`SnapshotStore`]: write-once, content-addressed snapshots per identity
//! - [`PointerStore`]: one mutable "current" pointer per identity, moved by CAS
//! - [`SelectionStore`]: the single active-selection record
//!
//! Two backends implement all three:
//! - [`FileStore`]: the reference on-disk layout (JSON files, atomic renames)
//! - [`RedbStore`]: an embedded ACID key-value database
//!
//! Every method takes `&self`. Snapshot writes need no coordination and the
//! pointer is only ever moved through `compare_and_swap`, so a store can be
//! shared between threads (and, for the file backend, processes) as is.

mod file;
mod redb_store;

pub use file::FileStore;
pub use redb_store::RedbStore;

use crate::{CanonicalState, ContentHash, IdentityId, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// RECORDS
// =============================================================================

/// One immutable canonical state, stored once per distinct hash per identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub hash: ContentHash,
    pub identity_id: IdentityId,
    pub captured_at: DateTime<Utc>,
    pub canonical_state: CanonicalState,
}

impl Snapshot {
    /// Hash a canonical state and wrap it as a snapshot.
    pub fn seal(state: CanonicalState, captured_at: DateTime<Utc>) -> Result<Self, VaultError> {
        Ok(Self {
            hash: ContentHash::of(&state)?,
            identity_id: state.identity_id.clone(),
            captured_at,
            canonical_state: state,
        })
    }

    /// Check the record against its own hash and the identity it was read for.
    pub(crate) fn verify(&self, identity: &IdentityId, hash: &ContentHash) -> Result<(), VaultError> {
        let consistent = &self.identity_id == identity
            && &self.hash == hash
            && self.canonical_state.identity_id == *identity
            && hash.matches(&self.canonical_state)?;
        if !consistent {
            return Err(VaultError::CorruptSnapshot {
                identity: identity.clone(),
                hash: hash.clone(),
            });
        }
        Ok(())
    }
}

/// The "current" reference for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPointer {
    pub identity_id: IdentityId,
    pub hash: ContentHash,
    pub updated_at: DateTime<Utc>,
}

/// Which identity downstream automation should use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSelection {
    pub selected_identity_id: IdentityId,
    pub selected_at: DateTime<Utc>,
}

/// Result of a create-if-absent snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOutcome {
    /// `false` when a snapshot with this hash already existed.
    pub created: bool,
}

/// Result of a pointer compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasOutcome {
    /// `true` when the pointer now holds the requested hash.
    pub swapped: bool,
    /// The pointer as observed after the attempt.
    pub current: Option<CurrentPointer>,
}

// =============================================================================
// STORE TRAITS
// =============================================================================

/// Content-addressed, write-once snapshot storage namespaced per identity.
pub trait SnapshotStore {
    /// Create `snapshots/{identity}/{hash}` if absent.
    ///
    /// Writing an existing hash is a no-op returning `created = false`, also
    /// when a concurrent writer wins the race.
    fn put(&self, snapshot: &Snapshot) -> Result<PutOutcome, VaultError>;

    /// Fetch and verify one snapshot. Missing ⇒ `SnapshotNotFound`.
    fn get(&self, identity: &IdentityId, hash: &ContentHash) -> Result<Snapshot, VaultError>;

    /// Check presence without reading the payload.
    fn contains(&self, identity: &IdentityId, hash: &ContentHash) -> Result<bool, VaultError>;

    /// All snapshots of an identity, newest `captured_at` first.
    fn list(&self, identity: &IdentityId) -> Result<Vec<Snapshot>, VaultError>;

    /// Remove one snapshot. Returns whether anything was removed.
    ///
    /// Only the retention collector calls this.
    fn delete(&self, identity: &IdentityId, hash: &ContentHash) -> Result<bool, VaultError>;

    /// Every identity with at least one snapshot or a pointer, sorted.
    fn identities(&self) -> Result<Vec<IdentityId>, VaultError>;
}

/// The single mutable record per identity.
pub trait PointerStore {
    /// Read the pointer, `None` when the identity has no history yet.
    fn read(&self, identity: &IdentityId) -> Result<Option<CurrentPointer>, VaultError>;

    /// Move the pointer to `new` iff it currently holds `expected`
    /// (`None` = expect no pointer). Readers never see a partial write.
    fn compare_and_swap(
        &self,
        identity: &IdentityId,
        expected: Option<&ContentHash>,
        new: &ContentHash,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, VaultError>;
}

/// Storage for the active-selection record.
pub trait SelectionStore {
    fn load_selection(&self) -> Result<Option<ActiveSelection>, VaultError>;
    fn store_selection(&self, selection: &ActiveSelection) -> Result<(), VaultError>;
    fn clear_selection(&self) -> Result<bool, VaultError>;
}

/// A backend implementing every store contract.
pub trait VaultStore: SnapshotStore + PointerStore + SelectionStore + Send + Sync {
    /// Short backend name for logs and status output.
    fn backend_name(&self) -> &'static str;
}

/// Selectable storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// JSON files under the root directory; safe across processes.
    #[default]
    File,
    /// A single `vault.redb` database under the root directory.
    Redb,
}

impl Backend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Redb => "redb",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "redb" => Ok(Self::Redb),
            other => Err(VaultError::Storage(format!(
                "unknown backend {other:?} (expected \"file\" or \"redb\")"
            ))),
        }
    }
}

/// Open the selected backend rooted at `root`.
pub fn open_store(backend: Backend, root: &std::path::Path) -> Result<Box<dyn VaultStore>, VaultError> {
    Ok(match backend {
        Backend::File => Box::new(FileStore::open(root)?),
        Backend::Redb => Box::new(RedbStore::open(root.join("vault.redb"))?),
    })
}

/// Shared outcome of a CAS decision, used by both backends.
pub(crate) fn pointer_matches(current: Option<&CurrentPointer>, expected: Option<&ContentHash>) -> bool {
    current.map(|p| &p.hash) == expected
}

/// Newest first; equal timestamps fall back to hash order so listings are stable.
pub(crate) fn sort_newest_first(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| {
        b.captured_at
            .cmp(&a.captured_at)
            .then_with(|| a.hash.cmp(&b.hash))
    });
}

// =============================================================================
// TESTS
// =============================================================================
