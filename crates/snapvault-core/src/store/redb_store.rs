//! # redb-backed Store
//!
//! All three store contracts in one embedded redb database.
//!
//! - Snapshots: `"{identity}/{hash}"` -> postcard-encoded [`Snapshot`]
//! - Pointers: `"{identity}"` -> postcard-encoded [`CurrentPointer`]
//! - Selection: `"active"` -> postcard-encoded [`ActiveSelection`]
//!
//! redb allows a single write transaction at a time, so the pointer CAS is a
//! read, compare and insert inside one write transaction. Snapshot puts use
//! the same mechanism to get create-if-absent semantics.
//!
//! The database file is locked by the opening process. Sharing one store
//! between processes requires the file backend.

use super::{
    ActiveSelection, CasOutcome, CurrentPointer, PointerStore, PutOutcome, SelectionStore,
    Snapshot, SnapshotStore, VaultStore, pointer_matches, sort_newest_first,
};
use crate::{ContentHash, IdentityId, VaultError};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// Table for snapshots: "identity/hash" -> serialized Snapshot bytes
const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Table for pointers: identity -> serialized CurrentPointer bytes
const POINTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("pointers");

/// Table for the active selection (single row).
const SELECTION: TableDefinition<&str, &[u8]> = TableDefinition::new("selection");

const SELECTION_KEY: &str = "active";

/// A snapshot store backed by a single redb file.
pub struct RedbStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn storage(e: impl Display) -> VaultError {
    VaultError::Storage(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, VaultError> {
    postcard::to_allocvec(value).map_err(|e| VaultError::Serialization(e.to_string()))
}

fn snapshot_key(identity: &IdentityId, hash: &ContentHash) -> String {
    format!("{}/{}", identity.as_str(), hash.as_str())
}

impl RedbStore {
    /// Open or create a store database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io(parent.display(), e))?;
        }
        let db = Database::create(&path).map_err(storage)?;

        // Initialize tables so read transactions never see a missing table.
        let write_txn = db.begin_write().map_err(storage)?;
        {
            let _ = write_txn.open_table(SNAPSHOTS).map_err(storage)?;
            let _ = write_txn.open_table(POINTERS).map_err(storage)?;
            let _ = write_txn.open_table(SELECTION).map_err(storage)?;
        }
        write_txn.commit().map_err(storage)?;

        Ok(Self { db, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

impl SnapshotStore for RedbStore {
    fn put(&self, snapshot: &Snapshot) -> Result<PutOutcome, VaultError> {
        let key = snapshot_key(&snapshot.identity_id, &snapshot.hash);
        let bytes = encode(snapshot)?;

        let write_txn = self.db.begin_write().map_err(storage)?;
        let created = {
            let mut table = write_txn.open_table(SNAPSHOTS).map_err(storage)?;
            let exists = table.get(key.as_str()).map_err(storage)?.is_some();
            if !exists {
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(storage)?;
            }
            !exists
        };

        if created {
            write_txn.commit().map_err(storage)?;
        } else {
            write_txn.abort().map_err(storage)?;
        }
        Ok(PutOutcome { created })
    }

    fn get(&self, identity: &IdentityId, hash: &ContentHash) -> Result<Snapshot, VaultError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(SNAPSHOTS).map_err(storage)?;
        let Some(guard) = table
            .get(snapshot_key(identity, hash).as_str())
            .map_err(storage)?
        else {
            return Err(VaultError::SnapshotNotFound {
                identity: identity.clone(),
                hash: hash.clone(),
            });
        };

        let snapshot: Snapshot =
            postcard::from_bytes(guard.value()).map_err(|_| VaultError::CorruptSnapshot {
                identity: identity.clone(),
                hash: hash.clone(),
            })?;
        snapshot.verify(identity, hash)?;
        Ok(snapshot)
    }

    fn contains(&self, identity: &IdentityId, hash: &ContentHash) -> Result<bool, VaultError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(SNAPSHOTS).map_err(storage)?;
        Ok(table
            .get(snapshot_key(identity, hash).as_str())
            .map_err(storage)?
            .is_some())
    }

    fn list(&self, identity: &IdentityId) -> Result<Vec<Snapshot>, VaultError> {
        let prefix = format!("{}/", identity.as_str());
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(SNAPSHOTS).map_err(storage)?;

        let mut snapshots = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(storage)? {
            let (key, value) = entry.map_err(storage)?;
            let Some(rest) = key.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            let decoded = ContentHash::parse(rest)
                .map_err(VaultError::from)
                .and_then(|hash| {
                    let snapshot: Snapshot = postcard::from_bytes(value.value())
                        .map_err(|e| VaultError::Serialization(e.to_string()))?;
                    snapshot.verify(identity, &hash)?;
                    Ok(snapshot)
                });
            match decoded {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(
                        identity = %identity,
                        key = key.value(),
                        error = %e,
                        "Skipping unreadable snapshot"
                    );
                }
            }
        }

        sort_newest_first(&mut snapshots);
        Ok(snapshots)
    }

    fn delete(&self, identity: &IdentityId, hash: &ContentHash) -> Result<bool, VaultError> {
        let key = snapshot_key(identity, hash);
        let write_txn = self.db.begin_write().map_err(storage)?;
        let removed = {
            let mut table = write_txn.open_table(SNAPSHOTS).map_err(storage)?;
            table.remove(key.as_str()).map_err(storage)?.is_some()
        };
        write_txn.commit().map_err(storage)?;
        Ok(removed)
    }

    fn identities(&self) -> Result<Vec<IdentityId>, VaultError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let mut found = BTreeSet::new();

        let snapshots = read_txn.open_table(SNAPSHOTS).map_err(storage)?;
        for entry in snapshots.iter().map_err(storage)? {
            let (key, _) = entry.map_err(storage)?;
            if let Some(id) = key
                .value()
                .split_once('/')
                .and_then(|(id, _)| IdentityId::new(id).ok())
            {
                found.insert(id);
            }
        }

        let pointers = read_txn.open_table(POINTERS).map_err(storage)?;
        for entry in pointers.iter().map_err(storage)? {
            let (key, _) = entry.map_err(storage)?;
            if let Ok(id) = IdentityId::new(key.value()) {
                found.insert(id);
            }
        }

        Ok(found.into_iter().collect())
    }
}

// =============================================================================
// POINTERS
// =============================================================================

impl PointerStore for RedbStore {
    fn read(&self, identity: &IdentityId) -> Result<Option<CurrentPointer>, VaultError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(POINTERS).map_err(storage)?;
        table
            .get(identity.as_str())
            .map_err(storage)?
            .map(|guard| {
                postcard::from_bytes(guard.value())
                    .map_err(|e| VaultError::Serialization(e.to_string()))
            })
            .transpose()
    }

    fn compare_and_swap(
        &self,
        identity: &IdentityId,
        expected: Option<&ContentHash>,
        new: &ContentHash,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, VaultError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        let outcome = {
            let mut table = write_txn.open_table(POINTERS).map_err(storage)?;
            let current: Option<CurrentPointer> = table
                .get(identity.as_str())
                .map_err(storage)?
                .map(|guard| {
                    postcard::from_bytes(guard.value())
                        .map_err(|e| VaultError::Serialization(e.to_string()))
                })
                .transpose()?;

            if pointer_matches(current.as_ref(), expected) {
                let pointer = CurrentPointer {
                    identity_id: identity.clone(),
                    hash: new.clone(),
                    updated_at: at,
                };
                let bytes = encode(&pointer)?;
                table
                    .insert(identity.as_str(), bytes.as_slice())
                    .map_err(storage)?;
                CasOutcome {
                    swapped: true,
                    current: Some(pointer),
                }
            } else {
                CasOutcome {
                    swapped: false,
                    current,
                }
            }
        };

        if outcome.swapped {
            write_txn.commit().map_err(storage)?;
        } else {
            write_txn.abort().map_err(storage)?;
        }
        Ok(outcome)
    }
}

// =============================================================================
// SELECTION
// =============================================================================

impl SelectionStore for RedbStore {
    fn load_selection(&self) -> Result<Option<ActiveSelection>, VaultError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(SELECTION).map_err(storage)?;
        table
            .get(SELECTION_KEY)
            .map_err(storage)?
            .map(|guard| {
                postcard::from_bytes(guard.value())
                    .map_err(|e| VaultError::Serialization(e.to_string()))
            })
            .transpose()
    }

    fn store_selection(&self, selection: &ActiveSelection) -> Result<(), VaultError> {
        let bytes = encode(selection)?;
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(SELECTION).map_err(storage)?;
            table
                .insert(SELECTION_KEY, bytes.as_slice())
                .map_err(storage)?;
        }
        write_txn.commit().map_err(storage)
    }

    fn clear_selection(&self) -> Result<bool, VaultError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        let removed = {
            let mut table = write_txn.open_table(SELECTION).map_err(storage)?;
            table.remove(SELECTION_KEY).map_err(storage)?.is_some()
        };
        write_txn.commit().map_err(storage)?;
        Ok(removed)
    }
}

impl VaultStore for RedbStore {
    fn backend_name(&self) -> &'static str {
        "redb"
    }
}

// =============================================================================
// TESTS
// =============================================================================
