//! # File Backend
//!
//! The reference on-disk layout:
//!
//! ```text
//! {root}/snapshots/{identity}/{hash}.json   immutable Snapshot
//! {root}/current/{identity}.json            CurrentPointer, replaced atomically
//! {root}/current/{identity}.lock            advisory CAS lock, never removed
//! {root}/active-selection.json              ActiveSelection
//! ```
//!
//! ## Write Protocols
//!
//! - Snapshots: temp file in the target directory, then an atomic no-clobber
//!   publish. A writer that loses the race sees `AlreadyExists` and reports
//!   `created = false`.
//! - Pointers: under an exclusive advisory lock on the identity's lock file
//!   the pointer is re-read, compared, and replaced by temp-file + rename.
//!   Readers never take the lock and never observe a partial pointer.
//!
//! The lock is taken on a file every process sharing `root` opens, so the CAS
//! holds across processes, not just threads. Advisory locks are unreliable on
//! some network filesystems; keep `root` on local disk.

use super::{
    ActiveSelection, CasOutcome, CurrentPointer, PointerStore, PutOutcome, SelectionStore,
    Snapshot, SnapshotStore, VaultStore, pointer_matches, sort_newest_first,
};
use crate::primitives::{MAX_SNAPSHOT_FILE_SIZE, POINTER_LOCK_ATTEMPTS, POINTER_LOCK_SPIN_MILLIS};
use crate::{ContentHash, IdentityId, VaultError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

const SNAPSHOTS_DIR: &str = "snapshots";
const CURRENT_DIR: &str = "current";
const SELECTION_FILE: &str = "active-selection.json";

/// File-per-record store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, VaultError> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join(SNAPSHOTS_DIR), root.join(CURRENT_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| VaultError::io(dir.display(), e))?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, identity: &IdentityId) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(identity.as_str())
    }

    fn snapshot_path(&self, identity: &IdentityId, hash: &ContentHash) -> PathBuf {
        self.snapshot_dir(identity)
            .join(format!("{}.json", hash.as_str()))
    }

    fn pointer_path(&self, identity: &IdentityId) -> PathBuf {
        self.root
            .join(CURRENT_DIR)
            .join(format!("{}.json", identity.as_str()))
    }

    pub(crate) fn lock_path(&self, identity: &IdentityId) -> PathBuf {
        self.root
            .join(CURRENT_DIR)
            .join(format!("{}.lock", identity.as_str()))
    }

    fn selection_path(&self) -> PathBuf {
        self.root.join(SELECTION_FILE)
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

impl SnapshotStore for FileStore {
    fn put(&self, snapshot: &Snapshot) -> Result<PutOutcome, VaultError> {
        let dir = self.snapshot_dir(&snapshot.identity_id);
        let path = self.snapshot_path(&snapshot.identity_id, &snapshot.hash);

        if path
            .try_exists()
            .map_err(|e| VaultError::io(path.display(), e))?
        {
            return Ok(PutOutcome { created: false });
        }

        fs::create_dir_all(&dir).map_err(|e| VaultError::io(dir.display(), e))?;
        let temp = write_temp(&dir, snapshot)?;

        match temp.persist_noclobber(&path) {
            Ok(_) => Ok(PutOutcome { created: true }),
            // Lost the race to an identical writer: content-addressed, so fine.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(PutOutcome { created: false })
            }
            Err(e) => Err(VaultError::io(path.display(), e.error)),
        }
    }

    fn get(&self, identity: &IdentityId, hash: &ContentHash) -> Result<Snapshot, VaultError> {
        let path = self.snapshot_path(identity, hash);
        let Some(bytes) = read_bounded(&path)? else {
            return Err(VaultError::SnapshotNotFound {
                identity: identity.clone(),
                hash: hash.clone(),
            });
        };
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|_| VaultError::CorruptSnapshot {
                identity: identity.clone(),
                hash: hash.clone(),
            })?;
        snapshot.verify(identity, hash)?;
        Ok(snapshot)
    }

    fn contains(&self, identity: &IdentityId, hash: &ContentHash) -> Result<bool, VaultError> {
        let path = self.snapshot_path(identity, hash);
        path.try_exists()
            .map_err(|e| VaultError::io(path.display(), e))
    }

    fn list(&self, identity: &IdentityId) -> Result<Vec<Snapshot>, VaultError> {
        let dir = self.snapshot_dir(identity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io(dir.display(), e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::io(dir.display(), e))?;
            let name = entry.file_name();
            // Temp files and strays never parse as `{hash}.json`.
            let Some(hash) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|stem| ContentHash::parse(stem).ok())
            else {
                continue;
            };

            match self.get(identity, &hash) {
                Ok(snapshot) => snapshots.push(snapshot),
                // Deleted by a concurrent retention pass between readdir and read.
                Err(VaultError::SnapshotNotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(
                        identity = %identity,
                        hash = %hash.short(),
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
        let path = self.snapshot_path(identity, hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VaultError::io(path.display(), e)),
        }
    }

    fn identities(&self) -> Result<Vec<IdentityId>, VaultError> {
        let mut found = BTreeSet::new();

        let snapshots = self.root.join(SNAPSHOTS_DIR);
        for name in dir_names(&snapshots)? {
            if let Ok(id) = IdentityId::new(name) {
                found.insert(id);
            }
        }

        let current = self.root.join(CURRENT_DIR);
        for name in dir_names(&current)? {
            if let Some(id) = name
                .strip_suffix(".json")
                .and_then(|stem| IdentityId::new(stem).ok())
            {
                found.insert(id);
            }
        }

        Ok(found.into_iter().collect())
    }
}

// =============================================================================
// POINTERS
// =============================================================================

impl PointerStore for FileStore {
    fn read(&self, identity: &IdentityId) -> Result<Option<CurrentPointer>, VaultError> {
        read_json(&self.pointer_path(identity))
    }

    fn compare_and_swap(
        &self,
        identity: &IdentityId,
        expected: Option<&ContentHash>,
        new: &ContentHash,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, VaultError> {
        let Some(_guard) = PointerLock::acquire(&self.lock_path(identity))? else {
            tracing::debug!(identity = %identity, "Pointer lock busy, reporting lost swap");
            return Ok(CasOutcome {
                swapped: false,
                current: self.read(identity)?,
            });
        };

        let current = self.read(identity)?;
        if !pointer_matches(current.as_ref(), expected) {
            return Ok(CasOutcome {
                swapped: false,
                current,
            });
        }

        let pointer = CurrentPointer {
            identity_id: identity.clone(),
            hash: new.clone(),
            updated_at: at,
        };
        replace_json(&self.root.join(CURRENT_DIR), &self.pointer_path(identity), &pointer)?;

        Ok(CasOutcome {
            swapped: true,
            current: Some(pointer),
        })
    }
}

// =============================================================================
// SELECTION
// =============================================================================

impl SelectionStore for FileStore {
    fn load_selection(&self) -> Result<Option<ActiveSelection>, VaultError> {
        read_json(&self.selection_path())
    }

    fn store_selection(&self, selection: &ActiveSelection) -> Result<(), VaultError> {
        replace_json(&self.root, &self.selection_path(), selection)
    }

    fn clear_selection(&self) -> Result<bool, VaultError> {
        let path = self.selection_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VaultError::io(path.display(), e)),
        }
    }
}

impl VaultStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }
}

// =============================================================================
// POINTER LOCK
// =============================================================================

/// Exclusive per-identity guard held only around compare + rename.
///
/// An OS advisory lock on a long-lived `{identity}.lock` file. The file is
/// never deleted and the lock is never stolen; the kernel releases it when
/// the holder exits.
#[derive(Debug)]
struct PointerLock {
    file: File,
}

impl PointerLock {
    /// Try to take the lock a bounded number of times.
    ///
    /// `Ok(None)` means the lock stayed busy; callers treat it as a lost swap.
    fn acquire(path: &Path) -> Result<Option<Self>, VaultError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| VaultError::io(path.display(), e))?;

        for _ in 0..POINTER_LOCK_ATTEMPTS {
            match file.try_lock() {
                Ok(()) => return Ok(Some(Self { file })),
                Err(TryLockError::WouldBlock) => {
                    std::thread::sleep(Duration::from_millis(POINTER_LOCK_SPIN_MILLIS));
                }
                Err(TryLockError::Error(e)) => return Err(VaultError::io(path.display(), e)),
            }
        }
        Ok(None)
    }
}

impl Drop for PointerLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Serialize into a synced temp file inside `dir` (same filesystem as the target).
fn write_temp<T: Serialize>(dir: &Path, value: &T) -> Result<NamedTempFile, VaultError> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| VaultError::Serialization(e.to_string()))?;
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| VaultError::io(dir.display(), e))?;
    temp.write_all(&bytes)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| VaultError::io(temp.path().display(), e))?;
    Ok(temp)
}

/// Atomically replace `path` with the JSON encoding of `value`.
fn replace_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), VaultError> {
    let temp = write_temp(dir, value)?;
    temp.persist(path)
        .map_err(|e| VaultError::io(path.display(), e.error))?;
    Ok(())
}

/// Read a JSON record, `None` when the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, VaultError> {
    let Some(bytes) = read_bounded(path)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| VaultError::Serialization(format!("{}: {}", path.display(), e)))
}

/// Read a whole file, refusing anything larger than a snapshot can be.
fn read_bounded(path: &Path) -> Result<Option<Vec<u8>>, VaultError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VaultError::io(path.display(), e)),
    };
    if metadata.len() > MAX_SNAPSHOT_FILE_SIZE {
        return Err(VaultError::Storage(format!(
            "{}: {} bytes exceeds maximum {}",
            path.display(),
            metadata.len(),
            MAX_SNAPSHOT_FILE_SIZE
        )));
    }
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VaultError::io(path.display(), e)),
    }
}

/// File names in a directory; a missing directory is empty.
fn dir_names(dir: &Path) -> Result<Vec<String>, VaultError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VaultError::io(dir.display(), e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VaultError::io(dir.display(), e))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

// =============================================================================
// TESTS
// =============================================================================
