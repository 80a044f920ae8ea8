//! # Vault
//!
//! The ingestion protocol and the automation read interface over one store.
//!
//! ## Ingest
//!
//! ```text
//! raw ─► canonicalize ─► hash ─┬─ == pointer ──────────────► unchanged
//!                              ├─ older than current ─ put ─► superseded
//!                              └─ put ─► CAS(prev, new) ─┬─► stored ─► retention
//!                                            ▲           │
//!                                            └─ re-read ◄┘ lost (bounded)
//! ```
//!
//! A lost CAS retries the whole sequence from a fresh pointer read. When the
//! retries run out the caller gets `Conflict`; the snapshot written on the
//! way stays addressable by its hash.

use crate::primitives::{CAS_BACKOFF_MILLIS, DEFAULT_CAS_RETRIES};
use crate::retention::{self, RetentionPolicy, RetentionReport};
use crate::selection::SelectionRegistry;
use crate::store::{
    ActiveSelection, Backend, CurrentPointer, PointerStore, Snapshot, SnapshotStore, open_store,
};
use crate::{
    CanonicalState, Canonicalizer, ContentHash, IdentityId, RawExtraction, VaultError, VaultStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for a [`Vault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultOptions {
    pub retention: RetentionPolicy,
    /// Read-put-CAS attempts before `Conflict`.
    pub cas_retries: u32,
    /// Run a retention pass after every `stored` ingest.
    pub inline_retention: bool,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            cas_retries: DEFAULT_CAS_RETRIES,
            inline_retention: true,
        }
    }
}

/// Outcome class of a successful ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    /// Same canonical state as the current pointer; nothing written.
    Unchanged,
    /// New snapshot is now current.
    Stored,
    /// Stored, but older than the current snapshot; pointer left alone.
    Superseded,
}

impl IngestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Stored => "stored",
            Self::Superseded => "superseded",
        }
    }
}

/// Result of [`Vault::ingest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub status: IngestStatus,
    pub hash: ContentHash,
    /// Whether this call created the snapshot file/record.
    pub created: bool,
    /// Read-put-CAS attempts used.
    pub attempts: u32,
}

/// Snapshot store, pointer store and selection registry behind one handle.
pub struct Vault {
    store: Box<dyn VaultStore>,
    canonicalizer: Canonicalizer,
    options: VaultOptions,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("backend", &self.store.backend_name())
            .field("canonicalizer", &self.canonicalizer)
            .field("options", &self.options)
            .finish()
    }
}

impl Vault {
    /// Wrap an already opened store.
    pub fn new(
        store: impl VaultStore + 'static,
        canonicalizer: Canonicalizer,
        options: VaultOptions,
    ) -> Self {
        Self::from_boxed(Box::new(store), canonicalizer, options)
    }

    /// Open the selected backend under `root`.
    pub fn open(
        backend: Backend,
        root: impl AsRef<Path>,
        canonicalizer: Canonicalizer,
        options: VaultOptions,
    ) -> Result<Self, VaultError> {
        let store = open_store(backend, root.as_ref())?;
        Ok(Self::from_boxed(store, canonicalizer, options))
    }

    fn from_boxed(
        store: Box<dyn VaultStore>,
        canonicalizer: Canonicalizer,
        options: VaultOptions,
    ) -> Self {
        Self {
            store,
            canonicalizer,
            options,
        }
    }

    #[must_use]
    pub fn store(&self) -> &dyn VaultStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    // =========================================================================
    // INGESTION
    // =========================================================================

    /// Canonicalize, dedupe and record one raw extraction for `identity`.
    pub fn ingest(
        &self,
        identity: &IdentityId,
        raw: &RawExtraction,
    ) -> Result<IngestReceipt, VaultError> {
        let state = self.canonicalizer.canonicalize_for(identity, raw)?;
        let captured_at = raw.captured_at.unwrap_or_else(Utc::now);
        let snapshot = Snapshot::seal(state, captured_at)?;
        let max_attempts = self.options.cas_retries.max(1);

        for attempt in 1..=max_attempts {
            let current = self.store.read(identity)?;

            if let Some(pointer) = &current
                && pointer.hash == snapshot.hash
            {
                let created = self.heal(&snapshot)?;
                tracing::debug!(identity = %identity, hash = %snapshot.hash.short(), "Unchanged");
                return Ok(receipt(IngestStatus::Unchanged, &snapshot, created, attempt));
            }

            if let Some(pointer) = &current
                && self.is_older_than_current(&snapshot, pointer)?
            {
                let put = self.store.put(&snapshot)?;
                tracing::info!(
                    identity = %identity,
                    hash = %snapshot.hash.short(),
                    current = %pointer.hash.short(),
                    "Stored out-of-order capture without moving pointer"
                );
                return Ok(receipt(IngestStatus::Superseded, &snapshot, put.created, attempt));
            }

            let put = self.store.put(&snapshot)?;
            let expected = current.as_ref().map(|p| &p.hash);
            let cas = self
                .store
                .compare_and_swap(identity, expected, &snapshot.hash, Utc::now())?;

            if cas.swapped {
                // A retention pass may have removed the snapshot between put and CAS.
                self.heal(&snapshot)?;
                tracing::info!(
                    identity = %identity,
                    hash = %snapshot.hash.short(),
                    created = put.created,
                    attempt,
                    "Stored snapshot"
                );
                if self.options.inline_retention {
                    self.collect_quietly(identity);
                }
                return Ok(receipt(IngestStatus::Stored, &snapshot, put.created, attempt));
            }

            tracing::debug!(
                identity = %identity,
                attempt,
                observed = ?cas.current.as_ref().map(|p| p.hash.short()),
                "Pointer moved concurrently, retrying"
            );
            if attempt < max_attempts {
                std::thread::sleep(Duration::from_millis(
                    CAS_BACKOFF_MILLIS * u64::from(attempt),
                ));
            }
        }

        tracing::warn!(
            identity = %identity,
            hash = %snapshot.hash.short(),
            attempts = max_attempts,
            "Ingest conflict"
        );
        Err(VaultError::Conflict {
            identity: identity.clone(),
            hash: snapshot.hash.clone(),
            attempts: max_attempts,
        })
    }

    /// Ensure the snapshot behind a pointer exists. Returns whether it was rewritten.
    fn heal(&self, snapshot: &Snapshot) -> Result<bool, VaultError> {
        if self.store.contains(&snapshot.identity_id, &snapshot.hash)? {
            return Ok(false);
        }
        tracing::warn!(
            identity = %snapshot.identity_id,
            hash = %snapshot.hash.short(),
            "Current snapshot missing, rewriting"
        );
        Ok(self.store.put(snapshot)?.created)
    }

    /// A capture strictly older than the current one never moves the pointer.
    ///
    /// "Current" means the stored snapshot's `captured_at`. Snapshots are
    /// write-once, so when the pointer returns to a hash already in history
    /// (A, B, A) it keeps A's first capture time, and later freshness checks
    /// compare against that. The pointer's `updated_at` is not used: it is
    /// the swap time, and would mark every delayed capture as superseded.
    ///
    /// An unreadable current snapshot counts as "not newer" so the pointer
    /// can be repaired by the incoming state.
    fn is_older_than_current(
        &self,
        snapshot: &Snapshot,
        pointer: &CurrentPointer,
    ) -> Result<bool, VaultError> {
        match self.store.get(&pointer.identity_id, &pointer.hash) {
            Ok(current) => Ok(snapshot.captured_at < current.captured_at),
            Err(VaultError::SnapshotNotFound { .. } | VaultError::CorruptSnapshot { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn collect_quietly(&self, identity: &IdentityId) {
        if let Err(e) = self.collect(identity) {
            tracing::warn!(identity = %identity, error = %e, "Inline retention failed");
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// The pointer and the snapshot it references.
    ///
    /// A pointer without its snapshot is reported as `DanglingPointer`.
    pub fn current(
        &self,
        identity: &IdentityId,
    ) -> Result<Option<(CurrentPointer, Snapshot)>, VaultError> {
        let Some(pointer) = self.store.read(identity)? else {
            return Ok(None);
        };
        match self.store.get(identity, &pointer.hash) {
            Ok(snapshot) => Ok(Some((pointer, snapshot))),
            Err(VaultError::SnapshotNotFound { identity, hash }) => {
                Err(VaultError::DanglingPointer { identity, hash })
            }
            Err(e) => Err(e),
        }
    }

    /// All snapshots for `identity`, newest first.
    pub fn list_history(&self, identity: &IdentityId) -> Result<Vec<Snapshot>, VaultError> {
        self.store.list(identity)
    }

    /// Every known identity, sorted.
    pub fn identities(&self) -> Result<Vec<IdentityId>, VaultError> {
        self.store.identities()
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    fn registry(&self) -> SelectionRegistry<'_, dyn VaultStore> {
        SelectionRegistry::new(self.store.as_ref())
    }

    /// Point downstream automation at `identity`.
    pub fn select_identity(&self, identity: &IdentityId) -> Result<ActiveSelection, VaultError> {
        self.registry().set_active(identity, Utc::now())
    }

    pub fn active(&self) -> Result<Option<ActiveSelection>, VaultError> {
        self.registry().get_active()
    }

    pub fn clear_selection(&self) -> Result<bool, VaultError> {
        self.registry().clear()
    }

    /// Canonical state of the selected identity's current snapshot.
    pub fn resolve_active(&self) -> Result<CanonicalState, VaultError> {
        let selection = self.active()?.ok_or(VaultError::NoActiveIdentity)?;
        let identity = selection.selected_identity_id;
        match self.current(&identity)? {
            Some((_, snapshot)) => Ok(snapshot.canonical_state),
            None => Err(VaultError::NoHistory(identity)),
        }
    }

    // =========================================================================
    // RETENTION
    // =========================================================================

    /// One retention pass for `identity`.
    pub fn collect(&self, identity: &IdentityId) -> Result<RetentionReport, VaultError> {
        retention::collect(
            self.store.as_ref(),
            identity,
            &self.options.retention,
            Utc::now(),
        )
    }

    /// One retention pass over every identity.
    ///
    /// An identity whose pass fails is logged and skipped.
    pub fn collect_all(&self) -> Result<Vec<RetentionReport>, VaultError> {
        let mut reports = Vec::new();
        for identity in self.store.identities()? {
            match self.collect(&identity) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "Retention pass failed");
                }
            }
        }
        Ok(reports)
    }
}

fn receipt(status: IngestStatus, snapshot: &Snapshot, created: bool, attempts: u32) -> IngestReceipt {
    IngestReceipt {
        status,
        hash: snapshot.hash.clone(),
        created,
        attempts,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::store::{FileStore, SelectionStore};
    use crate::{RawCookie, ValidationError};
    use chrono::{DateTime, TimeZone};
    use tempfile::{TempDir, tempdir};

    fn vault() -> (TempDir, Vault) {
        let temp = tempdir().expect("temp dir");
        let store = FileStore::open(temp.path()).unwrap();
        (temp, Vault::new(store, Canonicalizer::default(), VaultOptions::default()))
    }

    fn vault_with(options: VaultOptions) -> (TempDir, Vault) {
        let temp = tempdir().expect("temp dir");
        let store = FileStore::open(temp.path()).unwrap();
        (temp, Vault::new(store, Canonicalizer::default(), options))
    }

    fn id(s: &str) -> IdentityId {
        IdentityId::new(s).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn raw(sid: &str) -> RawExtraction {
        RawExtraction::for_user("u1").with_cookie(RawCookie::new("sid", sid))
    }

    #[test]
    fn second_identical_ingest_is_unchanged() {
        let (_temp, vault) = vault();
        let first = vault.ingest(&id("u1"), &raw("a")).unwrap();
        let second = vault.ingest(&id("u1"), &raw("a")).unwrap();

        assert_eq!(first.status, IngestStatus::Stored);
        assert!(first.created);
        assert_eq!(second.status, IngestStatus::Unchanged);
        assert!(!second.created);
        assert_eq!(first.hash, second.hash);
        assert_eq!(vault.list_history(&id("u1")).unwrap().len(), 1);
    }

    #[test]
    fn volatile_noise_is_unchanged() {
        let (_temp, vault) = vault();
        vault.ingest(&id("u1"), &raw("a")).unwrap();
        let noisy = raw("a").with_cookie(RawCookie::new("presence", "p=123"));
        assert_eq!(
            vault.ingest(&id("u1"), &noisy).unwrap().status,
            IngestStatus::Unchanged
        );
    }

    #[test]
    fn end_to_end_scenario() {
        let (_temp, vault) = vault();
        let u1 = id("u1");

        let a = vault.ingest(&u1, &raw("a")).unwrap();
        assert_eq!(a.status, IngestStatus::Stored);
        assert_eq!(vault.store().read(&u1).unwrap().unwrap().hash, a.hash);

        assert_eq!(
            vault.ingest(&u1, &raw("a")).unwrap().status,
            IngestStatus::Unchanged
        );

        let b = vault.ingest(&u1, &raw("b")).unwrap();
        assert_eq!(b.status, IngestStatus::Stored);
        assert_eq!(vault.store().read(&u1).unwrap().unwrap().hash, b.hash);
        assert_eq!(vault.list_history(&u1).unwrap().len(), 2);

        vault.select_identity(&u1).unwrap();
        let resolved = vault.resolve_active().unwrap();
        let expected = Canonicalizer::default().canonicalize(&raw("b")).unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn validation_happens_before_any_write() {
        let (temp, vault) = vault();
        let missing_sid = RawExtraction::for_user("u1").with_cookie(RawCookie::new("other", "x"));
        assert!(matches!(
            vault.ingest(&id("u1"), &missing_sid),
            Err(VaultError::Validation(
                ValidationError::MissingEssentialCredential(_)
            ))
        ));
        assert!(matches!(
            vault.ingest(&id("u2"), &raw("a")),
            Err(VaultError::Validation(ValidationError::IdentityMismatch { .. }))
        ));
        assert!(vault.identities().unwrap().is_empty());
        assert_eq!(
            std::fs::read_dir(temp.path().join("snapshots")).unwrap().count(),
            0
        );
    }

    #[test]
    fn oversized_state_is_rejected_before_any_write() {
        let (_temp, vault) = vault();
        let u1 = id("u1");
        let value = "v".repeat(crate::primitives::MAX_TOKEN_VALUE_LENGTH);
        let huge = (0..200).fold(RawExtraction::for_user("u1"), |raw, i| {
            raw.with_cookie(
                RawCookie::new("sid", value.clone()).with_domain(format!("d{i}.example.com")),
            )
        });

        assert!(matches!(
            vault.ingest(&u1, &huge),
            Err(VaultError::Validation(ValidationError::TooLarge { .. }))
        ));
        assert!(vault.identities().unwrap().is_empty());
        assert!(vault.list_history(&u1).unwrap().is_empty());
        assert!(vault.current(&u1).unwrap().is_none());
    }

    #[test]
    fn exhausted_retries_report_conflict_with_stored_hash() {
        let (temp, vault) = vault_with(VaultOptions {
            cas_retries: 2,
            ..VaultOptions::default()
        });
        let u1 = id("u1");
        let a = vault.ingest(&u1, &raw("a")).unwrap();

        let holder = std::fs::File::create(temp.path().join("current/u1.lock")).unwrap();
        holder.lock().unwrap();

        let (identity, hash, attempts) = match vault.ingest(&u1, &raw("b")) {
            Err(VaultError::Conflict {
                identity,
                hash,
                attempts,
            }) => (identity, hash, attempts),
            other => panic!("expected Conflict, got {other:?}"),
        };
        assert_eq!(identity, u1);
        assert_eq!(attempts, 2);

        let expected = Canonicalizer::default().canonicalize(&raw("b")).unwrap();
        assert_eq!(hash, ContentHash::of(&expected).unwrap());
        assert!(vault.store().contains(&u1, &hash).unwrap());
        assert_eq!(vault.store().read(&u1).unwrap().unwrap().hash, a.hash);

        // Once the lock is free the same extraction lands normally.
        holder.unlock().unwrap();
        let retry = vault.ingest(&u1, &raw("b")).unwrap();
        assert_eq!(retry.status, IngestStatus::Stored);
        assert!(!retry.created);
        assert_eq!(retry.hash, hash);
    }

    #[test]
    fn returning_to_earlier_state_keeps_first_capture_time() {
        let (_temp, vault) = vault();
        let u1 = id("u1");
        let now = Utc::now().timestamp();

        let a = vault.ingest(&u1, &raw("a").captured(at(now - 300))).unwrap();
        let b = vault.ingest(&u1, &raw("b").captured(at(now - 200))).unwrap();
        let back = vault.ingest(&u1, &raw("a").captured(at(now - 100))).unwrap();

        assert_eq!(back.status, IngestStatus::Stored);
        assert!(!back.created);
        assert_eq!(back.hash, a.hash);
        assert_eq!(vault.store().read(&u1).unwrap().unwrap().hash, a.hash);

        let history = vault.list_history(&u1).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].hash, b.hash);
        assert_eq!(history[1].hash, a.hash);
        assert_eq!(history[1].captured_at, at(now - 300));

        // Freshness is judged against A's first capture, so a capture from
        // between A and B still moves the pointer.
        let between = vault.ingest(&u1, &raw("c").captured(at(now - 250))).unwrap();
        assert_eq!(between.status, IngestStatus::Stored);
    }

    #[test]
    fn older_capture_is_superseded() {
        let (_temp, vault) = vault();
        let u1 = id("u1");
        let newer = vault.ingest(&u1, &raw("new").captured(at(2_000))).unwrap();
        let older = vault.ingest(&u1, &raw("old").captured(at(1_000))).unwrap();

        assert_eq!(older.status, IngestStatus::Superseded);
        assert!(older.created);
        assert_eq!(vault.store().read(&u1).unwrap().unwrap().hash, newer.hash);
        assert!(vault.store().contains(&u1, &older.hash).unwrap());
    }

    #[test]
    fn unchanged_heals_missing_snapshot() {
        let (_temp, vault) = vault();
        let u1 = id("u1");
        let first = vault.ingest(&u1, &raw("a")).unwrap();
        vault.store().delete(&u1, &first.hash).unwrap();
        assert!(matches!(
            vault.current(&u1),
            Err(VaultError::DanglingPointer { .. })
        ));

        let again = vault.ingest(&u1, &raw("a")).unwrap();
        assert_eq!(again.status, IngestStatus::Unchanged);
        assert!(again.created);
        assert!(vault.current(&u1).unwrap().is_some());
    }

    #[test]
    fn resolve_active_errors() {
        let (_temp, vault) = vault();
        assert!(matches!(
            vault.resolve_active(),
            Err(VaultError::NoActiveIdentity)
        ));
        assert!(matches!(
            vault.select_identity(&id("u1")),
            Err(VaultError::IdentityNotFound(_))
        ));
    }

    #[test]
    fn resolve_active_without_pointer_is_no_history() {
        let (_temp, vault) = vault();
        let selection = ActiveSelection {
            selected_identity_id: id("ghost"),
            selected_at: Utc::now(),
        };
        vault.store().store_selection(&selection).unwrap();
        assert!(matches!(
            vault.resolve_active(),
            Err(VaultError::NoHistory(_))
        ));
    }

    #[test]
    fn selection_does_not_touch_history() {
        let (_temp, vault) = vault();
        let u1 = id("u1");
        vault.ingest(&u1, &raw("a")).unwrap();
        let before = vault.store().read(&u1).unwrap();
        vault.select_identity(&u1).unwrap();
        assert!(vault.clear_selection().unwrap());
        assert_eq!(vault.store().read(&u1).unwrap(), before);
        assert!(vault.active().unwrap().is_none());
    }

    #[test]
    fn inline_retention_caps_history() {
        let (_temp, vault) = vault();
        let u1 = id("u1");
        let now = Utc::now().timestamp();
        let mut last = None;
        for i in 0..6 {
            let r = raw(&format!("s{i}")).captured(at(now - 60 + i));
            last = Some(vault.ingest(&u1, &r).unwrap().hash);
        }
        let history = vault.list_history(&u1).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].hash, last.unwrap());
    }

    #[test]
    fn concurrent_distinct_ingests_keep_every_snapshot() {
        let temp = tempdir().expect("temp dir");
        let store = FileStore::open(temp.path()).unwrap();
        let options = VaultOptions {
            inline_retention: false,
            cas_retries: 50,
            ..VaultOptions::default()
        };
        let vault = std::sync::Arc::new(Vault::new(store, Canonicalizer::default(), options));
        let u1 = id("u1");

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (vault, u1) = (vault.clone(), u1.clone());
                std::thread::spawn(move || vault.ingest(&u1, &raw(&format!("t{i}"))))
            })
            .collect();

        let receipts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for receipt in receipts.iter().flatten() {
            assert!(vault.store().contains(&u1, &receipt.hash).unwrap());
        }
        let pointer = vault.store().read(&u1).unwrap().unwrap();
        assert!(vault.store().get(&u1, &pointer.hash).is_ok());
    }

    #[test]
    fn collect_all_covers_every_identity() {
        let (_temp, vault) = vault();
        vault.ingest(&id("u1"), &raw("a")).unwrap();
        let r2 = RawExtraction::for_user("u2").with_cookie(RawCookie::new("sid", "z"));
        vault.ingest(&id("u2"), &r2).unwrap();

        let reports = vault.collect_all().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.deleted.is_empty()));
    }
}
