//! # Retention Collector
//!
//! Prunes one identity's history to an age limit and a version cap.
//!
//! Eligible for deletion: `(older than TTL ∪ outside the newest-N window)`
//! minus the pointer target. The pointer target occupies one of the N slots.
//!
//! The collector runs alongside writers. It never trusts a cached pointer:
//! the pointer is read after listing, re-read before each deletion, and read
//! once more afterwards. If an ingest moved the pointer onto a snapshot in
//! the very window between check and delete, the collector writes the
//! snapshot back from the copy it already holds.

use crate::primitives::{DEFAULT_MAX_VERSIONS, DEFAULT_TTL_SECS};
use crate::{ContentHash, IdentityId, Snapshot, VaultError, VaultStore};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::time::Duration;

/// Age and count limits applied per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub ttl: Duration,
    pub max_versions: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_versions: DEFAULT_MAX_VERSIONS,
        }
    }
}

impl RetentionPolicy {
    fn ttl_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX)
    }

    fn is_expired(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(snapshot.captured_at) > self.ttl_delta()
    }
}

/// What one collector pass did for one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub identity_id: Option<IdentityId>,
    /// Snapshots listed at the start of the pass.
    pub examined: usize,
    pub deleted: Vec<ContentHash>,
    /// Deletions that failed; logged and left in place.
    pub failed: Vec<ContentHash>,
    /// Eligible snapshots skipped or restored because they became current.
    pub protected: Vec<ContentHash>,
}

/// Choose the snapshots to evict from a newest-first listing.
///
/// Pure: the caller supplies the listing, the pointer target and the clock.
#[must_use]
pub fn plan_eviction<'a>(
    snapshots: &'a [Snapshot],
    pointer: Option<&ContentHash>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a Snapshot> {
    let pointer_listed = pointer.is_some_and(|p| snapshots.iter().any(|s| &s.hash == p));
    let budget = policy
        .max_versions
        .saturating_sub(usize::from(pointer_listed));

    let mut kept = 0;
    let mut evict = Vec::new();
    for snapshot in snapshots {
        if Some(&snapshot.hash) == pointer {
            continue;
        }
        if kept >= budget || policy.is_expired(snapshot, now) {
            evict.push(snapshot);
        } else {
            kept += 1;
        }
    }
    evict
}

/// Run one collector pass for `identity`.
///
/// Listing and pointer reads propagate errors. Individual deletions never do.
pub fn collect<S: VaultStore + ?Sized>(
    store: &S,
    identity: &IdentityId,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionReport, VaultError> {
    let snapshots = store.list(identity)?;
    let pointer = store.read(identity)?.map(|p| p.hash);
    let plan = plan_eviction(&snapshots, pointer.as_ref(), policy, now);

    let mut report = RetentionReport {
        identity_id: Some(identity.clone()),
        examined: snapshots.len(),
        ..RetentionReport::default()
    };

    for snapshot in plan {
        let hash = &snapshot.hash;
        if is_current(store, identity, hash)? {
            report.protected.push(hash.clone());
            continue;
        }

        match store.delete(identity, hash) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    hash = %hash.short(),
                    error = %e,
                    "Failed to delete snapshot, skipping"
                );
                report.failed.push(hash.clone());
                continue;
            }
        }

        // Lost the race with an ingest that just pointed at this snapshot.
        if is_current(store, identity, hash)? {
            tracing::warn!(
                identity = %identity,
                hash = %hash.short(),
                "Snapshot became current during deletion, restoring"
            );
            store.put(snapshot)?;
            report.protected.push(hash.clone());
            continue;
        }

        report.deleted.push(hash.clone());
    }

    if !report.deleted.is_empty() {
        tracing::info!(
            identity = %identity,
            examined = report.examined,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Retention pass complete"
        );
    }
    Ok(report)
}

fn is_current<S: VaultStore + ?Sized>(
    store: &S,
    identity: &IdentityId,
    hash: &ContentHash,
) -> Result<bool, VaultError> {
    Ok(store.read(identity)?.is_some_and(|p| &p.hash == hash))
}

// =============================================================================
// TESTS
// =============================================================================
