//! # Property-Based Tests
//!
//! Determinism and retention invariants checked with proptest.

use chrono::{TimeZone, Utc};
use proptest::collection::vec;
use proptest::prelude::*;
use snapvault_core::{
    Canonicalizer, ContentHash, FileStore, IngestStatus, RawCookie, RawExtraction,
    RetentionPolicy, Snapshot, Vault, VaultOptions, plan_eviction,
};
use std::collections::BTreeSet;
use std::time::Duration;

const ESSENTIAL: [&str; 3] = ["sid", "xs", "c_user"];

fn canonicalizer() -> Canonicalizer {
    let policy = snapvault_core::CanonicalPolicy::new(ESSENTIAL, ["sid"]).expect("policy");
    Canonicalizer::new(policy)
}

/// A cookie jar with unique names so any permutation is a valid extraction.
fn jar() -> impl Strategy<Value = Vec<RawCookie>> {
    (
        "[a-zA-Z0-9]{1,24}",
        proptest::option::of("[a-zA-Z0-9]{1,24}"),
        vec(("[a-z]{3,8}", "[ -~]{0,16}"), 0..8),
    )
        .prop_map(|(sid, xs, noise)| {
            let mut cookies = vec![RawCookie::new("sid", sid).with_domain(".example.com")];
            if let Some(xs) = xs {
                cookies.push(RawCookie::new("xs", xs).with_domain("example.com"));
            }
            let mut seen = BTreeSet::new();
            for (name, value) in noise {
                let name = format!("noise_{name}");
                if seen.insert(name.clone()) {
                    cookies.push(RawCookie::new(name, value));
                }
            }
            cookies
        })
}

fn extraction(cookies: Vec<RawCookie>) -> RawExtraction {
    RawExtraction {
        user_id: Some("u1".to_string()),
        cookies,
        ..RawExtraction::default()
    }
}

fn snapshot_at(sid: &str, secs: i64) -> Snapshot {
    let raw = extraction(vec![RawCookie::new("sid", sid)]);
    let state = canonicalizer().canonicalize(&raw).expect("canonicalize");
    Snapshot::seal(state, Utc.timestamp_opt(secs, 0).single().expect("time")).expect("seal")
}

// =============================================================================
// CANONICALIZATION
// =============================================================================

proptest! {
    /// Cookie order never changes the canonical state or its hash.
    #[test]
    fn permutation_does_not_change_hash(cookies in jar(), seed in any::<u64>()) {
        let mut shuffled = cookies.clone();
        // Deterministic rotation + reversal driven by the seed.
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        if seed % 2 == 0 {
            shuffled.reverse();
        }

        let c = canonicalizer();
        let a = c.canonicalize(&extraction(cookies)).expect("a");
        let b = c.canonicalize(&extraction(shuffled)).expect("b");
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(ContentHash::of(&a).expect("hash"), ContentHash::of(&b).expect("hash"));
    }

    /// Excluded fields (non-essential cookies, storage blobs, capture metadata)
    /// never reach the canonical state.
    #[test]
    fn excluded_fields_are_invisible(
        cookies in jar(),
        storage_key in "[a-z]{1,10}",
        storage_value in "[ -~]{0,32}",
        secs in 0i64..4_000_000_000,
    ) {
        let c = canonicalizer();
        let plain = extraction(cookies.clone());

        let mut noisy = extraction(cookies);
        noisy.cookies.push(RawCookie::new("presence", storage_value.clone()));
        noisy.local_storage.insert(storage_key.clone(), serde_json::json!(storage_value));
        noisy.session_storage.insert(storage_key, serde_json::json!(secs));
        noisy.source = Some("tab".into());
        noisy.captured_at = Utc.timestamp_opt(secs, 0).single();

        prop_assert_eq!(
            c.canonicalize(&plain).expect("plain"),
            c.canonicalize(&noisy).expect("noisy")
        );
    }

    /// Rendered hashes are always 64 lowercase hex chars and parse back.
    #[test]
    fn hash_rendering_is_stable(cookies in jar()) {
        let state = canonicalizer().canonicalize(&extraction(cookies)).expect("state");
        let hash = ContentHash::of(&state).expect("hash");
        prop_assert_eq!(hash.as_str().len(), 64);
        prop_assert!(hash.as_str().bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        prop_assert_eq!(ContentHash::parse(hash.as_str()).expect("parse"), hash);
    }
}

// =============================================================================
// RETENTION
// =============================================================================

proptest! {
    /// At most N survive, the pointer target always survives, and every
    /// other survivor is within TTL.
    #[test]
    fn eviction_plan_respects_limits(
        ages in vec(0i64..10 * 86_400, 1..12),
        max_versions in 1usize..6,
        ttl_secs in 1u64..5 * 86_400,
        pointer_index in any::<prop::sample::Index>(),
    ) {
        let now = 20 * 86_400;
        let mut snapshots: Vec<Snapshot> = ages
            .iter()
            .enumerate()
            .map(|(i, age)| snapshot_at(&format!("s{i}"), now - age))
            .collect();
        snapshots.sort_by(|a, b| b.captured_at.cmp(&a.captured_at).then_with(|| a.hash.cmp(&b.hash)));

        let pointer = snapshots[pointer_index.index(snapshots.len())].hash.clone();
        let policy = RetentionPolicy { ttl: Duration::from_secs(ttl_secs), max_versions };
        let now_at = Utc.timestamp_opt(now, 0).single().expect("time");

        let evicted: BTreeSet<ContentHash> =
            plan_eviction(&snapshots, Some(&pointer), &policy, now_at)
                .into_iter()
                .map(|s| s.hash.clone())
                .collect();
        let survivors: Vec<&Snapshot> =
            snapshots.iter().filter(|s| !evicted.contains(&s.hash)).collect();

        prop_assert!(!evicted.contains(&pointer));
        prop_assert!(survivors.len() <= max_versions);
        for s in survivors.iter().filter(|s| s.hash != pointer) {
            let age = now_at.signed_duration_since(s.captured_at).num_seconds();
            prop_assert!(age <= ttl_secs as i64);
        }
    }
}

// =============================================================================
// INGESTION
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Ingesting the same extraction twice stores exactly one snapshot.
    #[test]
    fn ingest_is_idempotent(cookies in jar()) {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = FileStore::open(temp.path()).expect("open");
        let vault = Vault::new(store, canonicalizer(), VaultOptions::default());
        let id = snapvault_core::IdentityId::new("u1").expect("id");
        let raw = extraction(cookies);

        let first = vault.ingest(&id, &raw).expect("first");
        let second = vault.ingest(&id, &raw).expect("second");

        prop_assert_eq!(first.status, IngestStatus::Stored);
        prop_assert_eq!(second.status, IngestStatus::Unchanged);
        prop_assert_eq!(first.hash, second.hash);
        prop_assert_eq!(vault.list_history(&id).expect("history").len(), 1);
    }
}
