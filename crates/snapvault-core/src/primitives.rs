//! # Primitives
//!
//! Compiled-in constants for the snapvault core.
//!
//! Defaults here are the values a deployment gets when its configuration is
//! silent. Anything that changes the canonical form (not the policy values)
//! is a schema change and must bump [`SCHEMA_VERSION`].

/// Version stamped into every canonical state.
///
/// Canonical states from different versions never compare or hash equal.
pub const SCHEMA_VERSION: u16 = 1;

/// Default essential credential allow-list.
pub const DEFAULT_ESSENTIAL_TOKENS: &[&str] = &["sid"];

/// Default required credentials (must be a subset of the allow-list).
pub const DEFAULT_REQUIRED_TOKENS: &[&str] = &["sid"];

// =============================================================================
// RETENTION
// =============================================================================

/// Default snapshot time-to-live: 3 days.
pub const DEFAULT_TTL_SECS: u64 = 3 * 24 * 60 * 60;

/// Default number of most recent snapshots kept per identity.
pub const DEFAULT_MAX_VERSIONS: usize = 3;

/// Default interval for the periodic retention pass: 5 minutes.
pub const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 5 * 60;

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Default number of read-put-CAS attempts before surfacing `Conflict`.
pub const DEFAULT_CAS_RETRIES: u32 = 5;

/// Base backoff between ingest attempts, multiplied by the attempt number.
pub const CAS_BACKOFF_MILLIS: u64 = 2;

/// Attempts to take a pointer lock before reporting the swap as lost.
pub const POINTER_LOCK_ATTEMPTS: u32 = 50;

/// Sleep between pointer lock attempts.
pub const POINTER_LOCK_SPIN_MILLIS: u64 = 2;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for an identity id.
pub const MAX_IDENTITY_LENGTH: usize = 128;

/// Maximum number of cookies in one extraction.
pub const MAX_COOKIES: usize = 512;

/// Maximum length for a cookie name.
pub const MAX_TOKEN_NAME_LENGTH: usize = 256;

/// Maximum length for a cookie value (8 KiB).
pub const MAX_TOKEN_VALUE_LENGTH: usize = 8 * 1024;

/// Maximum length for the client signature (user agent).
pub const MAX_SIGNATURE_LENGTH: usize = 1024;

/// Maximum size of a stored snapshot file accepted on read (1 MiB).
pub const MAX_SNAPSHOT_FILE_SIZE: u64 = 1024 * 1024;

/// Maximum pretty-JSON size of one canonical state (256 KiB).
///
/// Must stay well under `MAX_SNAPSHOT_FILE_SIZE`: the stored snapshot wraps
/// the state in metadata and deeper indentation.
pub const MAX_CANONICAL_STATE_BYTES: usize = 256 * 1024;

const _: () = assert!(MAX_CANONICAL_STATE_BYTES as u64 * 2 <= MAX_SNAPSHOT_FILE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_is_subset_of_essential() {
        for name in DEFAULT_REQUIRED_TOKENS {
            assert!(DEFAULT_ESSENTIAL_TOKENS.contains(name));
        }
    }

    #[test]
    fn default_ttl_is_three_days() {
        assert_eq!(DEFAULT_TTL_SECS, 259_200);
    }
}
