//! # Hasher
//!
//! Stable content hash over a canonical state.
//!
//! ## Encoding
//!
//! The state is encoded with `postcard`, which writes struct fields strictly
//! in declaration order with no field names and no map iteration:
//!
//! ```text
//! schema_version | identity_id | credentials[name, value, domain, expiry]* |
//! client_signature? | device_hint?
//! ```
//!
//! The digest is BLAKE3 over those bytes, rendered as lowercase hex. Because
//! the canonicalizer has already sorted the credentials, permuting the raw
//! input never changes the digest.

use crate::{CanonicalState, ContentHash, VaultError};

/// Encode a canonical state in the fixed hashing order.
pub fn canonical_bytes(state: &CanonicalState) -> Result<Vec<u8>, VaultError> {
    postcard::to_allocvec(state).map_err(|e| VaultError::Serialization(e.to_string()))
}

impl ContentHash {
    /// Hash a canonical state.
    pub fn of(state: &CanonicalState) -> Result<Self, VaultError> {
        let bytes = canonical_bytes(state)?;
        Ok(Self::from_digest(blake3::hash(&bytes)))
    }

    /// Check that `state` hashes to `self`.
    pub fn matches(&self, state: &CanonicalState) -> Result<bool, VaultError> {
        Ok(&Self::of(state)? == self)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::primitives::SCHEMA_VERSION;
    use crate::{CredentialToken, IdentityId};

    fn token(name: &str, value: &str) -> CredentialToken {
        CredentialToken {
            name: name.into(),
            value: value.into(),
            domain: "example.com".into(),
            expiry: None,
        }
    }

    fn state(sid: &str) -> CanonicalState {
        CanonicalState {
            schema_version: SCHEMA_VERSION,
            identity_id: IdentityId::new("u1").unwrap(),
            credentials: vec![token("sid", sid)],
            client_signature: Some("UA".into()),
            device_hint: None,
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let a = ContentHash::of(&state("a")).unwrap();
        let b = ContentHash::of(&state("a")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn hash_distinguishes_values() {
        assert_ne!(
            ContentHash::of(&state("a")).unwrap(),
            ContentHash::of(&state("b")).unwrap()
        );
    }

    #[test]
    fn schema_version_changes_hash() {
        let mut next = state("a");
        next.schema_version = SCHEMA_VERSION + 1;
        assert_ne!(
            ContentHash::of(&state("a")).unwrap(),
            ContentHash::of(&next).unwrap()
        );
    }

    #[test]
    fn absent_and_empty_signature_differ() {
        let mut none = state("a");
        none.client_signature = None;
        let mut empty = state("a");
        empty.client_signature = Some(String::new());
        assert_ne!(
            ContentHash::of(&none).unwrap(),
            ContentHash::of(&empty).unwrap()
        );
    }

    #[test]
    fn bytes_are_bit_exact_across_calls() {
        let s = state("a");
        assert_eq!(canonical_bytes(&s).unwrap(), canonical_bytes(&s).unwrap());
    }

    #[test]
    fn matches_detects_tampering() {
        let hash = ContentHash::of(&state("a")).unwrap();
        assert!(hash.matches(&state("a")).unwrap());
        assert!(!hash.matches(&state("tampered")).unwrap());
    }
}
