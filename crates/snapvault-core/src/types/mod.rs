//! # Core Type Definitions
//!
//! This module contains the identifiers and the error taxonomy shared by
//! every snapvault component:
//! - Identity and content identifiers (`IdentityId`, `ContentHash`)
//! - Error types (`VaultError`, `ValidationError`, `ErrorKind`)
//!
//! ## Path Safety
//!
//! Both identifiers end up as path segments in the file backend
//! (`snapshots/{identity}/{hash}.json`), so both are validated at
//! construction and can never carry separators or traversal segments.

use crate::primitives::MAX_IDENTITY_LENGTH;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// IDENTITY
// =============================================================================

/// External identifier of the account whose sessions are captured.
///
/// Allowed characters: ASCII alphanumerics plus `.`, `_`, `@` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    /// Validate and wrap an identity string.
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ValidationError::MissingIdentity);
        }
        if raw.len() > MAX_IDENTITY_LENGTH || raw == "." || raw == ".." {
            return Err(ValidationError::InvalidIdentity(raw));
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-');
        if !raw.chars().all(allowed) {
            return Err(ValidationError::InvalidIdentity(raw));
        }
        Ok(Self(raw))
    }

    /// Get the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdentityId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for IdentityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdentityId> for String {
    fn from(id: IdentityId) -> Self {
        id.0
    }
}

// =============================================================================
// CONTENT HASH
// =============================================================================

/// Length of a rendered content hash (BLAKE3, lowercase hex).
pub const CONTENT_HASH_HEX_LEN: usize = 64;

/// Stable digest of a canonical state, rendered as 64 lowercase hex chars.
///
/// Computed by [`ContentHash::of`](crate::hasher); parsing only accepts the
/// rendered form so a stored file name can be trusted as a hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a rendered hash.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let well_formed = s.len() == CONTENT_HASH_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(ValidationError::InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub(crate) fn from_digest(digest: blake3::Hash) -> Self {
        Self(digest.to_hex().to_string())
    }

    /// Get the hash as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Rejections raised before any store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The extraction carries no identity and none was supplied.
    #[error("missing identity")]
    MissingIdentity,

    /// The identity is malformed (length, characters, traversal).
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    /// The identity in the payload disagrees with the caller's.
    #[error("identity mismatch: request is for {expected}, payload names {found}")]
    IdentityMismatch { expected: String, found: String },

    /// A required credential token is absent or empty.
    #[error("missing essential credential: {0}")]
    MissingEssentialCredential(String),

    /// The same credential (name, domain) appears with different values.
    #[error("ambiguous credential: {0} appears with conflicting values")]
    AmbiguousCredential(String),

    /// An input field exceeds its size limit.
    #[error("{field} exceeds limit of {limit}")]
    TooLarge { field: &'static str, limit: usize },

    /// A string is not a rendered content hash.
    #[error("invalid content hash: {0:?}")]
    InvalidHash(String),

    /// The canonicalization policy is inconsistent.
    #[error("invalid canonical policy: {0}")]
    InvalidPolicy(String),
}

/// Errors that can occur in the snapvault core.
///
/// - No silent failures
/// - Use `Result<T, VaultError>` for fallible operations
/// - The core never panics; all errors are recoverable
#[derive(Debug, Error)]
pub enum VaultError {
    /// The raw extraction was rejected.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// CAS retries exhausted under contention. The snapshot was written and
    /// remains addressable by `hash`; only the pointer did not move.
    #[error("conflict on {identity}: pointer moved on each of {attempts} attempts (stored {hash})")]
    Conflict {
        identity: IdentityId,
        hash: ContentHash,
        attempts: u32,
    },

    /// No snapshot with this hash exists for the identity.
    #[error("snapshot not found: {identity}/{hash}")]
    SnapshotNotFound {
        identity: IdentityId,
        hash: ContentHash,
    },

    /// The identity has no confirmed history (no pointer).
    #[error("identity not found: {0}")]
    IdentityNotFound(IdentityId),

    /// No identity is selected for automation.
    #[error("no active identity selected")]
    NoActiveIdentity,

    /// The selected identity has no current snapshot.
    #[error("no history for identity {0}")]
    NoHistory(IdentityId),

    /// A pointer references a snapshot that does not exist.
    #[error("dangling pointer: {identity} -> {hash}")]
    DanglingPointer {
        identity: IdentityId,
        hash: ContentHash,
    },

    /// A stored snapshot no longer matches its own hash.
    #[error("corrupt snapshot: {identity}/{hash}")]
    CorruptSnapshot {
        identity: IdentityId,
        hash: ContentHash,
    },

    /// Durable-layer failure. The write is considered not applied.
    #[error("storage error: {0}")]
    Storage(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification used by the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Storage,
}

impl VaultError {
    /// Classify the error for status mapping (400 / 409 / 404 / 500).
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::SnapshotNotFound { .. }
            | Self::IdentityNotFound(_)
            | Self::NoActiveIdentity
            | Self::NoHistory(_) => ErrorKind::NotFound,
            Self::DanglingPointer { .. }
            | Self::CorruptSnapshot { .. }
            | Self::Storage(_)
            | Self::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// Wrap an I/O error with the path it concerns.
    pub(crate) fn io(context: impl fmt::Display, err: std::io::Error) -> Self {
        Self::Storage(format!("{}: {}", context, err))
    }
}

// =============================================================================
// TESTS
// =============================================================================
