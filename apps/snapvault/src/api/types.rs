//! # API Request/Response Types
//!
//! JSON structures for the HTTP API. Snapshot, pointer, receipt and report
//! bodies reuse the core records directly.

use serde::{Deserialize, Serialize};
use snapvault_core::{
    ActiveSelection, ContentHash, CurrentPointer, ErrorKind, IdentityId, Snapshot, VaultError,
};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: String,
}

impl HealthResponse {
    pub fn ok(backend: &str) -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: backend.to_string(),
        }
    }
}

// =============================================================================
// IDENTITIES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitiesResponse {
    pub identities: Vec<IdentityId>,
}

/// Current pointer plus the snapshot it references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentResponse {
    pub pointer: CurrentPointer,
    pub snapshot: Snapshot,
}

// =============================================================================
// SELECTION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRequest {
    pub identity_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResponse {
    pub selection: Option<ActiveSelection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearSelectionResponse {
    pub cleared: bool,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error body for every non-2xx response.
///
/// `status` is `"conflict"` when the ingest lost every CAS attempt and the
/// caller should retry later; `"error"` otherwise. A conflict carries the
/// hash of the snapshot that was stored anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub kind: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
}

impl ErrorResponse {
    pub fn new(kind: &str, error: impl Into<String>) -> Self {
        let status = if kind == "conflict" { "conflict" } else { "error" };
        Self {
            status: status.to_string(),
            kind: kind.to_string(),
            error: error.into(),
            hash: None,
        }
    }

    pub fn from_vault(err: &VaultError) -> Self {
        let mut body = Self::new(kind_label(err.kind()), err.to_string());
        if let VaultError::Conflict { hash, .. } = err {
            body.hash = Some(hash.clone());
        }
        body
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::Conflict => "conflict",
        ErrorKind::NotFound => "not_found",
        ErrorKind::Storage => "storage",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use snapvault_core::ValidationError;

    #[test]
    fn conflict_renders_conflict_status() {
        let hash = ContentHash::parse(&"a".repeat(64)).unwrap();
        let err = VaultError::Conflict {
            identity: IdentityId::new("u1").unwrap(),
            hash: hash.clone(),
            attempts: 5,
        };
        let body = ErrorResponse::from_vault(&err);
        assert_eq!(body.status, "conflict");
        assert_eq!(body.kind, "conflict");
        assert!(body.error.contains("u1"));
        assert_eq!(body.hash, Some(hash));
    }

    #[test]
    fn validation_renders_error_status() {
        let err = VaultError::from(ValidationError::MissingIdentity);
        let body = ErrorResponse::from_vault(&err);
        assert_eq!(body.status, "error");
        assert_eq!(body.kind, "validation");
        assert!(body.hash.is_none());
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("hash").is_none());
    }

    #[test]
    fn select_request_is_camel_case() {
        let req: SelectRequest = serde_json::from_str(r#"{"identityId":"u1"}"#).unwrap();
        assert_eq!(req.identity_id, "u1");
    }
}
