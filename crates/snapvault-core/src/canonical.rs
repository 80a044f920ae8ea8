//! # Canonicalizer
//!
//! Deterministic projection of a raw browser extraction into a minimal,
//! version-tagged canonical state.
//!
//! - Keep only allow-listed credential tokens
//! - Sort them by `(name, domain)`
//! - Normalize the client signature
//! - Reject missing, malformed or ambiguous input
//!
//! Volatile material (storage blobs, churn cookies, presence markers,
//! capture metadata) never reaches the canonical state: two extractions that
//! differ only there produce byte-identical states.

use crate::primitives::{
    DEFAULT_ESSENTIAL_TOKENS, DEFAULT_REQUIRED_TOKENS, MAX_CANONICAL_STATE_BYTES, MAX_COOKIES,
    MAX_SIGNATURE_LENGTH, MAX_TOKEN_NAME_LENGTH, MAX_TOKEN_VALUE_LENGTH, SCHEMA_VERSION,
};
use crate::{IdentityId, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// RAW INPUT
// =============================================================================

/// One cookie as reported by the capture extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCookie {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Seconds since the epoch, as the browser reports it (fractional).
    #[serde(default)]
    pub expiration_date: Option<f64>,
    /// The agent's own volatility classification. Advisory only.
    #[serde(default)]
    pub volatile: bool,
}

impl RawCookie {
    /// Create a cookie with a name and value only.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Set the cookie domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the cookie expiry (seconds since the epoch).
    #[must_use]
    pub fn with_expiry(mut self, expiry: f64) -> Self {
        self.expiration_date = Some(expiry);
        self
    }
}

/// Untrusted extraction posted by the capture agent.
///
/// Never persisted verbatim. Field aliases cover the names the capture
/// extension has used over time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExtraction {
    #[serde(
        default,
        alias = "id",
        alias = "identityId",
        alias = "accountId",
        alias = "sessionId",
        alias = "activeSessionId"
    )]
    pub user_id: Option<String>,
    #[serde(default)]
    pub cookies: Vec<RawCookie>,
    #[serde(default)]
    pub local_storage: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub session_storage: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub device_hint: Option<String>,
    #[serde(default, alias = "timestamp", alias = "updatedAt", alias = "createdAt")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<String>,
}

impl RawExtraction {
    /// Start an extraction for the given identity hint.
    #[must_use]
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Append a cookie.
    #[must_use]
    pub fn with_cookie(mut self, cookie: RawCookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Set the client signature.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the capture timestamp.
    #[must_use]
    pub fn captured(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }
}

// =============================================================================
// CANONICAL STATE
// =============================================================================

/// One essential credential in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CredentialToken {
    pub name: String,
    pub value: String,
    /// Lower-cased, without the leading dot. Empty when the agent sent none.
    pub domain: String,
    /// Whole seconds since the epoch; `None` for session cookies.
    pub expiry: Option<i64>,
}

/// The deduplicated, order-independent projection of an extraction.
///
/// Field order is the hashing order; see [`crate::hasher`]. Do not reorder
/// fields or add `skip_serializing_if` without bumping `SCHEMA_VERSION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalState {
    pub schema_version: u16,
    pub identity_id: IdentityId,
    /// Sorted by `(name, domain)`, no duplicates.
    pub credentials: Vec<CredentialToken>,
    pub client_signature: Option<String>,
    pub device_hint: Option<String>,
}

impl CanonicalState {
    /// Look up a credential value by name (first domain wins).
    #[must_use]
    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }
}

// =============================================================================
// POLICY
// =============================================================================

/// Which credential names are essential, and which of those are mandatory.
///
/// The allow-list is deployment configuration. Adding a name that changes on
/// every page load silently breaks idempotence, so nothing here is inferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPolicy {
    essential: BTreeSet<String>,
    required: BTreeSet<String>,
}

impl CanonicalPolicy {
    /// Build a policy. Every required name must also be essential.
    pub fn new<E, R>(essential: E, required: R) -> Result<Self, ValidationError>
    where
        E: IntoIterator,
        E::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let essential: BTreeSet<String> = essential.into_iter().map(Into::into).collect();
        let required: BTreeSet<String> = required.into_iter().map(Into::into).collect();

        if essential.is_empty() {
            return Err(ValidationError::InvalidPolicy(
                "essential allow-list is empty".to_string(),
            ));
        }
        if let Some(stray) = required.difference(&essential).next() {
            return Err(ValidationError::InvalidPolicy(format!(
                "required token {:?} is not in the essential allow-list",
                stray
            )));
        }
        Ok(Self {
            essential,
            required,
        })
    }

    pub fn essential(&self) -> impl Iterator<Item = &str> {
        self.essential.iter().map(String::as_str)
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    fn is_essential(&self, name: &str) -> bool {
        self.essential.contains(name)
    }
}

impl Default for CanonicalPolicy {
    fn default() -> Self {
        Self {
            essential: DEFAULT_ESSENTIAL_TOKENS.iter().map(|s| s.to_string()).collect(),
            required: DEFAULT_REQUIRED_TOKENS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// =============================================================================
// CANONICALIZER
// =============================================================================

/// Pure projection from [`RawExtraction`] to [`CanonicalState`].
#[derive(Debug, Clone, Default)]
pub struct Canonicalizer {
    policy: CanonicalPolicy,
}

impl Canonicalizer {
    /// Create a canonicalizer for the given policy.
    #[must_use]
    pub fn new(policy: CanonicalPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &CanonicalPolicy {
        &self.policy
    }

    /// Canonicalize an extraction using its own identity hint.
    pub fn canonicalize(&self, raw: &RawExtraction) -> Result<CanonicalState, ValidationError> {
        let hint = raw
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingIdentity)?;
        let identity = IdentityId::new(hint)?;
        self.project(identity, raw)
    }

    /// Canonicalize an extraction on behalf of a known identity.
    ///
    /// A missing hint is filled from `identity`; a different one is rejected.
    pub fn canonicalize_for(
        &self,
        identity: &IdentityId,
        raw: &RawExtraction,
    ) -> Result<CanonicalState, ValidationError> {
        let hint = raw
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(found) = hint
            && found != identity.as_str()
        {
            return Err(ValidationError::IdentityMismatch {
                expected: identity.to_string(),
                found: found.to_string(),
            });
        }
        self.project(identity.clone(), raw)
    }

    fn project(
        &self,
        identity: IdentityId,
        raw: &RawExtraction,
    ) -> Result<CanonicalState, ValidationError> {
        if raw.cookies.len() > MAX_COOKIES {
            return Err(ValidationError::TooLarge {
                field: "cookies",
                limit: MAX_COOKIES,
            });
        }

        let mut selected: BTreeMap<(String, String), CredentialToken> = BTreeMap::new();
        for cookie in &raw.cookies {
            if cookie.name.len() > MAX_TOKEN_NAME_LENGTH {
                return Err(ValidationError::TooLarge {
                    field: "cookie name",
                    limit: MAX_TOKEN_NAME_LENGTH,
                });
            }
            if cookie.value.len() > MAX_TOKEN_VALUE_LENGTH {
                return Err(ValidationError::TooLarge {
                    field: "cookie value",
                    limit: MAX_TOKEN_VALUE_LENGTH,
                });
            }
            if !self.policy.is_essential(&cookie.name) {
                continue;
            }

            let token = CredentialToken {
                name: cookie.name.clone(),
                value: cookie.value.clone(),
                domain: normalize_domain(cookie.domain.as_deref()),
                expiry: cookie
                    .expiration_date
                    .filter(|secs| secs.is_finite())
                    .map(|secs| secs as i64),
            };

            match selected.entry((token.name.clone(), token.domain.clone())) {
                Entry::Vacant(slot) => {
                    slot.insert(token);
                }
                Entry::Occupied(existing) => {
                    if existing.get() != &token {
                        return Err(ValidationError::AmbiguousCredential(token.name));
                    }
                }
            }
        }

        for name in &self.policy.required {
            let present = selected
                .values()
                .any(|t| &t.name == name && !t.value.is_empty());
            if !present {
                return Err(ValidationError::MissingEssentialCredential(name.clone()));
            }
        }

        let client_signature = match raw.user_agent.as_deref() {
            Some(ua) if ua.len() > MAX_SIGNATURE_LENGTH => {
                return Err(ValidationError::TooLarge {
                    field: "user agent",
                    limit: MAX_SIGNATURE_LENGTH,
                });
            }
            Some(ua) => normalize_signature(ua),
            None => None,
        };

        let state = CanonicalState {
            schema_version: SCHEMA_VERSION,
            identity_id: identity,
            // BTreeMap iteration is already (name, domain) order.
            credentials: selected.into_values().collect(),
            client_signature,
            device_hint: raw
                .device_hint
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };

        // Many essential cookies across many domains can each pass the
        // per-field limits and still add up to an unreadable snapshot.
        let encoded = serde_json::to_vec_pretty(&state).map_or(usize::MAX, |b| b.len());
        if encoded > MAX_CANONICAL_STATE_BYTES {
            return Err(ValidationError::TooLarge {
                field: "canonical state",
                limit: MAX_CANONICAL_STATE_BYTES,
            });
        }
        Ok(state)
    }
}

/// Lower-case and strip the host-only marker (`.example.com` -> `example.com`).
fn normalize_domain(domain: Option<&str>) -> String {
    domain
        .map(str::trim)
        .map(|d| d.trim_start_matches('.'))
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Trim and collapse whitespace runs; empty becomes `None`.
fn normalize_signature(ua: &str) -> Option<String> {
    let collapsed = ua.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn policy() -> CanonicalPolicy {
        CanonicalPolicy::new(["sid", "xs", "c_user"], ["sid"]).unwrap()
    }

    fn base() -> RawExtraction {
        RawExtraction::for_user("u1")
            .with_cookie(RawCookie::new("sid", "abc").with_domain(".Example.com"))
            .with_cookie(RawCookie::new("xs", "42").with_domain("example.com"))
    }

    #[test]
    fn keeps_only_allow_listed_tokens() {
        let raw = base()
            .with_cookie(RawCookie::new("presence", "p1"))
            .with_cookie(RawCookie::new("wd", "1280x720"));
        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();

        let names: Vec<_> = state.credentials.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["sid", "xs"]);
        assert_eq!(state.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn excluded_fields_do_not_change_state() {
        let canon = Canonicalizer::new(policy());
        let a = canon.canonicalize(&base()).unwrap();

        let mut noisy = base().with_cookie(RawCookie::new("presence", "changes-every-load"));
        noisy
            .local_storage
            .insert("last_seen".into(), serde_json::json!(1_700_000_000));
        noisy.source = Some("tab-7".into());
        noisy.captured_at = Some(Utc::now());
        let b = canon.canonicalize(&noisy).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn token_order_is_irrelevant() {
        let canon = Canonicalizer::new(policy());
        let forward = base();
        let mut reversed = base();
        reversed.cookies.reverse();
        assert_eq!(
            canon.canonicalize(&forward).unwrap(),
            canon.canonicalize(&reversed).unwrap()
        );
    }

    #[test]
    fn domain_is_normalized() {
        let state = Canonicalizer::new(policy()).canonicalize(&base()).unwrap();
        assert_eq!(state.credentials[0].domain, "example.com");
    }

    #[test]
    fn expiry_truncates_fraction() {
        let raw = RawExtraction::for_user("u1")
            .with_cookie(RawCookie::new("sid", "abc").with_expiry(1_760_000_000.75));
        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();
        assert_eq!(state.credentials[0].expiry, Some(1_760_000_000));
    }

    #[test]
    fn missing_identity_rejected() {
        let mut raw = base();
        raw.user_id = None;
        assert_eq!(
            Canonicalizer::new(policy()).canonicalize(&raw),
            Err(ValidationError::MissingIdentity)
        );

        raw.user_id = Some("   ".into());
        assert_eq!(
            Canonicalizer::new(policy()).canonicalize(&raw),
            Err(ValidationError::MissingIdentity)
        );
    }

    #[test]
    fn missing_required_token_rejected() {
        let raw = RawExtraction::for_user("u1").with_cookie(RawCookie::new("xs", "42"));
        assert_eq!(
            Canonicalizer::new(policy()).canonicalize(&raw),
            Err(ValidationError::MissingEssentialCredential("sid".into()))
        );
    }

    #[test]
    fn empty_required_value_rejected() {
        let raw = RawExtraction::for_user("u1").with_cookie(RawCookie::new("sid", ""));
        assert!(matches!(
            Canonicalizer::new(policy()).canonicalize(&raw),
            Err(ValidationError::MissingEssentialCredential(_))
        ));
    }

    #[test]
    fn exact_duplicates_collapse() {
        let raw = base().with_cookie(RawCookie::new("sid", "abc").with_domain("example.com"));
        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();
        assert_eq!(state.credentials.len(), 2);
    }

    #[test]
    fn conflicting_duplicates_rejected() {
        let raw = base().with_cookie(RawCookie::new("sid", "other").with_domain("example.com"));
        assert_eq!(
            Canonicalizer::new(policy()).canonicalize(&raw),
            Err(ValidationError::AmbiguousCredential("sid".into()))
        );
    }

    #[test]
    fn same_name_on_other_domain_is_distinct() {
        let raw = base().with_cookie(RawCookie::new("sid", "other").with_domain("m.example.com"));
        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();
        assert_eq!(state.credentials.len(), 3);
        assert_eq!(state.credential("sid"), Some("abc"));
    }

    #[test]
    fn volatile_flag_does_not_override_allow_list() {
        let mut raw = base();
        raw.cookies[0].volatile = true;
        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();
        assert_eq!(state.credential("sid"), Some("abc"));
    }

    #[test]
    fn signature_whitespace_collapsed() {
        let raw = base().with_user_agent("  Mozilla/5.0   (X11;  Linux)\t ");
        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();
        assert_eq!(
            state.client_signature.as_deref(),
            Some("Mozilla/5.0 (X11; Linux)")
        );

        let blank = base().with_user_agent("   ");
        let state = Canonicalizer::new(policy()).canonicalize(&blank).unwrap();
        assert_eq!(state.client_signature, None);
    }

    #[test]
    fn canonicalize_for_fills_and_checks_identity() {
        let canon = Canonicalizer::new(policy());
        let id = IdentityId::new("u1").unwrap();

        let mut anonymous = base();
        anonymous.user_id = None;
        let state = canon.canonicalize_for(&id, &anonymous).unwrap();
        assert_eq!(state.identity_id, id);

        let other = IdentityId::new("u2").unwrap();
        assert!(matches!(
            canon.canonicalize_for(&other, &base()),
            Err(ValidationError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn oversized_input_rejected() {
        let raw = RawExtraction::for_user("u1")
            .with_cookie(RawCookie::new("sid", "v".repeat(MAX_TOKEN_VALUE_LENGTH + 1)));
        assert!(matches!(
            Canonicalizer::new(policy()).canonicalize(&raw),
            Err(ValidationError::TooLarge { .. })
        ));
    }

    #[test]
    fn many_essential_cookies_exceed_state_limit() {
        // Each cookie passes the per-field checks; together they do not.
        let value = "v".repeat(MAX_TOKEN_VALUE_LENGTH);
        let raw = (0..200).fold(RawExtraction::for_user("u1"), |raw, i| {
            raw.with_cookie(
                RawCookie::new("sid", value.clone()).with_domain(format!("d{i}.example.com")),
            )
        });

        match Canonicalizer::new(policy()).canonicalize(&raw) {
            Err(ValidationError::TooLarge { field, limit }) => {
                assert_eq!(field, "canonical state");
                assert_eq!(limit, MAX_CANONICAL_STATE_BYTES);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn a_few_full_size_cookies_still_fit() {
        let value = "v".repeat(MAX_TOKEN_VALUE_LENGTH);
        let raw = (0..8).fold(RawExtraction::for_user("u1"), |raw, i| {
            raw.with_cookie(
                RawCookie::new("sid", value.clone()).with_domain(format!("d{i}.example.com")),
            )
        });

        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();
        assert_eq!(state.credentials.len(), 8);
    }

    #[test]
    fn policy_requires_subset() {
        assert!(CanonicalPolicy::new(["sid"], ["xs"]).is_err());
        assert!(CanonicalPolicy::new(Vec::<String>::new(), Vec::<String>::new()).is_err());
    }

    #[test]
    fn raw_accepts_extension_aliases() {
        let json = serde_json::json!({
            "activeSessionId": "u1",
            "cookies": [{"name": "sid", "value": "a", "domain": ".example.com",
                         "expirationDate": 1760000000.5, "httpOnly": true}],
            "localStorage": {"k": "v"},
            "userAgent": "UA",
            "timestamp": "2026-01-02T03:04:05Z"
        });
        let raw: RawExtraction = serde_json::from_value(json).unwrap();
        assert_eq!(raw.user_id.as_deref(), Some("u1"));
        assert!(raw.captured_at.is_some());
        assert_eq!(raw.cookies.len(), 1);
    }

    #[test]
    fn raw_accepts_bare_id_field() {
        let json = serde_json::json!({
            "id": "u1",
            "cookies": [{"name": "sid", "value": "a"}]
        });
        let raw: RawExtraction = serde_json::from_value(json).unwrap();
        assert_eq!(raw.user_id.as_deref(), Some("u1"));

        let state = Canonicalizer::new(policy()).canonicalize(&raw).unwrap();
        assert_eq!(state.identity_id.as_str(), "u1");
    }
}
