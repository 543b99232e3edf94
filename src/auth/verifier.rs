//! Bearer token verification.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no trust) to read `alg` and `kid`.
//! 2. Reject a token whose unverified `exp` has passed. This can only
//!    reject, and it spares the key cache a lookup for dead tokens.
//! 3. Reject any algorithm other than RS256, including names the JWT library
//!    does not know (`none`), before touching the key cache.
//! 4. Resolve the signing key via [`KeySetCache`] (one refresh on miss).
//! 5. Verify the signature.
//! 6. Check `exp` and `nbf` against the current time with zero leeway.
//! 7. Check `iss` equals the configured issuer exactly.
//! 8. Check `aud` (string or array) contains the configured audience.
//! 9. Normalize scopes and resolve the subject (see [`claims`](super::claims)).
//!
//! Apart from the key cache, verification is a pure function of the token
//! and the clock.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::Serialize;
use tracing::debug;

use super::claims::{self, Claims};
use super::jwks::{KeyLookupError, KeySetCache, KeySetError};

/// The only signing algorithm accepted.
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::RS256;

/// Signature-only validation; temporal, issuer and audience checks are done
/// by hand so each failure maps to its own error.
static SIGNATURE_ONLY: LazyLock<Validation> = LazyLock::new(|| {
    let mut v = Validation::new(SIGNING_ALGORITHM);
    v.validate_exp = false;
    v.validate_nbf = false;
    v.validate_aud = false;
    v.required_spec_claims.clear();
    v.leeway = 0;
    v
});

/// Reasons a bearer token is not accepted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    /// Not a structurally valid JWT, or a required claim is missing/mistyped.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// The header declares an algorithm other than RS256.
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The authority does not publish the key the token claims to be signed with.
    #[error("Unknown signing key: {0}")]
    UnknownSigningKey(String),

    /// The signature does not verify against the resolved key.
    #[error("Token signature is invalid")]
    SignatureInvalid,

    /// `exp` is at or before the current time.
    #[error("Token has expired")]
    Expired,

    /// `nbf` is after the current time.
    #[error("Token is not yet valid")]
    NotYetValid,

    /// `iss` does not equal the trusted issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer
        expected: String,
        /// Issuer found in the token
        actual: String,
    },

    /// `aud` does not contain the expected audience.
    #[error("Audience mismatch: expected {expected}")]
    AudienceMismatch {
        /// Configured audience
        expected: String,
    },

    /// None of the subject claims is present.
    #[error("Token carries no subject identifier")]
    NoSubjectIdentifier,

    /// The signing keys could not be fetched; trust cannot be evaluated.
    #[error("Identity authority unavailable: {0}")]
    AuthorityUnavailable(#[source] KeySetError),
}

impl VerifyError {
    /// Only an unavailable authority is worth retrying; every other failure
    /// is final for the presented token.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AuthorityUnavailable(_))
    }

    /// Stable label for logs and audit events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedToken(_) => "malformed_token",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::UnknownSigningKey(_) => "unknown_signing_key",
            Self::SignatureInvalid => "signature_invalid",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::IssuerMismatch { .. } => "issuer_mismatch",
            Self::AudienceMismatch { .. } => "audience_mismatch",
            Self::NoSubjectIdentifier => "no_subject_identifier",
            Self::AuthorityUnavailable(_) => "authority_unavailable",
        }
    }
}

impl From<KeyLookupError> for VerifyError {
    fn from(e: KeyLookupError) -> Self {
        match e {
            KeyLookupError::NotFound(kid) => Self::UnknownSigningKey(kid),
            KeyLookupError::Unavailable(e) => Self::AuthorityUnavailable(e),
        }
    }
}

/// Identity extracted from a verified bearer token.
#[derive(Clone, PartialEq, Serialize)]
pub struct VerifiedIdentity {
    /// Subject identifier (see [`claims::SUBJECT_CLAIMS`] for precedence).
    pub subject: String,
    /// The raw bearer token, kept for delegation. Never serialized.
    #[serde(skip)]
    pub token: String,
    /// Token expiry.
    pub expires_at: DateTime<Utc>,
    /// Granted scopes from `scp` and `roles`.
    pub scopes: BTreeSet<String>,
    /// Authorized party (`azp` / `appid`), if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Issuer.
    pub issuer: String,
    /// All claims, as decoded.
    #[serde(skip)]
    pub claims: Claims,
}

impl VerifiedIdentity {
    /// `true` if `scope` was granted.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Time left before expiry, relative to `now` (negative once expired).
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> TimeDelta {
        self.expires_at - now
    }
}

impl std::fmt::Debug for VerifiedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifiedIdentity")
            .field("subject", &self.subject)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Validates bearer tokens against one trusted issuer and audience.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    keys: KeySetCache,
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    /// Create a verifier using `keys` as its signing-key source.
    #[must_use]
    pub fn new(keys: KeySetCache, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// The key cache backing this verifier.
    #[must_use]
    pub fn key_cache(&self) -> &KeySetCache {
        &self.keys
    }

    /// Trusted issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Expected audience.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Verify `token` against the current time.
    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        self.verify_at(token, Utc::now()).await
    }

    /// Verify `token` as of `now`.
    pub async fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedIdentity, VerifyError> {
        let raw_header = claims::unverified_header(token).ok_or_else(|| {
            VerifyError::MalformedToken("JWT header is not base64url-encoded JSON".to_string())
        })?;

        if claims::unverified(token)
            .and_then(|c| claims::numeric_date(&c, "exp"))
            .is_some_and(|exp| exp <= now.timestamp())
        {
            return Err(VerifyError::Expired);
        }

        match raw_header.get("alg").and_then(serde_json::Value::as_str) {
            Some(alg) if alg.parse::<Algorithm>().ok() == Some(SIGNING_ALGORITHM) => {}
            Some(alg) => return Err(VerifyError::UnsupportedAlgorithm(alg.to_string())),
            None => {
                return Err(VerifyError::MalformedToken(
                    "JWT header has no 'alg'".to_string(),
                ));
            }
        }

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| VerifyError::MalformedToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::MalformedToken("JWT header has no 'kid'".to_string()))?;

        let key = self.keys.get_key(&kid).await?;

        let claims = jsonwebtoken::decode::<Claims>(token, &key, &SIGNATURE_ONLY)
            .map_err(map_jwt_error)?
            .claims;

        let expires_at = check_temporal(&claims, now)?;
        self.check_issuer(&claims)?;
        if !claims::audience_contains(&claims, &self.audience) {
            return Err(VerifyError::AudienceMismatch {
                expected: self.audience.clone(),
            });
        }

        let scopes = claims::scopes(&claims);
        let subject = claims::subject(&claims).ok_or(VerifyError::NoSubjectIdentifier)?;
        let client_id = claims::client_id(&claims);

        debug!(subject = %subject, kid = %kid, scopes = ?scopes, "Token verified");

        Ok(VerifiedIdentity {
            subject,
            token: token.to_string(),
            expires_at,
            scopes,
            client_id,
            issuer: self.issuer.clone(),
            claims,
        })
    }

    fn check_issuer(&self, claims: &Claims) -> Result<(), VerifyError> {
        match claims.get("iss").and_then(serde_json::Value::as_str) {
            Some(iss) if iss == self.issuer => Ok(()),
            other => Err(VerifyError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: other.unwrap_or("<missing>").to_string(),
            }),
        }
    }
}

/// Strict `exp` / `nbf` check. Returns the expiry instant.
fn check_temporal(claims: &Claims, now: DateTime<Utc>) -> Result<DateTime<Utc>, VerifyError> {
    let exp = claims::numeric_date(claims, "exp")
        .ok_or_else(|| VerifyError::MalformedToken("missing or non-numeric 'exp'".to_string()))?;
    let expires_at = DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| VerifyError::MalformedToken("'exp' out of range".to_string()))?;
    if expires_at <= now {
        return Err(VerifyError::Expired);
    }

    if claims.contains_key("nbf") {
        let nbf = claims::numeric_date(claims, "nbf")
            .ok_or_else(|| VerifyError::MalformedToken("non-numeric 'nbf'".to_string()))?;
        if nbf > now.timestamp() {
            return Err(VerifyError::NotYetValid);
        }
    }

    Ok(expires_at)
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> VerifyError {
    match e.kind() {
        ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
        ErrorKind::InvalidAlgorithm => VerifyError::UnsupportedAlgorithm(e.to_string()),
        _ => VerifyError::MalformedToken(e.to_string()),
    }
}
