//! Audit logging for verification and delegation outcomes.
//!
//! Every event is emitted via `tracing::info!` with a JSON `audit` field so
//! the trail can be extracted by any log aggregator. Raw tokens are never part
//! of an event.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.verified` | A bearer token passed verification |
//! | `token.rejected` | A bearer token failed verification |
//! | `authority.unavailable` | Signing keys could not be fetched |
//! | `delegation.issued` | An On-Behalf-Of exchange succeeded |
//! | `delegation.failed` | An On-Behalf-Of exchange failed |

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::obo::{DelegationResult, ExchangeError};
use super::verifier::{VerifiedIdentity, VerifyError};

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.verified"`).
    pub event: &'static str,
    /// Subject of the caller, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Authorized party of the caller's token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Granted scopes (for `token.verified`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Downstream scope requested (for delegation events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream_scope: Option<String>,
    /// Token expiry (caller token or delegated token).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Stable failure label (`VerifyError::kind` / `ExchangeError::kind`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    /// Human-readable reason for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            subject: None,
            client_id: None,
            scopes: None,
            downstream_scope: None,
            expires_at: None,
            kind: None,
            reason: None,
        }
    }

    /// Construct a `token.verified` event.
    #[must_use]
    pub fn verified(identity: &VerifiedIdentity) -> Self {
        Self {
            subject: Some(identity.subject.clone()),
            client_id: identity.client_id.clone(),
            scopes: Some(identity.scopes.iter().cloned().collect()),
            expires_at: Some(identity.expires_at),
            ..Self::bare("token.verified")
        }
    }

    /// Construct a `token.rejected` or `authority.unavailable` event.
    #[must_use]
    pub fn rejected(error: &VerifyError) -> Self {
        let event = if matches!(error, VerifyError::AuthorityUnavailable(_)) {
            "authority.unavailable"
        } else {
            "token.rejected"
        };
        Self {
            kind: Some(error.kind()),
            reason: Some(error.to_string()),
            ..Self::bare(event)
        }
    }

    /// Construct a `delegation.issued` event.
    #[must_use]
    pub fn delegation_issued(subject: Option<&str>, scope: &str, result: &DelegationResult) -> Self {
        Self {
            subject: subject.map(str::to_string),
            downstream_scope: Some(scope.to_string()),
            expires_at: Some(result.expires_at),
            ..Self::bare("delegation.issued")
        }
    }

    /// Construct a `delegation.failed` event.
    #[must_use]
    pub fn delegation_failed(subject: Option<&str>, scope: &str, error: &ExchangeError) -> Self {
        Self {
            subject: subject.map(str::to_string),
            downstream_scope: Some(scope.to_string()),
            kind: Some(error.kind()),
            reason: Some(error.to_string()),
            ..Self::bare("delegation.failed")
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO mcp_delegated_auth::auth::audit: auth audit audit={"event":"token.verified",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "auth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
