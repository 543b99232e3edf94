//! On-Behalf-Of token exchange.
//!
//! Exchanges a user's access token for a token scoped to a downstream API
//! using the JWT-bearer grant with `requested_token_use=on_behalf_of`.
//!
//! The exchanger authenticates itself with exactly one [`CredentialStrategy`],
//! chosen once at construction:
//!
//! - **Client secret**: a static `client_secret` form parameter.
//! - **Federated**: a managed identity token obtained from a
//!   [`WorkloadIdentitySource`] and sent as a `client_assertion`. Failure to
//!   get that token is reported as [`ExchangeError::WorkloadIdentity`], separate
//!   from failures of the exchange itself.
//!
//! Delegated tokens are never cached; every call performs a fresh exchange.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::claims;
use super::expiry::{ExpiryGuard, TokenExpiringSoon};
use super::identity::{WorkloadIdentityError, WorkloadIdentitySource};
use super::verifier::VerifiedIdentity;

/// JWT-bearer authorization grant (RFC 7523).
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Client assertion type for federated credentials.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Marker value for the On-Behalf-Of flow.
pub const ON_BEHALF_OF: &str = "on_behalf_of";

/// Authority error code for missing user or admin consent.
const CONSENT_REQUIRED_CODE: i64 = 65001;

/// Reasons a delegation attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The user assertion is too close to expiry; no request was sent.
    #[error("Assertion rejected before exchange: {0}")]
    ExpiringAssertion(#[from] TokenExpiringSoon),

    /// Step one of the federated strategy: no local identity token.
    #[error("Could not obtain workload identity token: {0}")]
    WorkloadIdentity(#[from] WorkloadIdentityError),

    /// Token endpoint unreachable or timed out.
    #[error("OBO network error: {0}")]
    ExchangeNetworkError(#[source] reqwest::Error),

    /// The authority answered with an error payload.
    #[error("OBO exchange rejected (HTTP {status}): {error} - {description}")]
    ExchangeRejected {
        /// HTTP status code
        status: u16,
        /// OAuth `error` code
        error: String,
        /// OAuth `error_description`
        description: String,
        /// Authority-specific numeric codes (`error_codes`)
        error_codes: Vec<i64>,
    },

    /// Success status, but no usable token or expiry in the body.
    #[error("Malformed OBO response: {0}")]
    MalformedExchangeResponse(String),
}

impl ExchangeError {
    /// Transient faults: network errors, identity endpoint failures,
    /// throttling and server errors.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExchangeNetworkError(_) => true,
            Self::WorkloadIdentity(e) => !matches!(e, WorkloadIdentityError::Malformed(_)),
            Self::ExchangeRejected { status, .. } => *status == 429 || *status >= 500,
            Self::ExpiringAssertion(_) | Self::MalformedExchangeResponse(_) => false,
        }
    }

    /// The authority reports that the user has not consented to the
    /// downstream permission.
    #[must_use]
    pub fn is_consent_required(&self) -> bool {
        match self {
            Self::ExchangeRejected {
                description,
                error_codes,
                ..
            } => {
                error_codes.contains(&CONSENT_REQUIRED_CODE)
                    || description.contains("AADSTS65001")
                    || description.contains("has not consented")
            }
            _ => false,
        }
    }

    /// The user has to sign in again (or grant consent) before retrying.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            Self::ExpiringAssertion(_) => true,
            Self::ExchangeRejected { error, .. } => {
                error == "invalid_grant" || self.is_consent_required()
            }
            _ => false,
        }
    }

    /// Stable label for logs and audit events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExpiringAssertion(_) => "expiring_assertion",
            Self::WorkloadIdentity(_) => "workload_identity_unavailable",
            Self::ExchangeNetworkError(_) => "exchange_network_error",
            Self::ExchangeRejected { .. } => "exchange_rejected",
            Self::MalformedExchangeResponse(_) => "malformed_exchange_response",
        }
    }
}

/// How the exchanger authenticates itself to the token endpoint.
#[derive(Clone)]
pub enum CredentialStrategy {
    /// Static client secret.
    ClientSecret {
        /// The secret value
        secret: String,
    },
    /// Managed identity token used as a client assertion.
    Federated {
        /// Local identity token source
        source: Arc<dyn WorkloadIdentitySource>,
    },
}

impl CredentialStrategy {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientSecret { .. } => "client_secret",
            Self::Federated { .. } => "federated_credential",
        }
    }

    /// Client-authentication form parameters for one exchange.
    async fn client_auth(&self) -> Result<Vec<(&'static str, String)>, ExchangeError> {
        match self {
            Self::ClientSecret { secret } => Ok(vec![("client_secret", secret.clone())]),
            Self::Federated { source } => {
                let assertion = source.identity_token().await.inspect_err(|e| {
                    error!(error = %e, "Failed to obtain managed identity token for OBO");
                })?;
                Ok(vec![
                    ("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()),
                    ("client_assertion", assertion),
                ])
            }
        }
    }
}

impl std::fmt::Debug for CredentialStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientSecret { .. } => f.write_str("ClientSecret(<redacted>)"),
            Self::Federated { .. } => f.write_str("Federated"),
        }
    }
}

/// Input to one exchange.
#[derive(Clone, Copy)]
pub struct DelegationRequest<'a> {
    /// The caller's bearer token.
    pub assertion: &'a str,
    /// Downstream scope, e.g. `https://graph.microsoft.com/User.Read`.
    pub scope: &'a str,
}

/// A downstream access token obtained on the user's behalf.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegationResult {
    /// Downstream access token.
    pub access_token: String,
    /// Expiry computed from `expires_in` at receipt.
    pub expires_at: DateTime<Utc>,
    /// `token_type`, if reported.
    pub token_type: Option<String>,
    /// Granted scope, if reported.
    pub scope: Option<String>,
}

impl std::fmt::Debug for DelegationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationResult")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Successful token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Error payload (`error` / `error_description`).
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error_codes: Vec<i64>,
}

/// Performs On-Behalf-Of exchanges against one token endpoint.
pub struct DelegatedTokenExchanger {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    strategy: CredentialStrategy,
    guard: ExpiryGuard,
}

impl DelegatedTokenExchanger {
    /// Create an exchanger.
    ///
    /// `http` should carry the exchange timeout.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        strategy: CredentialStrategy,
        guard: ExpiryGuard,
    ) -> Self {
        Self {
            http,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            strategy,
            guard,
        }
    }

    /// The strategy chosen at construction.
    #[must_use]
    pub fn strategy(&self) -> &CredentialStrategy {
        &self.strategy
    }

    /// Token endpoint URL.
    #[must_use]
    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    /// Exchange a verified identity's token for a `scope` token.
    pub async fn exchange(
        &self,
        identity: &VerifiedIdentity,
        scope: &str,
    ) -> Result<DelegationResult, ExchangeError> {
        self.guard.ensure_delegable(identity)?;
        self.perform(DelegationRequest {
            assertion: &identity.token,
            scope,
        })
        .await
    }

    /// Exchange a raw bearer string.
    ///
    /// The assertion's `exp` is read without verification for the expiry
    /// guard. If it cannot be read the guard is skipped and the authority
    /// decides.
    pub async fn exchange_assertion(
        &self,
        assertion: &str,
        scope: &str,
    ) -> Result<DelegationResult, ExchangeError> {
        match unverified_expiry(assertion) {
            Some(expires_at) => self.guard.ensure_expiry_at(expires_at, Utc::now())?,
            None => warn!("Could not decode assertion token for expiry check"),
        }
        self.perform(DelegationRequest { assertion, scope }).await
    }

    async fn perform(&self, request: DelegationRequest<'_>) -> Result<DelegationResult, ExchangeError> {
        let strategy = self.strategy.name();
        info!(scope = %request.scope, strategy, "Initiating OBO token exchange");
        let start = Instant::now();

        let mut form: Vec<(&str, String)> = vec![
            ("client_id", self.client_id.clone()),
            ("grant_type", JWT_BEARER_GRANT.to_string()),
            ("requested_token_use", ON_BEHALF_OF.to_string()),
            ("scope", request.scope.to_string()),
            ("assertion", request.assertion.to_string()),
        ];
        form.extend(self.strategy.client_auth().await?);

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, strategy, "Network error during OBO");
                ExchangeError::ExchangeNetworkError(e)
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(ExchangeError::ExchangeNetworkError)?;
        let latency_ms = start.elapsed().as_millis();

        if !status.is_success() {
            let err = rejection(status.as_u16(), &body);
            if err.is_consent_required() {
                error!(
                    status = status.as_u16(),
                    latency_ms,
                    scope = %request.scope,
                    "OBO exchange failed: user has not consented to the downstream permission; \
                     grant '{}' as a delegated API permission, then re-authenticate",
                    request.scope
                );
            } else if status.as_u16() == 429 {
                error!(latency_ms, error = %err, "OBO exchange rate limited");
            } else {
                error!(status = status.as_u16(), latency_ms, error = %err, strategy, "OBO exchange failed");
            }
            return Err(err);
        }

        let result = parse_success(&body, Utc::now())?;
        info!(latency_ms, strategy, expires_at = %result.expires_at, "OBO token exchange successful");
        Ok(result)
    }
}

impl std::fmt::Debug for DelegatedTokenExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedTokenExchanger")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("strategy", &self.strategy)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Build a [`DelegationResult`] from a success body received at `now`.
fn parse_success(body: &[u8], now: DateTime<Utc>) -> Result<DelegationResult, ExchangeError> {
    let parsed: TokenResponse = serde_json::from_slice(body)
        .map_err(|e| ExchangeError::MalformedExchangeResponse(e.to_string()))?;

    let access_token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ExchangeError::MalformedExchangeResponse("missing access_token".to_string()))?;

    let expires_in = parsed
        .expires_in
        .as_ref()
        .and_then(seconds_value)
        .ok_or_else(|| {
            ExchangeError::MalformedExchangeResponse("missing or invalid expires_in".to_string())
        })?;

    let expires_at = TimeDelta::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            ExchangeError::MalformedExchangeResponse("expires_in out of range".to_string())
        })?;

    Ok(DelegationResult {
        access_token,
        expires_at,
        token_type: parsed.token_type,
        scope: parsed.scope,
    })
}

/// `expires_in` arrives as a number or, from older endpoints, a numeric string.
fn seconds_value(v: &serde_json::Value) -> Option<i64> {
    match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|secs| *secs >= 0)
}

fn rejection(status: u16, body: &[u8]) -> ExchangeError {
    let parsed: ErrorResponse = serde_json::from_slice(body).unwrap_or_default();
    let description = parsed
        .error_description
        .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(256).collect());
    ExchangeError::ExchangeRejected {
        status,
        error: parsed.error.unwrap_or_else(|| "unknown".to_string()),
        description,
        error_codes: parsed.error_codes,
    }
}

/// Read `exp` from a JWT payload without verifying anything.
fn unverified_expiry(token: &str) -> Option<DateTime<Utc>> {
    let claims = claims::unverified(token)?;
    let exp = claims::numeric_date(&claims, "exp")?;
    debug!(exp, "Read unverified assertion expiry");
    DateTime::from_timestamp(exp, 0)
}
