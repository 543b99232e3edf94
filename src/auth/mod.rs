//! Bearer token verification and On-Behalf-Of delegation.
//!
//! Two operations make up the inbound contract, both exposed by
//! [`AuthService`]:
//!
//! - [`AuthService::verify`]: bearer token to [`VerifiedIdentity`], with
//!   signing keys served from a [`KeySetCache`].
//! - [`AuthService::exchange`]: verified identity to a downstream
//!   [`DelegationResult`] through a [`DelegatedTokenExchanger`].
//!
//! Every outcome is written to the audit trail (see [`audit`]).

pub mod audit;
pub mod claims;
pub mod expiry;
pub mod identity;
pub mod jwks;
pub mod obo;
pub mod verifier;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use expiry::{ExpiryGuard, TokenExpiringSoon};
pub use identity::{IdentityEndpoint, ManagedIdentitySource, WorkloadIdentityError, WorkloadIdentitySource};
pub use jwks::{KeyLookupError, KeySetCache, KeySetError, SigningKeySet};
pub use obo::{CredentialStrategy, DelegatedTokenExchanger, DelegationRequest, DelegationResult, ExchangeError};
pub use verifier::{TokenVerifier, VerifiedIdentity, VerifyError};

use crate::config::{CredentialSettings, ResolvedAuthConfig};
use audit::AuditEvent;

/// Extract the token from an `Authorization` header value.
///
/// Accepts the `Bearer` scheme in any case; anything else is `None`.
#[must_use]
pub fn bearer_from_header(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// HTTP client for authority calls, bounded by `timeout`.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Verifier and exchanger wired together, with audit logging.
#[derive(Debug)]
pub struct AuthService {
    verifier: TokenVerifier,
    exchanger: DelegatedTokenExchanger,
    downstream_scope: String,
}

impl AuthService {
    /// Assemble from parts.
    #[must_use]
    pub fn new(
        verifier: TokenVerifier,
        exchanger: DelegatedTokenExchanger,
        downstream_scope: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            exchanger,
            downstream_scope: downstream_scope.into(),
        }
    }

    /// Build the service from resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_config(config: &ResolvedAuthConfig) -> crate::Result<Self> {
        let keys = KeySetCache::new(
            http_client(config.jwks_timeout)?,
            config.jwks_uri.clone(),
            config.jwks_ttl,
        );
        let verifier = TokenVerifier::new(keys, config.issuer.clone(), config.audience.clone());

        let exchange_http = http_client(config.exchange_timeout)?;
        let strategy = match &config.credential {
            CredentialSettings::ClientSecret(secret) => CredentialStrategy::ClientSecret {
                secret: secret.clone(),
            },
            CredentialSettings::Federated {
                client_id,
                identity_endpoint,
                audience,
            } => {
                let endpoint = identity_endpoint
                    .clone()
                    .map_or_else(IdentityEndpoint::from_env, |url| IdentityEndpoint::Imds { url });
                CredentialStrategy::Federated {
                    source: Arc::new(ManagedIdentitySource::new(
                        exchange_http.clone(),
                        endpoint,
                        client_id.clone(),
                        audience.clone(),
                    )),
                }
            }
        };
        info!(
            strategy = strategy.name(),
            issuer = %config.issuer,
            jwks_uri = %config.jwks_uri,
            "Auth service configured"
        );

        let exchanger = DelegatedTokenExchanger::new(
            exchange_http,
            config.token_endpoint.clone(),
            config.client_id.clone(),
            strategy,
            ExpiryGuard::new(config.delegation_margin),
        );

        Ok(Self::new(verifier, exchanger, config.downstream_scope.clone()))
    }

    /// The token verifier.
    #[must_use]
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// The delegated token exchanger.
    #[must_use]
    pub fn exchanger(&self) -> &DelegatedTokenExchanger {
        &self.exchanger
    }

    /// Scope used when the caller does not name one.
    #[must_use]
    pub fn downstream_scope(&self) -> &str {
        &self.downstream_scope
    }

    /// Verify a bearer token.
    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        let outcome = self.verifier.verify(token).await;
        match &outcome {
            Ok(identity) => audit::emit(&AuditEvent::verified(identity)),
            Err(e) => audit::emit(&AuditEvent::rejected(e)),
        }
        outcome
    }

    /// Verify the token carried in an `Authorization` header value.
    pub async fn verify_header(&self, header: &str) -> Result<VerifiedIdentity, VerifyError> {
        match bearer_from_header(header) {
            Some(token) => self.verify(token).await,
            None => {
                let err = VerifyError::MalformedToken("expected 'Bearer <token>'".to_string());
                audit::emit(&AuditEvent::rejected(&err));
                Err(err)
            }
        }
    }

    /// Exchange a verified identity for a downstream token.
    ///
    /// `scope` defaults to the configured downstream scope.
    pub async fn exchange(
        &self,
        identity: &VerifiedIdentity,
        scope: Option<&str>,
    ) -> Result<DelegationResult, ExchangeError> {
        let scope = scope.unwrap_or(&self.downstream_scope);
        let outcome = self.exchanger.exchange(identity, scope).await;
        Self::audit_delegation(Some(&identity.subject), scope, &outcome);
        outcome
    }

    /// Exchange a raw, unverified assertion for a downstream token.
    pub async fn exchange_assertion(
        &self,
        assertion: &str,
        scope: Option<&str>,
    ) -> Result<DelegationResult, ExchangeError> {
        let scope = scope.unwrap_or(&self.downstream_scope);
        let outcome = self.exchanger.exchange_assertion(assertion, scope).await;
        Self::audit_delegation(None, scope, &outcome);
        outcome
    }

    fn audit_delegation(
        subject: Option<&str>,
        scope: &str,
        outcome: &Result<DelegationResult, ExchangeError>,
    ) {
        let event = match outcome {
            Ok(result) => AuditEvent::delegation_issued(subject, scope, result),
            Err(e) => AuditEvent::delegation_failed(subject, scope, e),
        };
        audit::emit(&event);
    }
}
