//! Local workload identity, the service's own short-lived token.
//!
//! Used by the federated credential strategy: the token obtained here is
//! presented to the authority as a client assertion instead of a static
//! secret. Two managed-identity endpoints are supported:
//!
//! - **App Service / Container Apps**: `IDENTITY_ENDPOINT` + `IDENTITY_HEADER`
//!   environment variables, api-version `2019-08-01`.
//! - **Instance metadata (IMDS)**: fixed link-local endpoint, api-version
//!   `2018-02-01`, `Metadata: true` header.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Audience of the identity token used as a client assertion.
pub const TOKEN_EXCHANGE_AUDIENCE: &str = "api://AzureADTokenExchange";

/// Instance metadata token endpoint.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Failure to obtain the local identity token (step one of the federated
/// strategy).
#[derive(Debug, thiserror::Error)]
pub enum WorkloadIdentityError {
    /// Identity endpoint unreachable or timed out.
    #[error("Managed identity endpoint unreachable: {0}")]
    Network(#[source] reqwest::Error),

    /// Identity endpoint refused the request.
    #[error("Managed identity endpoint returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The response carried no usable token.
    #[error("Malformed managed identity response: {0}")]
    Malformed(String),
}

/// Source of the service's own identity token.
#[async_trait]
pub trait WorkloadIdentitySource: Send + Sync {
    /// Obtain a short-lived identity token for the token-exchange audience.
    async fn identity_token(&self) -> Result<String, WorkloadIdentityError>;
}

/// Where the managed identity token is requested from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEndpoint {
    /// Instance metadata service.
    Imds {
        /// Token endpoint URL
        url: String,
    },
    /// App Service / Container Apps identity endpoint.
    AppService {
        /// Token endpoint URL (`IDENTITY_ENDPOINT`)
        url: String,
        /// Shared header secret (`IDENTITY_HEADER`)
        header: String,
    },
}

impl IdentityEndpoint {
    /// Detect the endpoint from the process environment, falling back to IMDS.
    #[must_use]
    pub fn from_env() -> Self {
        match (
            std::env::var("IDENTITY_ENDPOINT"),
            std::env::var("IDENTITY_HEADER"),
        ) {
            (Ok(url), Ok(header)) if !url.is_empty() => Self::AppService { url, header },
            _ => Self::Imds {
                url: IMDS_TOKEN_ENDPOINT.to_string(),
            },
        }
    }

    fn url(&self) -> &str {
        match self {
            Self::Imds { url } | Self::AppService { url, .. } => url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManagedIdentityToken {
    access_token: Option<String>,
}

/// Managed identity token source for a user-assigned identity.
pub struct ManagedIdentitySource {
    http: reqwest::Client,
    endpoint: IdentityEndpoint,
    client_id: String,
    audience: String,
}

impl ManagedIdentitySource {
    /// Create a source for the user-assigned identity `client_id`.
    ///
    /// `http` should carry the request timeout.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        endpoint: IdentityEndpoint,
        client_id: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint,
            client_id: client_id.into(),
            audience: audience.into(),
        }
    }

    /// The endpoint this source talks to.
    #[must_use]
    pub fn endpoint(&self) -> &IdentityEndpoint {
        &self.endpoint
    }
}

impl std::fmt::Debug for ManagedIdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIdentitySource")
            .field("endpoint", &self.endpoint.url())
            .field("client_id", &self.client_id)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkloadIdentitySource for ManagedIdentitySource {
    async fn identity_token(&self) -> Result<String, WorkloadIdentityError> {
        let request = match &self.endpoint {
            IdentityEndpoint::Imds { url } => self
                .http
                .get(url)
                .header("Metadata", "true")
                .query(&[("api-version", IMDS_API_VERSION)]),
            IdentityEndpoint::AppService { url, header } => self
                .http
                .get(url)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", APP_SERVICE_API_VERSION)]),
        }
        .query(&[
            ("resource", self.audience.as_str()),
            ("client_id", self.client_id.as_str()),
        ]);

        debug!(endpoint = %self.endpoint.url(), client_id = %self.client_id, "Requesting managed identity token");

        let response = request.send().await.map_err(WorkloadIdentityError::Network)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkloadIdentityError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(WorkloadIdentityError::Network)?;
        let token: ManagedIdentityToken = serde_json::from_slice(&bytes)
            .map_err(|e| WorkloadIdentityError::Malformed(e.to_string()))?;

        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| WorkloadIdentityError::Malformed("missing access_token".to_string()))
    }
}
