//! MCP Delegated Auth Library
//!
//! Bearer-token verification and On-Behalf-Of delegation for MCP servers that
//! sit behind an OAuth 2.0 / OpenID Connect identity authority.
//!
//! # Features
//!
//! - **Token verification**: RS256 signatures checked against a cached,
//!   rotation-aware signing key set; issuer, audience and lifetime enforced
//! - **Claim normalization**: scopes from `scp` and `roles`, subject by
//!   documented precedence
//! - **On-Behalf-Of exchange**: client secret or federated (managed identity)
//!   credentials, with an expiry guard before every exchange
//! - **Audit trail**: structured events for every verification and delegation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;

pub use auth::AuthService;
pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
