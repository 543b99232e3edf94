//! Pre-delegation expiry guard.
//!
//! An On-Behalf-Of exchange must not start with an assertion that could
//! expire while the exchange is in flight. Tokens with less than the margin
//! left are refused so the caller re-authenticates instead.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::warn;

use super::verifier::VerifiedIdentity;

/// Default minimum remaining lifetime for a delegable token (5 minutes).
pub const DEFAULT_DELEGATION_MARGIN: Duration = Duration::from_secs(300);

/// The assertion has less than the required lifetime left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Token expiring soon ({remaining_secs}s left, need {margin_secs}s); please re-authenticate")]
pub struct TokenExpiringSoon {
    /// Seconds until expiry (may be negative).
    pub remaining_secs: i64,
    /// Required margin in seconds.
    pub margin_secs: i64,
}

/// Rejects tokens too close to expiry to delegate safely.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryGuard {
    margin: TimeDelta,
}

impl Default for ExpiryGuard {
    fn default() -> Self {
        Self::new(DEFAULT_DELEGATION_MARGIN)
    }
}

impl ExpiryGuard {
    /// Guard with a custom margin.
    #[must_use]
    pub fn new(margin: Duration) -> Self {
        Self {
            margin: TimeDelta::from_std(margin).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Configured margin.
    #[must_use]
    pub fn margin(&self) -> TimeDelta {
        self.margin
    }

    /// Check a verified identity against the current time.
    pub fn ensure_delegable(&self, identity: &VerifiedIdentity) -> Result<(), TokenExpiringSoon> {
        self.ensure_expiry_at(identity.expires_at, Utc::now())
    }

    /// Check an expiry instant as of `now`. Remaining lifetime strictly
    /// below the margin fails; exactly the margin passes.
    pub fn ensure_expiry_at(
        &self,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TokenExpiringSoon> {
        let remaining = expires_at - now;
        if remaining < self.margin {
            warn!(
                remaining_secs = remaining.num_seconds(),
                margin_secs = self.margin.num_seconds(),
                "Assertion token expiring soon"
            );
            return Err(TokenExpiringSoon {
                remaining_secs: remaining.num_seconds(),
                margin_secs: self.margin.num_seconds(),
            });
        }
        Ok(())
    }
}
