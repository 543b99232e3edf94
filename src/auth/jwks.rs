//! Signing key cache: fetches the authority's JWKS and serves keys by `kid`.
//!
//! # Refresh rules
//!
//! - The whole key set is replaced atomically; entries are never patched.
//! - A lookup refreshes when no set is cached, the cached set is older than
//!   its TTL, or the requested `kid` is absent. At most one refresh happens
//!   per lookup; a `kid` still missing afterwards is [`KeyLookupError::NotFound`].
//! - Concurrent refreshes are coalesced: the first caller installs a shared
//!   in-flight future and every other caller awaits that same future. No lock
//!   is held across the network call.
//! - A fetch failure is [`KeyLookupError::Unavailable`], never `NotFound`.
//!
//! A refresh runs on its own task, so a waiter that gives up (for example on
//! a caller timeout) neither stalls the fetch nor leaves it parked for later
//! callers. The new set is only published once it has been fully parsed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::DecodingKey;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Default lifetime of a fetched key set.
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(3600);

/// Failure to obtain a usable key set from the discovery endpoint.
///
/// `Clone` so every coalesced waiter receives the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeySetError {
    /// Network error or timeout while fetching.
    #[error("JWKS fetch failed: {0}")]
    Network(#[source] Arc<reqwest::Error>),

    /// The endpoint answered with a non-success status.
    #[error("JWKS endpoint returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// The response was not a key set document.
    #[error("Malformed JWKS document: {0}")]
    Malformed(String),

    /// The refresh task ended without a result (panic or runtime shutdown).
    #[error("JWKS refresh interrupted: {0}")]
    Interrupted(String),
}

/// Result of a key lookup that did not yield a key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyLookupError {
    /// The authority does not currently publish this key id.
    #[error("Signing key not found: {0}")]
    NotFound(String),

    /// The key set could not be fetched; trust cannot be evaluated right now.
    #[error(transparent)]
    Unavailable(#[from] KeySetError),
}

/// An immutable snapshot of the authority's signing keys.
pub struct SigningKeySet {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
    ttl: Duration,
    generation: u64,
}

impl SigningKeySet {
    /// Look up a key by id.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.get(kid).cloned()
    }

    /// `true` once the set has outlived its TTL.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }

    /// Number of usable keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// `true` if the authority published no usable RSA keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids in this set, sorted.
    #[must_use]
    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for SigningKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeySet")
            .field("kids", &self.key_ids())
            .field("generation", &self.generation)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// JWKS document as served by the discovery endpoint.
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<serde_json::Value>,
}

/// The subset of a JWK entry we accept.
#[derive(Debug, Deserialize)]
struct RsaJwk {
    kty: String,
    kid: Option<String>,
    #[serde(rename = "use")]
    key_use: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<SigningKeySet>, KeySetError>>>;

struct Inner {
    http: reqwest::Client,
    jwks_uri: String,
    ttl: Duration,
    current: RwLock<Option<Arc<SigningKeySet>>>,
    in_flight: Mutex<Option<RefreshFuture>>,
    generation: AtomicU64,
    fetches: AtomicU64,
}

/// Process-lifetime cache of the authority's signing keys.
///
/// Cheap to clone; clones share the same cache. Construct one per trust
/// anchor and hand it to the verifier.
#[derive(Clone)]
pub struct KeySetCache {
    inner: Arc<Inner>,
}

impl KeySetCache {
    /// Create an empty cache for `jwks_uri`. Nothing is fetched until the
    /// first lookup (or [`warm`](Self::warm)).
    ///
    /// `http` should carry the fetch timeout.
    #[must_use]
    pub fn new(http: reqwest::Client, jwks_uri: impl Into<String>, ttl: Duration) -> Self {
        let jwks_uri = jwks_uri.into();
        if !jwks_uri.starts_with("https://") {
            warn!(jwks_uri = %jwks_uri, "JWKS endpoint is not HTTPS");
        }
        Self {
            inner: Arc::new(Inner {
                http,
                jwks_uri,
                ttl,
                current: RwLock::new(None),
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    /// The discovery endpoint this cache reads from.
    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.inner.jwks_uri
    }

    /// Resolve a signing key by `kid`, refreshing the set at most once.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, KeyLookupError> {
        let observed = self.snapshot();
        if let Some(set) = observed.as_ref().filter(|s| !s.is_stale()) {
            if let Some(key) = set.get(kid) {
                return Ok(key);
            }
            debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        }

        let set = self
            .refresh_after(observed.as_ref().map(|s| s.generation))
            .await?;
        set.get(kid).ok_or_else(|| {
            warn!(kid = %kid, available = ?set.key_ids(), "Signing key not published by authority");
            KeyLookupError::NotFound(kid.to_string())
        })
    }

    /// Fetch the key set eagerly. Failures are logged, not returned.
    pub async fn warm(&self) -> bool {
        match self.refresh_after(None).await {
            Ok(set) => {
                info!(jwks_uri = %self.inner.jwks_uri, kid_count = set.len(), "JWKS cache warmed");
                true
            }
            Err(e) => {
                warn!(jwks_uri = %self.inner.jwks_uri, error = %e, "Failed to warm JWKS cache (will retry on first token)");
                false
            }
        }
    }

    /// Number of discovery fetches started so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Key ids in the currently cached set (empty if nothing is cached).
    #[must_use]
    pub fn cached_key_ids(&self) -> Vec<String> {
        self.snapshot().map(|s| s.key_ids()).unwrap_or_default()
    }

    fn snapshot(&self) -> Option<Arc<SigningKeySet>> {
        self.inner.current.read().clone()
    }

    /// Join or start a refresh.
    ///
    /// `observed` is the generation the caller looked at before deciding to
    /// refresh. If a fresh set with a different generation has been
    /// published since, it is returned without fetching again.
    async fn refresh_after(
        &self,
        observed: Option<u64>,
    ) -> Result<Arc<SigningKeySet>, KeySetError> {
        let refresh = {
            let mut slot = self.inner.in_flight.lock();
            if let Some(current) = self.inner.current.read().clone() {
                if Some(current.generation) != observed && !current.is_stale() {
                    return Ok(current);
                }
            }
            if let Some(pending) = slot.as_ref() {
                debug!("Joining in-flight JWKS refresh");
                pending.clone()
            } else {
                let task = tokio::spawn(Self::fetch_and_publish(Arc::clone(&self.inner)));
                let inner = Arc::clone(&self.inner);
                let pending = async move {
                    task.await.unwrap_or_else(|e| {
                        *inner.in_flight.lock() = None;
                        Err(KeySetError::Interrupted(e.to_string()))
                    })
                }
                .boxed()
                .shared();
                *slot = Some(pending.clone());
                pending
            }
        };
        refresh.await
    }

    async fn fetch_and_publish(inner: Arc<Inner>) -> Result<Arc<SigningKeySet>, KeySetError> {
        let result = Self::fetch(&inner).await.map(Arc::new);
        match &result {
            Ok(set) => {
                *inner.current.write() = Some(Arc::clone(set));
                info!(
                    jwks_uri = %inner.jwks_uri,
                    kid_count = set.len(),
                    generation = set.generation,
                    "JWKS refreshed"
                );
            }
            Err(e) => warn!(jwks_uri = %inner.jwks_uri, error = %e, "JWKS refresh failed"),
        }
        *inner.in_flight.lock() = None;
        result
    }

    async fn fetch(inner: &Inner) -> Result<SigningKeySet, KeySetError> {
        inner.fetches.fetch_add(1, Ordering::SeqCst);
        debug!(jwks_uri = %inner.jwks_uri, "Fetching JWKS");

        let response = inner
            .http
            .get(&inner.jwks_uri)
            .send()
            .await
            .map_err(|e| KeySetError::Network(Arc::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KeySetError::Status {
                status: status.as_u16(),
                body: truncate(&body, 256),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| KeySetError::Network(Arc::new(e)))?;
        let keys = parse_jwks(&bytes)?;

        Ok(SigningKeySet {
            keys,
            fetched_at: Instant::now(),
            ttl: inner.ttl,
            generation: inner.generation.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }
}

impl std::fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetCache")
            .field("jwks_uri", &self.inner.jwks_uri)
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

/// Parse a JWKS document into decoding keys indexed by `kid`.
///
/// Entries that are not RSA signing keys, or lack a `kid`, are skipped.
fn parse_jwks(body: &[u8]) -> Result<HashMap<String, DecodingKey>, KeySetError> {
    let doc: JwksDocument =
        serde_json::from_slice(body).map_err(|e| KeySetError::Malformed(e.to_string()))?;

    let mut keys = HashMap::with_capacity(doc.keys.len());
    for entry in doc.keys {
        let Ok(jwk) = serde_json::from_value::<RsaJwk>(entry) else {
            debug!("Skipping unparseable JWK entry");
            continue;
        };
        if jwk.kty != "RSA" || jwk.key_use.as_deref().is_some_and(|u| u != "sig") {
            continue;
        }
        let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
            debug!("Skipping RSA JWK without kid/n/e");
            continue;
        };
        match DecodingKey::from_rsa_components(&n, &e) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(err) => warn!(kid = %kid, error = %err, "Skipping invalid RSA JWK"),
        }
    }
    Ok(keys)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
