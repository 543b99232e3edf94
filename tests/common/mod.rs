//! Shared fixtures: test signing keys and an in-process mock authority.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use mcp_delegated_auth::auth::{KeySetCache, TokenVerifier, VerifiedIdentity};

/// Private key published by the mock authority as `kid-1`.
pub const SIGNING_KEY_PEM: &[u8] = include_bytes!("../fixtures/signing_key.pem");
/// Modulus of [`SIGNING_KEY_PEM`].
pub const SIGNING_KEY_N: &str = "lmFGF97OXspiF4IIaKBe225aDe292kQ4-CIdx4YVRXManHMEp3eMhwutdHTA_asikKiAPk6YbNkLNDwfJZA22pKbtDb_5JmbNymdfRtPpP5IzF1pvVUwE2jBbjtNpvPhfKLwjv-egfvSkVMueXEN9MXOj8-rzRR1scUpt5jyFHWU7hxm2PIuWNOD_HP3uqVa5aYwebewKFVk1CDOUWHfCvfopjMV8o26BAMGmo545Wly-5gs0kLlK6nTgRbceYbJngPu5Rw9u2Pj7008aeGgOpn7Z52VbWRiRvdcsjw8PMyZ4ukbICQDcbifHUAxH2XP7hLLr4IfLgj3nuUouT0dyQ";

/// A second key the authority never publishes under `kid-1`.
pub const ROGUE_KEY_PEM: &[u8] = include_bytes!("../fixtures/rogue_key.pem");
/// Modulus of [`ROGUE_KEY_PEM`].
pub const ROGUE_KEY_N: &str = "5lMedURMpLT_n9wNnYHithDsuWfBa5Yv70aW7hZ8OLu0K2PgQorU2NZJIOEL9_PQvRZZm8EWfKhAeLcqFrOTt7ThgUrr03lDOUUvmHugmE-OtDcuPD2kL4oW8_AnDG3WunYG76YAceN3cM38Tuc2ryrkrDTwdMuvBLkie0XTR9c-8cpQGpDhcXgZ15Zs6kzUJ48ESnTtlo35WtxJaAj8ACKCxaXC0lQHOgHluXayOJlovievZhpThiDH1zV75cNlK9RVciGkfxD-ir0Ndoeu2-M0-cgqLY25zVQ0UAz_JzQH7WEtHSLYLcYi237cP9RCX_DvC7hPdQ5s2knZTGQSWw";

pub const ISSUER: &str = "https://login.example.test/tenant-1/v2.0";
pub const AUDIENCE: &str = "api://mcp-server";
pub const CLIENT_ID: &str = "mcp-server-client";

/// RSA signing JWK.
pub fn jwk(kid: &str, n: &str) -> Value {
    json!({ "kty": "RSA", "use": "sig", "alg": "RS256", "kid": kid, "n": n, "e": "AQAB" })
}

/// JWKS document with the given keys.
pub fn jwks(keys: &[Value]) -> Value {
    json!({ "keys": keys })
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sign `claims` with RS256 under `kid`.
pub fn sign(kid: &str, pem: &[u8], claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_rsa_pem(pem).unwrap()).unwrap()
}

/// Claims of a typical user token expiring `exp_offset` seconds from now.
pub fn user_claims(exp_offset: i64) -> Value {
    let now = now();
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "user-123",
        "oid": "object-456",
        "azp": "client-app",
        "scp": "User.Read MCP.Tools",
        "iat": now,
        "nbf": now - 5,
        "exp": now + exp_offset,
    })
}

/// A valid token signed by `kid-1`, expiring in one hour.
pub fn valid_token() -> String {
    sign("kid-1", SIGNING_KEY_PEM, &user_claims(3600))
}

/// An identity as the verifier would produce it, for exchange tests.
pub fn identity_expiring_in(secs: i64) -> VerifiedIdentity {
    let claims = user_claims(secs);
    let token = sign("kid-1", SIGNING_KEY_PEM, &claims);
    VerifiedIdentity {
        subject: "user-123".to_string(),
        token,
        expires_at: chrono::DateTime::from_timestamp(now() + secs, 0).unwrap(),
        scopes: ["User.Read".to_string()].into_iter().collect(),
        client_id: Some("client-app".to_string()),
        issuer: ISSUER.to_string(),
        claims: claims.as_object().cloned().unwrap(),
    }
}

/// Mutable behaviour and recorded traffic of the mock authority.
pub struct AuthorityState {
    pub jwks_body: Mutex<String>,
    pub jwks_status: Mutex<u16>,
    pub jwks_delay: Mutex<Duration>,
    pub jwks_hits: AtomicUsize,

    pub token_response: Mutex<(u16, Value)>,
    pub token_delay: Mutex<Duration>,
    pub token_forms: Mutex<Vec<HashMap<String, String>>>,
    pub token_hits: AtomicUsize,

    pub identity_response: Mutex<(u16, Value)>,
    pub identity_queries: Mutex<Vec<HashMap<String, String>>>,
    pub identity_headers: Mutex<Vec<Option<String>>>,
    pub identity_hits: AtomicUsize,
}

/// In-process authority serving `/keys`, `/token` and `/msi`.
pub struct MockAuthority {
    pub base: String,
    pub state: Arc<AuthorityState>,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

impl MockAuthority {
    /// Start an authority publishing `kid-1`.
    pub async fn start() -> Self {
        let state = Arc::new(AuthorityState {
            jwks_body: Mutex::new(jwks(&[jwk("kid-1", SIGNING_KEY_N)]).to_string()),
            jwks_status: Mutex::new(200),
            jwks_delay: Mutex::new(Duration::ZERO),
            jwks_hits: AtomicUsize::new(0),
            token_response: Mutex::new((
                200,
                json!({
                    "token_type": "Bearer",
                    "scope": "https://graph.microsoft.com/User.Read",
                    "expires_in": 3599,
                    "ext_expires_in": 3599,
                    "access_token": "downstream-access-token"
                }),
            )),
            token_delay: Mutex::new(Duration::ZERO),
            token_forms: Mutex::new(Vec::new()),
            token_hits: AtomicUsize::new(0),
            identity_response: Mutex::new((200, json!({ "access_token": "mi-assertion-token" }))),
            identity_queries: Mutex::new(Vec::new()),
            identity_headers: Mutex::new(Vec::new()),
            identity_hits: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/keys", get(serve_jwks))
            .route("/token", post(serve_token))
            .route("/msi", get(serve_identity))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            base: format!("http://{addr}"),
            state,
            _shutdown: tx,
        }
    }

    pub fn jwks_uri(&self) -> String {
        format!("{}/keys", self.base)
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/token", self.base)
    }

    pub fn identity_endpoint(&self) -> String {
        format!("{}/msi", self.base)
    }

    pub fn publish(&self, keys: &[Value]) {
        *self.state.jwks_body.lock() = jwks(keys).to_string();
    }

    pub fn set_jwks_raw(&self, body: &str) {
        *self.state.jwks_body.lock() = body.to_string();
    }

    pub fn set_jwks_status(&self, status: u16) {
        *self.state.jwks_status.lock() = status;
    }

    pub fn set_jwks_delay(&self, delay: Duration) {
        *self.state.jwks_delay.lock() = delay;
    }

    pub fn set_token_response(&self, status: u16, body: Value) {
        *self.state.token_response.lock() = (status, body);
    }

    pub fn set_token_delay(&self, delay: Duration) {
        *self.state.token_delay.lock() = delay;
    }

    pub fn set_identity_response(&self, status: u16, body: Value) {
        *self.state.identity_response.lock() = (status, body);
    }

    pub fn jwks_hits(&self) -> usize {
        self.state.jwks_hits.load(Ordering::SeqCst)
    }

    pub fn token_hits(&self) -> usize {
        self.state.token_hits.load(Ordering::SeqCst)
    }

    pub fn identity_hits(&self) -> usize {
        self.state.identity_hits.load(Ordering::SeqCst)
    }

    pub fn last_token_form(&self) -> HashMap<String, String> {
        self.state.token_forms.lock().last().cloned().unwrap()
    }

    /// A verifier against this authority with the given cache lifetime.
    pub fn verifier(&self, ttl: Duration) -> TokenVerifier {
        let cache = KeySetCache::new(reqwest::Client::new(), self.jwks_uri(), ttl);
        TokenVerifier::new(cache, ISSUER, AUDIENCE)
    }

    /// Like [`verifier`](Self::verifier), with key fetches bounded by `timeout`.
    pub fn verifier_with_timeout(&self, ttl: Duration, timeout: Duration) -> TokenVerifier {
        let cache = KeySetCache::new(bounded_client(timeout), self.jwks_uri(), ttl);
        TokenVerifier::new(cache, ISSUER, AUDIENCE)
    }
}

/// HTTP client with an overall request timeout.
pub fn bounded_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder().timeout(timeout).build().unwrap()
}

async fn serve_jwks(State(state): State<Arc<AuthorityState>>) -> impl IntoResponse {
    state.jwks_hits.fetch_add(1, Ordering::SeqCst);
    let delay = *state.jwks_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let status = StatusCode::from_u16(*state.jwks_status.lock()).unwrap();
    let body = state.jwks_body.lock().clone();
    (status, [(header::CONTENT_TYPE, "application/json")], body)
}

async fn serve_token(State(state): State<Arc<AuthorityState>>, body: String) -> impl IntoResponse {
    state.token_hits.fetch_add(1, Ordering::SeqCst);
    let form: HashMap<String, String> = serde_urlencoded::from_str(&body).unwrap();
    state.token_forms.lock().push(form);
    let delay = *state.token_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let (status, body) = state.token_response.lock().clone();
    (StatusCode::from_u16(status).unwrap(), axum::Json(body))
}

async fn serve_identity(
    State(state): State<Arc<AuthorityState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.identity_hits.fetch_add(1, Ordering::SeqCst);
    state.identity_queries.lock().push(query);
    state.identity_headers.lock().push(
        headers
            .get("Metadata")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    let (status, body) = state.identity_response.lock().clone();
    (StatusCode::from_u16(status).unwrap(), axum::Json(body))
}
