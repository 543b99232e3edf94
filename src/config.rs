//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::identity::TOKEN_EXCHANGE_AUDIENCE;
use crate::{Error, Result};

/// Default identity authority host.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Default downstream scope for delegated calls.
pub const DEFAULT_DOWNSTREAM_SCOPE: &str = "https://graph.microsoft.com/User.Read";

/// Environment variable prefix (`MCP_AUTH_AUTH__TENANT_ID` sets `auth.tenant_id`).
pub const ENV_PREFIX: &str = "MCP_AUTH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving credentials.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Logging configuration
    pub log: LogConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Bearer verification and On-Behalf-Of settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable authentication
    pub enabled: bool,
    /// Directory tenant
    pub tenant_id: Option<String>,
    /// This service's application (client) id
    pub client_id: Option<String>,
    /// Authority base URL used to derive endpoints
    pub authority_host: String,
    /// Signing key set URL (derived from tenant when unset)
    pub jwks_uri: Option<String>,
    /// Trusted issuer (derived from tenant when unset)
    pub issuer: Option<String>,
    /// Expected audience (defaults to `client_id`)
    pub audience: Option<String>,
    /// Token endpoint for exchanges (derived from tenant when unset)
    pub token_endpoint: Option<String>,
    /// Scope requested for downstream calls
    pub downstream_scope: String,
    /// Client secret: literal value or `env:VAR_NAME`
    pub client_secret: Option<String>,
    /// Federated credential (managed identity) settings
    pub federated: Option<FederatedConfig>,
    /// Signing key set cache lifetime
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
    /// Key set fetch timeout
    #[serde(with = "humantime_serde")]
    pub jwks_timeout: Duration,
    /// Token exchange timeout (also bounds the identity endpoint call)
    #[serde(with = "humantime_serde")]
    pub exchange_timeout: Duration,
    /// Minimum remaining lifetime of a token before it may be delegated
    #[serde(with = "humantime_serde")]
    pub delegation_margin: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tenant_id: None,
            client_id: None,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            jwks_uri: None,
            issuer: None,
            audience: None,
            token_endpoint: None,
            downstream_scope: DEFAULT_DOWNSTREAM_SCOPE.to_string(),
            client_secret: None,
            federated: None,
            jwks_ttl: Duration::from_secs(3600),
            jwks_timeout: Duration::from_secs(10),
            exchange_timeout: Duration::from_secs(10),
            delegation_margin: Duration::from_secs(300),
        }
    }
}

/// Federated credential (managed identity) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedConfig {
    /// Client id of the user-assigned managed identity
    pub client_id: Option<String>,
    /// Override of the local identity endpoint (detected from the environment when unset)
    pub identity_endpoint: Option<String>,
    /// Audience of the identity token
    pub audience: String,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            identity_endpoint: None,
            audience: TOKEN_EXCHANGE_AUDIENCE.to_string(),
        }
    }
}

/// How the service authenticates to the token endpoint, decided once.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSettings {
    /// Static client secret
    ClientSecret(String),
    /// Managed identity token as client assertion
    Federated {
        /// Managed identity client id
        client_id: String,
        /// Endpoint override
        identity_endpoint: Option<String>,
        /// Identity token audience
        audience: String,
    },
}

impl CredentialSettings {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientSecret(_) => "client_secret",
            Self::Federated { .. } => "federated_credential",
        }
    }
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientSecret(_) => f.write_str("ClientSecret(<redacted>)"),
            Self::Federated {
                client_id,
                identity_endpoint,
                audience,
            } => f
                .debug_struct("Federated")
                .field("client_id", client_id)
                .field("identity_endpoint", identity_endpoint)
                .field("audience", audience)
                .finish(),
        }
    }
}

/// Fully validated auth settings with every endpoint resolved.
#[derive(Debug, Clone)]
pub struct ResolvedAuthConfig {
    /// Directory tenant
    pub tenant_id: String,
    /// This service's client id
    pub client_id: String,
    /// Signing key set URL
    pub jwks_uri: String,
    /// Trusted issuer
    pub issuer: String,
    /// Expected audience
    pub audience: String,
    /// Token endpoint
    pub token_endpoint: String,
    /// Default downstream scope
    pub downstream_scope: String,
    /// Selected credential strategy
    pub credential: CredentialSettings,
    /// Key set cache lifetime
    pub jwks_ttl: Duration,
    /// Key set fetch timeout
    pub jwks_timeout: Duration,
    /// Exchange timeout
    pub exchange_timeout: Duration,
    /// Delegation margin
    pub delegation_margin: Duration,
}

impl AuthConfig {
    /// Validate and derive all settings, resolving `env:VAR` secrets from
    /// the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming every missing or invalid setting.
    pub fn resolve(&self) -> Result<ResolvedAuthConfig> {
        self.resolve_with(|name| env::var(name).ok())
    }

    /// Like [`resolve`](Self::resolve) with an explicit variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming every missing or invalid setting.
    pub fn resolve_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<ResolvedAuthConfig> {
        let mut missing: Vec<&str> = Vec::new();
        let mut invalid: Vec<String> = Vec::new();

        let tenant_id = non_empty(self.tenant_id.as_deref());
        let client_id = non_empty(self.client_id.as_deref());
        let host = self.authority_host.trim_end_matches('/');

        let derive = |explicit: Option<&str>, suffix: &str| {
            non_empty(explicit).or_else(|| tenant_id.as_ref().map(|t| format!("{host}/{t}/{suffix}")))
        };
        let jwks_uri = derive(self.jwks_uri.as_deref(), "discovery/v2.0/keys");
        let issuer = derive(self.issuer.as_deref(), "v2.0");
        let token_endpoint = derive(self.token_endpoint.as_deref(), "oauth2/v2.0/token");
        let audience = non_empty(self.audience.as_deref()).or_else(|| client_id.clone());

        for (name, value) in [
            ("tenant_id", &tenant_id),
            ("client_id", &client_id),
            ("jwks_uri", &jwks_uri),
            ("issuer", &issuer),
            ("audience", &audience),
            ("token_endpoint", &token_endpoint),
        ] {
            if value.is_none() {
                missing.push(name);
            }
        }

        for (name, value) in [("jwks_uri", &jwks_uri), ("token_endpoint", &token_endpoint)] {
            if let Some(v) = value
                && let Err(e) = url::Url::parse(v)
            {
                invalid.push(format!("{name} ({e})"));
            }
        }

        let credential = self.select_credential(&lookup, &mut invalid);
        if credential.is_none() {
            missing.push("client_secret or federated.client_id");
        }

        match (
            tenant_id,
            client_id,
            jwks_uri,
            issuer,
            audience,
            token_endpoint,
            credential,
        ) {
            (
                Some(tenant_id),
                Some(client_id),
                Some(jwks_uri),
                Some(issuer),
                Some(audience),
                Some(token_endpoint),
                Some(credential),
            ) if invalid.is_empty() => Ok(ResolvedAuthConfig {
                tenant_id,
                client_id,
                jwks_uri,
                issuer,
                audience,
                token_endpoint,
                downstream_scope: self.downstream_scope.clone(),
                credential,
                jwks_ttl: self.jwks_ttl,
                jwks_timeout: self.jwks_timeout,
                exchange_timeout: self.exchange_timeout,
                delegation_margin: self.delegation_margin,
            }),
            _ => {
                let mut problems = Vec::new();
                if !missing.is_empty() {
                    problems.push(format!("missing required settings: {}", missing.join(", ")));
                }
                if !invalid.is_empty() {
                    problems.push(format!("invalid settings: {}", invalid.join(", ")));
                }
                Err(Error::Config(format!("Auth configuration incomplete: {}", problems.join("; "))))
            }
        }
    }

    /// Secret wins when both credentials are present; no fallback chain.
    fn select_credential(
        &self,
        lookup: &impl Fn(&str) -> Option<String>,
        invalid: &mut Vec<String>,
    ) -> Option<CredentialSettings> {
        let raw = self.client_secret.as_deref().map(str::trim);
        let secret = match raw.and_then(|v| v.strip_prefix("env:")) {
            Some(var) => {
                let resolved = lookup(var).filter(|s| !s.is_empty());
                if resolved.is_none() {
                    invalid.push(format!("client_secret (environment variable {var} is not set)"));
                }
                resolved
            }
            None => non_empty(raw),
        };
        let federated = self.federated.as_ref().and_then(|f| {
            non_empty(f.client_id.as_deref()).map(|client_id| CredentialSettings::Federated {
                client_id,
                identity_endpoint: non_empty(f.identity_endpoint.as_deref()),
                audience: f.audience.clone(),
            })
        });

        match (secret, federated) {
            (Some(secret), Some(_)) => {
                warn!("Both client_secret and federated credential configured; using client_secret");
                Some(CredentialSettings::ClientSecret(secret))
            }
            (Some(secret), None) => Some(CredentialSettings::ClientSecret(secret)),
            (None, federated) => federated,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(&figment)
    }

    /// Extract from an already-layered figment, then load env files and
    /// expand `${VAR}` references.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Resolved auth settings, or `None` when authentication is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when enabled but incomplete.
    pub fn resolved_auth(&self) -> Result<Option<ResolvedAuthConfig>> {
        if self.auth.enabled {
            self.auth.resolve().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in auth settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let auth = &mut self.auth;
        for value in [
            &mut auth.tenant_id,
            &mut auth.client_id,
            &mut auth.jwks_uri,
            &mut auth.issuer,
            &mut auth.audience,
            &mut auth.token_endpoint,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
        auth.authority_host = Self::expand_string(&re, &auth.authority_host);
        auth.downstream_scope = Self::expand_string(&re, &auth.downstream_scope);
        if let Some(federated) = &mut auth.federated
            && let Some(client_id) = &mut federated.client_id
        {
            *client_id = Self::expand_string(&re, client_id);
        }
        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Human-readable durations (`"30s"`, `"5m"`, `"1h"`, `"500ms"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration as whole seconds (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        if let Some(ms) = s.strip_suffix("ms") {
            return ms
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string());
        }
        let (digits, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        let n = digits.parse::<u64>().map_err(|e| e.to_string())?;
        n.checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn from_yaml(yaml: &str) -> Result<Config> {
        Config::from_figment(&Figment::from(Yaml::string(yaml)))
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn tenant_config() -> AuthConfig {
        AuthConfig {
            tenant_id: Some("tenant-1".to_string()),
            client_id: Some("client-1".to_string()),
            client_secret: Some("s3cret".to_string()),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn endpoints_derive_from_tenant() {
        // GIVEN: only tenant, client id and secret
        let auth = tenant_config();

        // WHEN
        let resolved = auth.resolve_with(no_env).unwrap();

        // THEN: authority endpoints are derived and audience defaults to client id
        assert_eq!(
            resolved.jwks_uri,
            "https://login.microsoftonline.com/tenant-1/discovery/v2.0/keys"
        );
        assert_eq!(resolved.issuer, "https://login.microsoftonline.com/tenant-1/v2.0");
        assert_eq!(
            resolved.token_endpoint,
            "https://login.microsoftonline.com/tenant-1/oauth2/v2.0/token"
        );
        assert_eq!(resolved.audience, "client-1");
        assert_eq!(resolved.downstream_scope, DEFAULT_DOWNSTREAM_SCOPE);
        assert_eq!(resolved.credential, CredentialSettings::ClientSecret("s3cret".into()));
        assert_eq!(resolved.delegation_margin, Duration::from_secs(300));
    }

    #[test]
    fn explicit_endpoints_win_over_derivation() {
        let auth = AuthConfig {
            authority_host: "https://login.example/".to_string(),
            jwks_uri: Some("http://127.0.0.1:8080/keys".to_string()),
            audience: Some("api://mcp-server".to_string()),
            ..tenant_config()
        };
        let resolved = auth.resolve_with(no_env).unwrap();
        assert_eq!(resolved.jwks_uri, "http://127.0.0.1:8080/keys");
        assert_eq!(resolved.issuer, "https://login.example/tenant-1/v2.0");
        assert_eq!(resolved.audience, "api://mcp-server");
    }

    #[test]
    fn every_missing_setting_is_reported() {
        // GIVEN: nothing configured
        let auth = AuthConfig::default();

        // WHEN
        let err = auth.resolve_with(no_env).unwrap_err().to_string();

        // THEN: one error naming all of them
        for name in [
            "tenant_id",
            "client_id",
            "jwks_uri",
            "issuer",
            "audience",
            "token_endpoint",
            "client_secret or federated.client_id",
        ] {
            assert!(err.contains(name), "{name} not reported in: {err}");
        }
    }

    #[test]
    fn secret_wins_over_federated() {
        let auth = AuthConfig {
            federated: Some(FederatedConfig {
                client_id: Some("mi-1".to_string()),
                ..FederatedConfig::default()
            }),
            ..tenant_config()
        };
        let resolved = auth.resolve_with(no_env).unwrap();
        assert_eq!(resolved.credential.name(), "client_secret");
    }

    #[test]
    fn federated_used_without_secret() {
        let auth = AuthConfig {
            client_secret: None,
            federated: Some(FederatedConfig {
                client_id: Some("mi-1".to_string()),
                ..FederatedConfig::default()
            }),
            ..tenant_config()
        };
        let resolved = auth.resolve_with(no_env).unwrap();
        assert_eq!(
            resolved.credential,
            CredentialSettings::Federated {
                client_id: "mi-1".into(),
                identity_endpoint: None,
                audience: TOKEN_EXCHANGE_AUDIENCE.into(),
            }
        );
    }

    #[test]
    fn env_secret_reference_is_resolved() {
        let auth = AuthConfig {
            client_secret: Some("env:OBO_SECRET".to_string()),
            ..tenant_config()
        };
        let resolved = auth
            .resolve_with(|name| (name == "OBO_SECRET").then(|| "from-env".to_string()))
            .unwrap();
        assert_eq!(resolved.credential, CredentialSettings::ClientSecret("from-env".into()));

        let err = auth.resolve_with(no_env).unwrap_err().to_string();
        assert!(err.contains("OBO_SECRET"));
    }

    #[test]
    fn invalid_endpoint_url_is_rejected() {
        let auth = AuthConfig {
            jwks_uri: Some("not a url".to_string()),
            ..tenant_config()
        };
        let err = auth.resolve_with(no_env).unwrap_err().to_string();
        assert!(err.contains("jwks_uri"));
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let dbg = format!("{:?}", CredentialSettings::ClientSecret("hunter2".into()));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn yaml_with_durations_parses() {
        let config = from_yaml(
            r#"
log:
  level: debug
  format: json
auth:
  tenant_id: tenant-1
  client_id: client-1
  jwks_ttl: 30m
  exchange_timeout: 2500ms
  delegation_margin: 1h
  federated:
    client_id: mi-1
"#,
        )
        .unwrap();
        assert_eq!(config.log.format, "json");
        assert_eq!(config.auth.jwks_ttl, Duration::from_secs(1800));
        assert_eq!(config.auth.exchange_timeout, Duration::from_millis(2500));
        assert_eq!(config.auth.delegation_margin, Duration::from_secs(3600));
        assert_eq!(config.auth.jwks_timeout, Duration::from_secs(10));
        let federated = config.auth.federated.unwrap();
        assert_eq!(federated.audience, TOKEN_EXCHANGE_AUDIENCE);
    }

    #[test]
    fn disabled_auth_skips_resolution() {
        let config = from_yaml("auth:\n  enabled: false\n").unwrap();
        assert!(config.resolved_auth().unwrap().is_none());
    }

    #[test]
    fn placeholder_defaults_are_expanded() {
        let config = from_yaml(
            "auth:\n  tenant_id: \"${MCP_AUTH_TEST_UNSET_TENANT:-fallback-tenant}\"\n",
        )
        .unwrap();
        assert_eq!(config.auth.tenant_id.as_deref(), Some("fallback-tenant"));
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(humantime_serde::parse("45").unwrap(), Duration::from_secs(45));
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = humantime_serde::parse(&format!("{}h", u64::MAX)).unwrap_err();
        assert!(err.contains("out of range"), "{err}");
        assert!(humantime_serde::parse(&format!("{}m", u64::MAX / 2)).is_err());
        assert_eq!(
            humantime_serde::parse("2h").unwrap(),
            Duration::from_secs(7200)
        );

        let err = from_yaml("auth:\n  jwks_timeout: 18446744073709551615h\n").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/mcp-auth.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_files_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "MCP_AUTH_TEST_ENV_FILE_KEY=loaded").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string(), "/nonexistent/.env".into()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("MCP_AUTH_TEST_ENV_FILE_KEY").unwrap(), "loaded");
    }
}
