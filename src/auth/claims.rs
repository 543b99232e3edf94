//! Claim normalization.
//!
//! Tokens from the same authority do not agree on claim shapes. Everything
//! shape-dependent is resolved here, in a fixed order, so the verifier only
//! ever sees normalized values.
//!
//! | Concern | Source claims (in order) |
//! |---------|--------------------------|
//! | scopes | `scp` (space-delimited string) ∪ `roles` (array) |
//! | subject | `sub`, `oid`, `user_id`, `email`, `preferred_username` |
//! | authorized party | `azp`, `appid` |
//! | audience | `aud` as a string or an array of strings |

use std::collections::BTreeSet;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Map, Value};

/// Raw claim map of a decoded token.
pub type Claims = Map<String, Value>;

/// Claim carrying delegated scopes as one space-delimited string.
pub const SCOPE_CLAIM: &str = "scp";

/// Claim carrying application-role grants as a list.
pub const ROLES_CLAIM: &str = "roles";

/// Subject claim precedence, highest first.
pub const SUBJECT_CLAIMS: [&str; 5] = ["sub", "oid", "user_id", "email", "preferred_username"];

/// Authorized-party claim precedence (v2 tokens use `azp`, v1 tokens `appid`).
pub const CLIENT_ID_CLAIMS: [&str; 2] = ["azp", "appid"];

/// Union of the scopes granted through `scp` and `roles`.
///
/// Both claims tolerate either shape (string or array); empty entries are
/// dropped and duplicates collapse.
#[must_use]
pub fn scopes(claims: &Claims) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for name in [SCOPE_CLAIM, ROLES_CLAIM] {
        match claims.get(name) {
            Some(Value::String(s)) => {
                out.extend(s.split_whitespace().map(str::to_string));
            }
            Some(Value::Array(items)) => {
                out.extend(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
            _ => {}
        }
    }
    out
}

/// First non-empty string among `names`, in order.
fn first_string(claims: &Claims, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        claims
            .get(*name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Resolve the subject identifier using [`SUBJECT_CLAIMS`] precedence.
#[must_use]
pub fn subject(claims: &Claims) -> Option<String> {
    first_string(claims, &SUBJECT_CLAIMS)
}

/// Resolve the authorized party (the client the token was issued to).
#[must_use]
pub fn client_id(claims: &Claims) -> Option<String> {
    first_string(claims, &CLIENT_ID_CLAIMS)
}

/// `true` if the `aud` claim (string or array) contains `expected`.
#[must_use]
pub fn audience_contains(claims: &Claims, expected: &str) -> bool {
    match claims.get("aud") {
        Some(Value::String(s)) => s == expected,
        Some(Value::Array(arr)) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}

/// Read a numeric-date claim (`exp`, `nbf`, `iat`) as Unix seconds.
///
/// Fractional values are truncated; anything non-numeric is `None`.
#[must_use]
pub fn numeric_date(claims: &Claims, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|v| i64::try_from(v).ok()))
        .or_else(|| {
            #[allow(clippy::cast_possible_truncation)]
            value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)
        })
}

/// Decode the payload of a compact JWT without verifying anything.
///
/// Only usable for decisions that reject, never for ones that accept.
#[must_use]
pub fn unverified(token: &str) -> Option<Claims> {
    segment(token, 1)
}

/// Decode the JOSE header of a compact JWT as a raw JSON object.
///
/// Unlike `jsonwebtoken::decode_header`, unknown `alg` names survive, so the
/// caller can report them as unsupported rather than malformed.
#[must_use]
pub fn unverified_header(token: &str) -> Option<Claims> {
    segment(token, 0)
}

fn segment(token: &str, index: usize) -> Option<Claims> {
    let part = token.split('.').nth(index)?;
    let bytes = URL_SAFE_NO_PAD.decode(part.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(v: Value) -> Claims {
        match v {
            Value::Object(map) => map,
            _ => panic!("claims must be an object"),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn scopes_from_space_delimited_scp() {
        let c = claims(json!({ "scp": "User.Read  Mail.Send " }));
        assert_eq!(scopes(&c), set(&["Mail.Send", "User.Read"]));
    }

    #[test]
    fn scopes_from_roles_array() {
        let c = claims(json!({ "roles": ["MCP.Tools", "MCP.Prompts"] }));
        assert_eq!(scopes(&c), set(&["MCP.Prompts", "MCP.Tools"]));
    }

    #[test]
    fn scopes_union_both_shapes_and_deduplicate() {
        // GIVEN: a token carrying both delegated scopes and app roles
        let c = claims(json!({
            "scp": "User.Read MCP.Tools",
            "roles": ["MCP.Tools", "Admin", ""]
        }));

        // THEN: one normalized set
        assert_eq!(scopes(&c), set(&["Admin", "MCP.Tools", "User.Read"]));
    }

    #[test]
    fn scopes_tolerate_swapped_shapes() {
        let c = claims(json!({ "scp": ["User.Read"], "roles": "Admin" }));
        assert_eq!(scopes(&c), set(&["Admin", "User.Read"]));
    }

    #[test]
    fn scopes_empty_when_absent_or_wrong_type() {
        assert!(scopes(&claims(json!({}))).is_empty());
        assert!(scopes(&claims(json!({ "scp": 42, "roles": {"a": 1} }))).is_empty());
    }

    #[test]
    fn subject_follows_precedence() {
        let c = claims(json!({
            "oid": "object-id",
            "email": "alice@example.com",
            "sub": "subject-id"
        }));
        assert_eq!(subject(&c).as_deref(), Some("subject-id"));

        let c = claims(json!({ "email": "alice@example.com", "oid": "object-id" }));
        assert_eq!(subject(&c).as_deref(), Some("object-id"));

        let c = claims(json!({ "preferred_username": "alice" }));
        assert_eq!(subject(&c).as_deref(), Some("alice"));
    }

    #[test]
    fn subject_skips_empty_and_non_string_values() {
        let c = claims(json!({ "sub": "", "oid": 7, "user_id": "u-1" }));
        assert_eq!(subject(&c).as_deref(), Some("u-1"));
    }

    #[test]
    fn subject_none_when_no_candidate_present() {
        let c = claims(json!({ "name": "Alice" }));
        assert_eq!(subject(&c), None);
    }

    #[test]
    fn client_id_prefers_azp_over_appid() {
        let c = claims(json!({ "appid": "v1-app", "azp": "v2-app" }));
        assert_eq!(client_id(&c).as_deref(), Some("v2-app"));
        let c = claims(json!({ "appid": "v1-app" }));
        assert_eq!(client_id(&c).as_deref(), Some("v1-app"));
    }

    #[test]
    fn audience_accepts_string_and_array() {
        assert!(audience_contains(&claims(json!({ "aud": "client-123" })), "client-123"));
        assert!(audience_contains(
            &claims(json!({ "aud": ["other", "client-123"] })),
            "client-123"
        ));
        assert!(!audience_contains(&claims(json!({ "aud": "client-999" })), "client-123"));
        assert!(!audience_contains(&claims(json!({ "aud": [] })), "client-123"));
        assert!(!audience_contains(&claims(json!({})), "client-123"));
    }

    #[test]
    fn unverified_reads_payload_only() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":1700000000,"sub":"u"}"#);
        let c = unverified(&format!("eyJhbGciOiJSUzI1NiJ9.{payload}.bm90LWEtc2ln")).unwrap();
        assert_eq!(numeric_date(&c, "exp"), Some(1_700_000_000));
        assert_eq!(unverified("opaque"), None);
        assert_eq!(unverified("a.%%%.c"), None);
    }

    #[test]
    fn unverified_header_keeps_unknown_algorithms() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let h = unverified_header(&format!("{header}.e30.")).unwrap();
        assert_eq!(h["alg"], "none");
        assert_eq!(unverified_header("%%%.e30.sig"), None);
    }

    #[test]
    fn numeric_date_reads_integers_and_floats() {
        let c = claims(json!({ "exp": 1_700_000_000, "nbf": 1_700_000_000.9, "iat": "soon" }));
        assert_eq!(numeric_date(&c, "exp"), Some(1_700_000_000));
        assert_eq!(numeric_date(&c, "nbf"), Some(1_700_000_000));
        assert_eq!(numeric_date(&c, "iat"), None);
        assert_eq!(numeric_date(&c, "missing"), None);
    }
}
