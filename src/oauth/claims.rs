//! Id-token claims

use std::collections::BTreeSet;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Deserializer, Serialize};

use super::AuthError;

fn invalid_id_token(e: jsonwebtoken::errors::Error) -> AuthError {
    AuthError::InvalidIdToken(e.to_string())
}

/// Placeholder key of the header algorithm's family. Never used to verify:
/// signature validation is disabled for tokens taken from the token endpoint.
fn unverified_key(alg: Algorithm) -> jsonwebtoken::errors::Result<DecodingKey> {
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(DecodingKey::from_secret(&[])),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_components("AA", "AA"),
        Algorithm::EdDSA => DecodingKey::from_ed_components("AA"),
        _ => Ok(DecodingKey::from_rsa_raw_components(&[0], &[1, 0, 1])),
    }
}

/// Claims about the signed-in user, taken from the id token.
///
/// `roles` stays `None` when the token carries no `roles` claim at all, which
/// the access gate treats differently from an empty role list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Sign-in name (usually an email address)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Object id of the user in the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    /// Tenant id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience (a single string or an array on the wire)
    #[serde(default, deserialize_with = "deserialize_audience")]
    pub aud: Vec<String>,
    /// Nonce echoed from the authorization request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Expiry (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// App roles assigned to the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeSet<String>>,
}

fn deserialize_audience<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Ok(vec![s]),
        Some(StringOrVec::Vec(v)) => Ok(v),
        None => Ok(Vec::new()),
    }
}

impl Claims {
    /// Decode a compact JWT id token issued for `client_id`.
    ///
    /// The token comes straight from the provider's token endpoint over TLS,
    /// so the signature is not re-verified here. Expiry and audience are
    /// validated, and tokens without a recognised signing algorithm (including
    /// `alg: none`) are rejected. The nonce is checked by the flow controller.
    pub fn from_id_token(id_token: &str, client_id: &str) -> Result<Self, AuthError> {
        let header = jsonwebtoken::decode_header(id_token).map_err(invalid_id_token)?;

        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = true;
        validation.set_audience(&[client_id]);
        validation.set_required_spec_claims(&["exp", "aud"]);

        let key = unverified_key(header.alg).map_err(invalid_id_token)?;
        jsonwebtoken::decode::<Self>(id_token, &key, &validation)
            .map(|data| data.claims)
            .map_err(invalid_id_token)
    }

    /// Stable account key: `{oid}.{tid}` when available, else the subject
    #[must_use]
    pub fn home_account_id(&self) -> String {
        match (&self.oid, &self.tid) {
            (Some(oid), Some(tid)) => format!("{oid}.{tid}"),
            (Some(oid), None) => oid.clone(),
            _ => self.sub.clone().unwrap_or_default(),
        }
    }

    /// First word of the display name
    #[must_use]
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }

    /// Whether the claims satisfy a required role set.
    ///
    /// Claims without a `roles` claim never pass, even when nothing is
    /// required. An empty requirement otherwise passes.
    #[must_use]
    pub fn has_any_role(&self, required: &BTreeSet<String>) -> bool {
        match &self.roles {
            None => false,
            Some(_) if required.is_empty() => true,
            Some(roles) => roles.iter().any(|r| required.contains(r)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    const CLIENT_ID: &str = "client-123";
    const FAR_FUTURE: u64 = 4_102_444_800;

    /// HS256 token around `claims`, with `aud` and `exp` filled in when absent
    fn encode(claims: &serde_json::Value) -> String {
        let mut claims = claims.clone();
        claims
            .as_object_mut()
            .unwrap()
            .entry("aud")
            .or_insert(json!(CLIENT_ID));
        claims
            .as_object_mut()
            .unwrap()
            .entry("exp")
            .or_insert(json!(FAR_FUTURE));
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"provider-key"),
        )
        .unwrap()
    }

    fn decode(token: &str) -> Result<Claims, AuthError> {
        Claims::from_id_token(token, CLIENT_ID)
    }

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn decodes_claims_with_roles() {
        let token = encode(&json!({
            "name": "Ada Lovelace",
            "oid": "user-1",
            "tid": "tenant-1",
            "nonce": "n-1",
            "roles": ["Reader", "Admin"]
        }));
        let claims = decode(&token).unwrap();
        assert_eq!(claims.first_name(), "Ada");
        assert_eq!(claims.home_account_id(), "user-1.tenant-1");
        assert_eq!(claims.aud, vec!["client-123".to_string()]);
        assert_eq!(claims.roles, Some(roles(&["Admin", "Reader"])));
    }

    #[test]
    fn audience_may_be_an_array() {
        let token = encode(&json!({"name": "A", "aud": ["x", CLIENT_ID]}));
        let claims = decode(&token).unwrap();
        assert_eq!(claims.aud, vec!["x".to_string(), CLIENT_ID.to_string()]);
    }

    #[test]
    fn missing_roles_claim_is_none() {
        let token = encode(&json!({"name": "No Roles"}));
        let claims = decode(&token).unwrap();
        assert!(claims.roles.is_none());
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(matches!(decode("not-a-jwt"), Err(AuthError::InvalidIdToken(_))));
        assert!(matches!(decode("a.!!!.c"), Err(AuthError::InvalidIdToken(_))));
    }

    #[test]
    fn rejects_unsigned_tokens() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "name": "Mallory",
                "aud": CLIENT_ID,
                "exp": FAR_FUTURE,
                "roles": ["Admin"]
            }))
            .unwrap(),
        );
        let token = format!("{header}.{payload}.forged");
        assert!(matches!(decode(&token), Err(AuthError::InvalidIdToken(_))));
    }

    #[test]
    fn rejects_expired_tokens() {
        let token = encode(&json!({"name": "Late", "exp": 1, "roles": ["Admin"]}));
        assert!(matches!(decode(&token), Err(AuthError::InvalidIdToken(_))));
    }

    #[test]
    fn rejects_tokens_without_expiry() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&json!({"name": "A", "aud": CLIENT_ID})).unwrap());
        let token = format!("{header}.{payload}.c2ln");
        assert!(matches!(decode(&token), Err(AuthError::InvalidIdToken(_))));
    }

    #[test]
    fn rejects_tokens_for_another_client() {
        let token = encode(&json!({"name": "A", "aud": "other-app"}));
        assert!(matches!(decode(&token), Err(AuthError::InvalidIdToken(_))));
    }

    #[test]
    fn role_check_fails_closed_without_roles_claim() {
        let claims = Claims {
            name: "Nobody".to_string(),
            ..Claims::default()
        };
        assert!(!claims.has_any_role(&BTreeSet::new()));
        assert!(!claims.has_any_role(&roles(&["Reader"])));
    }

    #[test]
    fn role_check_intersects() {
        let claims = Claims {
            roles: Some(roles(&["Reader"])),
            ..Claims::default()
        };
        assert!(claims.has_any_role(&BTreeSet::new()));
        assert!(claims.has_any_role(&roles(&["Reader", "Admin"])));
        assert!(!claims.has_any_role(&roles(&["Admin"])));
    }

    #[test]
    fn empty_roles_claim_passes_only_empty_requirement() {
        let claims = Claims {
            roles: Some(BTreeSet::new()),
            ..Claims::default()
        };
        assert!(claims.has_any_role(&BTreeSet::new()));
        assert!(!claims.has_any_role(&roles(&["Reader"])));
    }
}
