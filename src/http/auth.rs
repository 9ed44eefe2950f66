//! Token verification backends
//!
//! The server never issues tokens. Production deployments verify RS256
//! tokens from a Cognito user pool against its published JWKS; local setups
//! use an HS256 shared secret.

use std::collections::HashMap;

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::middleware::{verify_jwt, AuthError, JwtClaims};

/// Turns a bearer token into verified claims
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<JwtClaims, AuthError>;
}

/// HS256 tokens signed with a shared secret
pub struct SharedSecretAuth {
    secret: String,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for SharedSecretAuth {
    async fn verify(&self, token: &str) -> Result<JwtClaims, AuthError> {
        verify_jwt(token, &self.secret)
    }
}

// ============================================================================
// JWKS (RS256)
// ============================================================================

pub struct JwksAuth {
    client: Client,
    jwks_url: String,
    issuer: String,
    /// Decoding keys by `kid`
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl JwksAuth {
    pub fn new(client: Client, jwks_url: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            client,
            jwks_url: jwks_url.into(),
            issuer: issuer.into(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Keys and issuer of a Cognito user pool
    pub fn cognito(client: Client, region: &str, user_pool_id: &str) -> Self {
        let issuer = format!("https://cognito-idp.{region}.amazonaws.com/{user_pool_id}");
        let jwks_url = format!("{issuer}/.well-known/jwks.json");
        Self::new(client, jwks_url, issuer)
    }

    fn key(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().get(kid).cloned()
    }

    fn cache(&self, set: &JwkSet) -> usize {
        let mut keys = self.keys.write();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable JWK"),
            }
        }
        keys.len()
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::KeyFetch(format!("status {}", response.status())));
        }
        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;

        let count = self.cache(&set);
        info!(url = %self.jwks_url, keys = count, "Refreshed signing keys");
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for JwksAuth {
    async fn verify(&self, token: &str) -> Result<JwtClaims, AuthError> {
        let header = decode_header(token).map_err(map_jwt_error)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken);
        }
        let kid = header.kid.ok_or(AuthError::UnknownKey)?;

        let key = match self.key(&kid) {
            Some(key) => key,
            None => {
                debug!(kid = %kid, "Unknown key id, fetching JWKS");
                self.refresh().await?;
                self.key(&kid).ok_or(AuthError::UnknownKey)?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.required_spec_claims = std::collections::HashSet::new();
        validation.set_issuer(&[&self.issuer]);
        // access tokens carry client_id instead of aud
        validation.validate_aud = false;

        let data = decode::<JwtClaims>(token, &key, &validation).map_err(map_jwt_error)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims)
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        _ => AuthError::InvalidToken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::time::unix_millis;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const ISSUER: &str = "https://cognito-idp.eu-west-1.amazonaws.com/eu-west-1_pool";
    const TEST_KEY: &[u8] = include_bytes!("../../tests/fixtures/rs256_test_key.pem");

    fn jwks() -> JwkSet {
        serde_json::from_value(serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": "k1",
                "alg": "RS256",
                "use": "sig",
                "n": "jJ4Dxo4KRIob9wtTcXm4aH4Su6lsh8Sm2W0LHU46t_-7NBMjlXcOdF-mi7aLkOwMWOF3vwzlcfxG4HWqQvxuN8B7L1JcdS5RAJRS6vFFttvJKQClYC00Mze6kbt_UDK0GP__C5upvgTlfc5_eaO-KwvLF6tXfVw9L7Cz0btf2tIREraEK_c4x5WT9jKd2wiQwZ0bKB67rQm1MZRZemcgBi6AWdhe423-_vGaMoPFAFJm7Zdq7y29Dc_m3r0ClUDJ8Ws3DJaQsV9YrZp6Zj16bSBRtkTvb6FFLwLALUPRwxN9f6RyiRtmcgap6kvIH49X3cOgeDK2rkW28TKbQjrrbw",
                "e": "AQAB"
            }]
        }))
        .unwrap()
    }

    fn token(kid: &str, issuer: &str, exp_in: i64) -> String {
        let now = (unix_millis() / 1000) as i64;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        let claims = serde_json::json!({
            "sub": "player-1",
            "iss": issuer,
            "exp": now + exp_in,
            "iat": now,
            "client_id": "app",
        });
        encode(&header, &claims, &EncodingKey::from_rsa_pem(TEST_KEY).unwrap()).unwrap()
    }

    fn provider() -> JwksAuth {
        // nothing listens on the discard port
        let auth = JwksAuth::new(Client::new(), "http://127.0.0.1:9/jwks.json", ISSUER);
        assert_eq!(auth.cache(&jwks()), 1);
        auth
    }

    #[tokio::test]
    async fn verifies_cached_key() {
        let claims = provider().verify(&token("k1", ISSUER, 3600)).await.unwrap();
        assert_eq!(claims.sub, "player-1");
        assert_eq!(claims.iss.as_deref(), Some(ISSUER));
    }

    #[tokio::test]
    async fn rejects_wrong_issuer_and_expiry() {
        let auth = provider();
        assert!(matches!(
            auth.verify(&token("k1", "https://elsewhere", 3600)).await,
            Err(AuthError::InvalidIssuer)
        ));
        assert!(matches!(
            auth.verify(&token("k1", ISSUER, -3600)).await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn unknown_kid_triggers_fetch() {
        let result = provider().verify(&token("k2", ISSUER, 3600)).await;
        assert!(matches!(result, Err(AuthError::KeyFetch(_))));
    }

    #[tokio::test]
    async fn rejects_hs256_tokens() {
        let hs = crate::http::middleware::tests::hs256_token(
            &serde_json::json!({"sub": "player-1", "exp": unix_millis() / 1000 + 60}),
            "secret",
        );
        assert!(matches!(provider().verify(&hs).await, Err(AuthError::InvalidToken)));

        let shared = SharedSecretAuth::new("secret");
        assert_eq!(shared.verify(&hs).await.unwrap().sub, "player-1");
    }

    #[test]
    fn cognito_urls() {
        let auth = JwksAuth::cognito(Client::new(), "us-east-1", "us-east-1_abc");
        assert_eq!(
            auth.jwks_url,
            "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_abc/.well-known/jwks.json"
        );
        assert_eq!(auth.issuer, "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_abc");
    }
}
