//! Authentication middleware and JWT verification

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::auth::AuthProvider;
use crate::app::AppState;
use crate::util::time::unix_millis;

type HmacSha256 = Hmac<Sha256>;

/// Claims read from a player's access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (player ID)
    pub sub: String,
    /// Audience, a string or a list depending on the issuer
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Issuer
    #[serde(default)]
    pub iss: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "cognito:username", default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Verify an HS256 token against a shared secret and extract claims
pub fn verify_jwt(token: &str, secret: &str) -> Result<JwtClaims, AuthError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::InvalidToken);
    };

    let message = format!("{}.{}", header_b64, payload_b64);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(message.as_bytes());

    let provided_signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    mac.verify_slice(&provided_signature)
        .map_err(|_| AuthError::InvalidToken)?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims: JwtClaims = serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp < unix_millis() / 1000 {
        return Err(AuthError::TokenExpired);
    }
    if claims.sub.is_empty() {
        return Err(AuthError::InvalidToken);
    }

    Ok(claims)
}

/// Token from an `Authorization` header value, with or without the
/// `Bearer ` scheme
pub fn extract_token(auth_header: &str) -> Option<&str> {
    let token = auth_header
        .strip_prefix("Bearer ")
        .unwrap_or(auth_header)
        .trim();
    (!token.is_empty()).then_some(token)
}

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid authorization header format")]
    InvalidFormat,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid issuer")]
    InvalidIssuer,

    #[error("Signing key not found")]
    UnknownKey,

    #[error("Failed to fetch signing keys: {0}")]
    KeyFetch(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Authenticated user extractor result
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub claims: JwtClaims,
}

/// Verify the `Authorization` header of a request.
pub async fn authenticate(
    headers: &HeaderMap,
    auth: &dyn AuthProvider,
) -> Result<AuthenticatedUser, AuthError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::MissingHeader)?;
    let token = extract_token(auth_header).ok_or(AuthError::InvalidFormat)?;

    let claims = auth.verify(token).await?;
    Ok(AuthenticatedUser {
        user_id: claims.sub.clone(),
        claims,
    })
}

/// Middleware to require authentication
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_user = authenticate(request.headers(), state.auth.as_ref()).await?;

    // Insert into request extensions for handlers to access
    request.extensions_mut().insert(auth_user);

    Ok(next.run(request).await)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    /// Sign `claims` as an HS256 token.
    pub(crate) fn hs256_token(claims: &serde_json::Value, secret: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{header}.{payload}").as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header}.{payload}.{signature}")
    }

    fn claims_expiring_in(secs: i64) -> serde_json::Value {
        let now = (unix_millis() / 1000) as i64;
        serde_json::json!({"sub": "player-1", "exp": now + secs, "iat": now})
    }

    #[test]
    fn accepts_valid_token() {
        let token = hs256_token(&claims_expiring_in(3600), "secret");
        let claims = assert_ok!(verify_jwt(&token, "secret"));
        assert_eq!(claims.sub, "player-1");
        assert_err!(verify_jwt(&token, "Secret"));
    }

    #[test]
    fn rejects_bad_signature_and_shape() {
        let token = hs256_token(&claims_expiring_in(3600), "secret");
        assert!(matches!(verify_jwt(&token, "other"), Err(AuthError::InvalidToken)));
        assert!(matches!(verify_jwt("a.b", "secret"), Err(AuthError::InvalidToken)));
        assert!(matches!(verify_jwt("a.b.c.d", "secret"), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn rejects_expired_token() {
        let token = hs256_token(&claims_expiring_in(-60), "secret");
        assert!(matches!(verify_jwt(&token, "secret"), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn token_with_or_without_scheme() {
        assert_eq!(extract_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_token("abc"), Some("abc"));
        assert_eq!(extract_token("Bearer "), None);
        assert_eq!(extract_token(""), None);
    }

    #[test]
    fn auth_errors_are_unauthorized() {
        let response = AuthError::KeyFetch("down".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
