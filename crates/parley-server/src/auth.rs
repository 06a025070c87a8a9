//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs carrying the numeric user id. They are accepted from
//! the `Authorization: Bearer` header or, for browser websocket clients that
//! cannot set headers, from a `?token=` query parameter. Login also hands out
//! a longer-lived refresh token, which is never accepted as a bearer token.

use std::time::Duration;

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use parley_core::UserId;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    #[default]
    Access,
    Refresh,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    #[serde(default)]
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// Access and refresh tokens returned by a successful login.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Signs and verifies bearer tokens with a shared secret.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    /// Refresh tokens default to the access lifetime until
    /// [`TokenService::with_refresh_ttl`] says otherwise.
    pub fn new(secret: &SecretString, ttl: Duration) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            validation,
            ttl,
            refresh_ttl: ttl,
        }
    }

    pub fn with_refresh_ttl(mut self, refresh_ttl: Duration) -> Self {
        self.refresh_ttl = refresh_ttl;
        self
    }

    /// A bearer token for `user_id`.
    pub fn issue(&self, user_id: UserId) -> Result<String, AuthError> {
        self.issue_at(user_id, TokenKind::Access, Utc::now())
    }

    pub fn issue_pair(&self, user_id: UserId) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        Ok(TokenPair {
            access_token: self.issue_at(user_id, TokenKind::Access, now)?,
            refresh_token: self.issue_at(user_id, TokenKind::Refresh, now)?,
        })
    }

    fn issue_at(
        &self,
        user_id: UserId,
        kind: TokenKind,
        issued_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let ttl = match kind {
            TokenKind::Access => self.ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AuthError::Signing(format!("ttl out of range: {e}")))?;
        let claims = Claims {
            user_id,
            kind,
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })
    }

    /// Check a bearer token. Refresh tokens are rejected.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let claims = self.decode(token)?;
        if claims.kind != TokenKind::Access {
            return Err(AuthError::Invalid("not an access token".into()));
        }
        Ok(claims.user_id)
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pull the raw token from the request, header first.
pub fn token_from_parts(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_owned())
        })
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token)
            .filter(|t| !t.is_empty())
    })
}

/// The authenticated caller of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or(AuthError::MissingToken)?;
        let user_id = state.tokens.verify(&token)?;
        Ok(AuthUser(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn service() -> TokenService {
        TokenService::new(&SecretString::from("test-secret".to_owned()), Duration::from_secs(3600))
    }

    fn parts(uri: &str, auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn issue_then_verify() {
        let tokens = service();
        let token = tokens.issue(UserId::new(42)).unwrap();
        assert_eq!(tokens.verify(&token).unwrap(), UserId::new(42));
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = service();
        let token = tokens
            .issue_at(
                UserId::new(1),
                TokenKind::Access,
                Utc::now() - chrono::Duration::hours(2),
            )
            .unwrap();
        assert!(matches!(tokens.verify(&token).unwrap_err(), AuthError::Expired));
    }

    #[test]
    fn login_pair_has_longer_lived_refresh_token() {
        let tokens = service().with_refresh_ttl(Duration::from_secs(7 * 24 * 3600));
        let pair = tokens.issue_pair(UserId::new(5)).unwrap();
        assert_eq!(tokens.verify(&pair.access_token).unwrap(), UserId::new(5));

        let access = tokens.decode(&pair.access_token).unwrap();
        let refresh = tokens.decode(&pair.refresh_token).unwrap();
        assert_eq!(refresh.kind, TokenKind::Refresh);
        assert_eq!(refresh.user_id, UserId::new(5));
        assert_eq!(refresh.exp - refresh.iat, 7 * 24 * 3600);
        assert_eq!(access.exp - access.iat, 3600);
    }

    #[test]
    fn refresh_token_is_not_a_bearer_token() {
        let tokens = service();
        let pair = tokens.issue_pair(UserId::new(5)).unwrap();
        assert!(matches!(tokens.verify(&pair.refresh_token).unwrap_err(), AuthError::Invalid(_)));
    }

    #[test]
    fn token_signed_with_other_secret_is_invalid() {
        let other = TokenService::new(&SecretString::from("other".to_owned()), Duration::from_secs(60));
        let token = other.issue(UserId::new(1)).unwrap();
        assert!(matches!(service().verify(&token).unwrap_err(), AuthError::Invalid(_)));
        assert!(matches!(service().verify("garbage").unwrap_err(), AuthError::Invalid(_)));
    }

    #[test]
    fn bearer_header_is_preferred() {
        let p = parts("/ws?token=from-query", Some("Bearer from-header"));
        assert_eq!(token_from_parts(&p).as_deref(), Some("from-header"));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let p = parts("/api/chats", Some("bearer abc"));
        assert_eq!(token_from_parts(&p).as_deref(), Some("abc"));
    }

    #[test]
    fn falls_back_to_query_parameter() {
        let p = parts("/ws?chat=1&token=q-token", None);
        assert_eq!(token_from_parts(&p).as_deref(), Some("q-token"));
        let p = parts("/ws", Some("Basic dXNlcjpwYXNz"));
        assert_eq!(token_from_parts(&p), None);
    }

    #[test]
    fn empty_tokens_are_missing() {
        assert_eq!(token_from_parts(&parts("/ws?token=", Some("Bearer "))), None);
    }
}
