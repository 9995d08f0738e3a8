//! Access and refresh token signing
//!
//! Access and refresh tokens are HS256 JWTs signed with two independent
//! secrets. Every verification failure (signature, expiry, type tag, shape)
//! surfaces as the same `Unauthenticated` condition. Issue and expiry times
//! come from the injected clock.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::clock::Clock;
use super::users::Role;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
enum JwtError {
    #[error("token rejected: {0}")]
    Rejected(#[from] jsonwebtoken::errors::Error),
    #[error("expected {expected:?} token, got {actual:?}")]
    WrongTokenType {
        expected: TokenType,
        actual: TokenType,
    },
    #[error("refresh token without jti")]
    MissingJti,
    #[error("token expired at {0}")]
    Expired(i64),
}

/// A freshly signed token and the instant it stops being valid
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[derive(Clone)]
pub struct JwtManager {
    access_keys: Arc<KeyPair>,
    refresh_keys: Arc<KeyPair>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JwtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtManager")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl JwtManager {
    pub fn new(
        access_secret: &str,
        refresh_secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            access_keys: Arc::new(KeyPair::from_secret(access_secret)),
            refresh_keys: Arc::new(KeyPair::from_secret(refresh_secret)),
            access_ttl,
            refresh_ttl,
            clock,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access(&self, user_id: Uuid, role: Role) -> Result<IssuedToken, ApiError> {
        self.sign(user_id, role, TokenType::Access, None)
    }

    /// Sign a refresh token carrying `jti` unchanged
    pub fn issue_refresh(
        &self,
        user_id: Uuid,
        role: Role,
        jti: &str,
    ) -> Result<IssuedToken, ApiError> {
        self.sign(user_id, role, TokenType::Refresh, Some(jti.to_string()))
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, ApiError> {
        self.verify(token, TokenType::Access)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims, ApiError> {
        self.verify(token, TokenType::Refresh)
    }

    fn keys(&self, token_type: TokenType) -> &KeyPair {
        match token_type {
            TokenType::Access => self.access_keys.as_ref(),
            TokenType::Refresh => self.refresh_keys.as_ref(),
        }
    }

    fn sign(
        &self,
        user_id: Uuid,
        role: Role,
        token_type: TokenType,
        jti: Option<String>,
    ) -> Result<IssuedToken, ApiError> {
        let now = self.clock.now();
        let ttl = match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let expires_at = now + ttl;

        let claims = Claims {
            sub: user_id,
            role,
            token_type,
            jti,
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };

        let token = self.encode_claims(&claims)?;
        Ok(IssuedToken { token, expires_at })
    }

    fn encode_claims(&self, claims: &Claims) -> Result<String, ApiError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.keys(claims.token_type).encoding,
        )
        .map_err(|e| ApiError::Internal(format!("failed to sign token: {e}")))
    }

    fn verify(&self, token: &str, expected: TokenType) -> Result<Claims, ApiError> {
        self.decode_claims(token, expected).map_err(|e| {
            tracing::debug!(error = %e, expected = ?expected, "Token verification failed");
            ApiError::invalid_token()
        })
    }

    fn decode_claims(&self, token: &str, expected: TokenType) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is judged against the injected clock below
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<Claims>(token, &self.keys(expected).decoding, &validation)?.claims;

        if claims.exp <= self.clock.now().unix_timestamp() {
            return Err(JwtError::Expired(claims.exp));
        }

        if claims.token_type != expected {
            return Err(JwtError::WrongTokenType {
                expected,
                actual: claims.token_type,
            });
        }
        if expected == TokenType::Refresh && !matches!(claims.jti.as_deref(), Some(jti) if !jti.is_empty())
        {
            return Err(JwtError::MissingJti);
        }

        Ok(claims)
    }
}
