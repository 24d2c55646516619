//! Bearer token verification for the relay handshake.
//!
//! Tokens are issued by the platform's auth subsystem. The relay only needs to
//! turn a presented token into a [`UserId`] or refuse it.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use relay_common::UserId;
use serde::{Deserialize, Serialize};

/// Reasons a presented token is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Malformed,
    Expired,
    MissingSubject,
}

impl TokenRejection {
    pub fn message(self) -> &'static str {
        match self {
            Self::Malformed => "Invalid token",
            Self::Expired => "Token expired",
            Self::MissingSubject => "Token has no subject",
        }
    }
}

/// Identity verification supplied by the auth subsystem.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId, TokenRejection>;
}

/// Claims accepted by [`JwtVerifier`].
///
/// The subject may arrive as `sub` or as the legacy `id` claim.
#[derive(Debug, Serialize, Deserialize)]
pub struct RelayClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub exp: i64,
}

/// HS256 JWT verifier sharing a secret with the token issuer.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, TokenRejection> {
        let data = jsonwebtoken::decode::<RelayClaims>(token, &self.key, &self.validation)
            .map_err(|e| {
                tracing::debug!(?e, "token validation failed");
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenRejection::Expired,
                    _ => TokenRejection::Malformed,
                }
            })?;

        let claims = data.claims;
        claims
            .sub
            .or(claims.id)
            .filter(|s| !s.is_empty())
            .map(UserId::new)
            .ok_or(TokenRejection::MissingSubject)
    }
}
