//! JWT issuance and validation.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{MiddlewareError, Result};

/// Claims carried by every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Tenant game id the token is scoped to.
    pub game_id: String,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Authenticated identity attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub game_id: String,
    pub scopes: Vec<String>,
    pub expires_at: i64,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            game_id: claims.game_id,
            scopes: claims.scopes,
            expires_at: claims.exp,
        }
    }
}

/// HS256 token validator and issuer.
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expiry_seconds: i64,
}

impl JwtValidator {
    pub fn new(secret: &str, expiry_seconds: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            expiry_seconds: expiry_seconds as i64,
        }
    }

    /// Issue a token for a user of a game.
    pub fn issue(&self, user_id: &str, game_id: &str, scopes: Vec<String>) -> Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            game_id: game_id.to_string(),
            exp: chrono::Utc::now().timestamp() + self.expiry_seconds,
            scopes,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| MiddlewareError::Internal(format!("token encoding failed: {e}")))
    }

    /// Validate a bearer token and extract the identity. Expired or
    /// otherwise invalid tokens are `Unauthenticated`.
    pub fn validate(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(error = %e, "token validation failed");
            MiddlewareError::Unauthenticated(format!("invalid token: {e}"))
        })?;
        Ok(Identity::from(data.claims))
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn extract_token_from_header(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
