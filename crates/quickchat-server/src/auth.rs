//! Session authentication.
//!
//! Verifies the HS256 JSON Web Tokens issued by the login service. The same
//! check runs once per connection attempt (before admission to the presence
//! registry) and once per REST request via the [`AuthUser`] extractor.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use quickchat_shared::{AuthError, UserId};

use crate::api::AppState;
use crate::error::ServerError;

/// Claims carried by a login token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Identity assigned by the auth service.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at time (Unix timestamp)
    #[serde(default)]
    pub iat: Option<u64>,
}

/// Turns a presented credential into a verified [`UserId`].
#[derive(Clone)]
pub struct SessionAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl SessionAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a credential. `None` or an empty token is `Unauthenticated`;
    /// anything that fails to decode, is expired, or is signed with another
    /// key is `InvalidCredential`.
    pub fn verify(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Unauthenticated)?;

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::InvalidSignature => "bad signature".to_string(),
                other => format!("{other:?}"),
            };
            debug!(reason = %reason, "Credential rejected");
            AuthError::InvalidCredential(reason)
        })?;

        let user_id = data.claims.user_id.trim();
        if user_id.is_empty() {
            return Err(AuthError::InvalidCredential("empty userId claim".into()));
        }

        Ok(UserId::new(user_id))
    }
}

/// The token from an `Authorization` header, with or without the `Bearer `
/// prefix.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth).trim();
    (!token.is_empty()).then_some(token)
}

/// Extractor for the verified caller of a REST request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = state.authenticator.verify(bearer_token(&parts.headers))?;
        Ok(AuthUser(user))
    }
}
