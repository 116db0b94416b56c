//! JWT authentication and role checks.
//!
//! Provides JWT encoding/decoding plus an `AuthUser` Axum extractor that
//! accepts either `Authorization: Bearer <JWT>` or, for trigger callers such
//! as cron and the chat transport, `X-API-Key: <SERVICE_API_KEY>`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;

use crate::state::AppState;

/// Caller role carried in the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Service,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
            Role::Service => write!(f, "service"),
        }
    }
}

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (the user's UUID)
    pub sub: String,
    pub role: Role,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Authenticated caller.
///
/// The service principal (API key) has the nil user id.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    /// Reject the caller unless its role is one of `allowed`.
    pub fn require(&self, allowed: &[Role]) -> Result<(), AppError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "role '{}' may not call this endpoint",
                self.role
            )))
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Service)
    }
}

/// Encode a JWT token for a user.
pub fn encode_jwt(
    user_id: Uuid,
    role: Role,
    secret: &str,
    expiry_hours: u64,
) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id.to_string(),
        role,
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok());

        if let Some(token) = auth_header.and_then(|auth| auth.strip_prefix("Bearer ")) {
            let claims = decode_jwt(token, &state.config.jwt_secret)?;
            let user_id = Uuid::parse_str(&claims.sub)
                .map_err(|_| AppError::Auth("Invalid user ID in token".to_string()))?;
            return Ok(AuthUser {
                user_id,
                role: claims.role,
            });
        }

        let api_key = parts.headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if let (Some(given), Some(expected)) = (api_key, state.config.service_api_key.as_deref()) {
            if !expected.is_empty() && given == expected {
                return Ok(AuthUser {
                    user_id: Uuid::nil(),
                    role: Role::Service,
                });
            }
            return Err(AppError::Auth("Invalid API key".to_string()));
        }

        Err(AppError::Auth(
            "Missing or invalid Authorization header. Use 'Bearer <JWT>' or 'X-API-Key: <key>'"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-secret-key-for-unit-tests";

    #[test]
    fn test_encode_decode_jwt() {
        let user_id = Uuid::new_v4();
        let token = encode_jwt(user_id, Role::Admin, TEST_SECRET, 24).unwrap();
        let claims = decode_jwt(&token, TEST_SECRET).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, Role::Admin);
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let token = encode_jwt(Uuid::new_v4(), Role::User, TEST_SECRET, 24).unwrap();
        assert!(decode_jwt(&token, "wrong-secret").is_err());
    }

    #[test]
    fn test_expired_jwt_rejected() {
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            role: Role::User,
            exp: (now - Duration::hours(1)).timestamp(),
            iat: (now - Duration::hours(2)).timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        assert!(decode_jwt(&token, TEST_SECRET).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(decode_jwt("not.a.valid.jwt", TEST_SECRET).is_err());
    }

    #[test]
    fn test_role_check() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            role: Role::User,
        };
        assert!(matches!(
            user.require(&[Role::Admin, Role::Service]),
            Err(AppError::Forbidden(_))
        ));
        assert!(user.require(&[Role::User]).is_ok());
        assert!(!user.is_privileged());
    }
}
