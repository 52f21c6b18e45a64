//! HS256 JWT handling.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// JWT claims carried by technician tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Technician username
    pub sub: String,
    /// Role, e.g. "technician" or "admin"
    #[serde(default)]
    pub role: Option<String>,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Sign a token for `username` valid for `lifetime`.
pub fn issue_token(
    secret: &str,
    username: &str,
    role: Option<&str>,
    lifetime: Duration,
) -> Result<String, AppError> {
    let claims = Claims {
        sub: username.to_string(),
        role: role.map(str::to_string),
        exp: (Utc::now() + lifetime).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to generate token: {}", e)))
}

/// Validate a token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))
}
