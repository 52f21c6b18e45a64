//! Authentication extractor.
//!
//! With `AUTH_SECRET` configured every request needs a valid bearer token.
//! Without it the server runs in development mode and requests without an
//! `Authorization` header are served anonymously.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::token::verify_token;
use crate::error::AppError;
use crate::AppState;

/// Authenticated user extracted from request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Technician username, or "anonymous" in development mode
    pub username: String,
    pub role: Option<String>,
}

impl AuthUser {
    fn anonymous() -> Self {
        Self {
            username: "anonymous".to_string(),
            role: None,
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match (auth_header, state.config.auth_secret.as_deref()) {
            (Some(header), secret) => {
                let token = header
                    .strip_prefix("Bearer ")
                    .map(str::trim)
                    .ok_or_else(|| {
                        AppError::Unauthorized("Invalid authorization header format".into())
                    })?;
                if token.is_empty() {
                    return Err(AppError::Unauthorized("Empty bearer token".into()));
                }

                match secret {
                    Some(secret) => {
                        let claims = verify_token(secret, token)?;
                        Ok(AuthUser {
                            username: claims.sub,
                            role: claims.role,
                        })
                    }
                    // No secret configured: accept the header, identity unknown
                    None => Ok(AuthUser::anonymous()),
                }
            }
            (None, None) => Ok(AuthUser::anonymous()),
            (None, Some(_)) => Err(AppError::Unauthorized(
                "Missing authorization header".into(),
            )),
        }
    }
}
