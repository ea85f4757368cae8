//! Bearer Authentication Extractor
//!
//! The authenticated caller is an explicit handler parameter, never
//! ambient state: every handler that needs a user declares [`AuthSession`]
//! and receives the token's owner, freshly loaded from the store.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use payrail_ledger::model::User;
use payrail_ledger::store::Store;

use crate::error::ApiError;
use crate::AppState;

/// The authenticated caller plus the exact token that authenticated them
/// (logout revokes that token only).
pub struct AuthSession {
    pub user: User,
    pub token: String,
}

impl<S: Store> FromRequestParts<AppState<S>> for AuthSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?
            .to_string();

        let user = state
            .identity
            .authenticate(&token)
            .await
            .map_err(ApiError::from)?
            .ok_or(ApiError::Unauthorized)?;

        Ok(AuthSession { user, token })
    }
}
