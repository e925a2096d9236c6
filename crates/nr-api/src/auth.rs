//! API-key authentication.
//!
//! Extracts the `X-API-Key` header and resolves it to a [`Tenant`] through
//! the key store. Handlers take `AuthedTenant` as an argument; requests
//! without a valid key never reach them.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

use nr_store::Tenant;

use crate::error::ApiError;
use crate::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The tenant authenticated for this request.
pub struct AuthedTenant(pub Tenant);

impl std::ops::Deref for AuthedTenant {
    type Target = Tenant;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedTenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let tenant = state
            .api_keys
            .resolve(key)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or(ApiError::Unauthorized)?;

        Ok(AuthedTenant(tenant))
    }
}
