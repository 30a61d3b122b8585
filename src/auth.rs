//! Request identity extractors.
//!
//! Authentication itself happens upstream: the auth layer in front of
//! this service verifies credentials and forwards the user id in the
//! `X-User-Id` header. Guest requests carry only the `X-Cart-Session`
//! header, and the absence of a user identity is a valid state for the
//! cart endpoints.

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const CART_SESSION_HEADER: &str = "x-cart-session";

/// Required authenticated identity; rejects with 401 when absent.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(AuthenticatedUser)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Optional authenticated identity for the guest-capable endpoints.
#[derive(Debug, Clone, Copy)]
pub struct OptionalUser(pub Option<Uuid>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for OptionalUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalUser(
            parts
                .headers
                .get(USER_ID_HEADER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| Uuid::parse_str(s).ok()),
        ))
    }
}

/// Guest cart session id from `X-Cart-Session`, when present.
#[derive(Debug, Clone)]
pub struct CartSession(pub Option<String>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CartSession {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(CartSession(
            parts
                .headers
                .get(CART_SESSION_HEADER)
                .and_then(|h| h.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        ))
    }
}
