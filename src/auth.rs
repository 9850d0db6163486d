//! # Authentication and Authorization
//!
//! Operator bearer authentication, acting-user resolution and the site-admin
//! checks applied by the admin endpoints.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::config::AppConfig;
use crate::error::{ApiError, forbidden, unauthorized};
use crate::repositories::UserRepository;
use crate::server::AppState;

/// Header naming the user on whose behalf the operator acts.
pub const ACTOR_HEADER: &str = "X-Actor-User-Id";

/// The authenticated acting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i32,
    pub site_admin: bool,
}

impl Actor {
    pub fn require_site_admin(&self) -> Result<(), ApiError> {
        if self.site_admin {
            Ok(())
        } else {
            Err(forbidden(Some("must be site admin")))
        }
    }

    pub fn require_site_admin_or_same_user(&self, user_id: i32) -> Result<(), ApiError> {
        if self.site_admin || self.user_id == user_id {
            Ok(())
        } else {
            Err(forbidden(Some("must be site admin or the same user")))
        }
    }
}

/// Validate the operator token and resolve the acting user.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    validate_token(&state.config, token)?;

    let actor_id = extract_actor_id(request.headers())?;
    let user = UserRepository::new(state.db.clone())
        .get_by_id(actor_id)
        .await?
        .ok_or_else(|| unauthorized(Some("Unknown actor")))?;

    tracing::debug!(actor_id = user.id, site_admin = user.site_admin, "Authenticated operator request");
    request.extensions_mut().insert(Actor {
        user_id: user.id,
        site_admin: user.site_admin,
    });

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_actor_id(headers: &HeaderMap) -> Result<i32, ApiError> {
    headers
        .get(ACTOR_HEADER)
        .ok_or_else(|| unauthorized(Some("Missing X-Actor-User-Id header")))?
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .ok_or_else(|| unauthorized(Some("Invalid X-Actor-User-Id header")))
}

impl<S> FromRequestParts<S> for Actor
where
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Actor>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Authentication required")))
    }
}
