//! Bearer-token authentication for the management API
//!
//! Tokens are HS256 JWTs carrying the user id in `sub`. Organization
//! membership is checked per request against the store, before any
//! organization data is read.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{NotifyError, Result};
use crate::manager::NotifyManager;
use crate::store::Persistence;

/// Header the external scheduler authenticates with
pub const SCHEDULER_TOKEN_HEADER: &str = "x-scheduler-token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub exp: i64,
}

/// Authenticated caller of a management endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
}

impl AuthUser {
    /// Fail with `Forbidden` unless the caller belongs to `organization_id`
    pub async fn require_member(
        &self,
        store: &dyn Persistence,
        organization_id: Uuid,
    ) -> Result<()> {
        if store.is_member(organization_id, &self.user_id).await? {
            Ok(())
        } else {
            warn!(
                user_id = %self.user_id,
                organization_id = %organization_id,
                "Access to organization denied"
            );
            Err(NotifyError::forbidden(format!(
                "not a member of organization {}",
                organization_id
            )))
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<NotifyManager>> for AuthUser {
    type Rejection = NotifyError;

    async fn from_request_parts(
        parts: &mut Parts,
        manager: &Arc<NotifyManager>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let claims = validate_token(token, &manager.config().auth.jwt_secret)?;
        debug!(user_id = %claims.sub, "Authenticated request");
        Ok(AuthUser {
            user_id: claims.sub,
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| NotifyError::unauthorized("missing Authorization header"))?
        .to_str()
        .map_err(|_| NotifyError::unauthorized("invalid Authorization header encoding"))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| NotifyError::unauthorized("expected a Bearer token"))
}

/// Decode and verify a token
pub fn validate_token(token: &str, secret: &str) -> Result<Claims> {
    if secret.is_empty() {
        return Err(NotifyError::unauthorized("token authentication is not configured"));
    }

    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| {
            warn!(error = %e, "Token validation failed");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    NotifyError::unauthorized("token has expired")
                }
                _ => NotifyError::unauthorized("invalid token"),
            }
        })?;
    Ok(data.claims)
}

/// Sign a token for `user_id`, valid for `ttl`
pub fn issue_token(user_id: &str, secret: &str, ttl: Duration) -> Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Check the scheduler's shared token in constant time
pub fn verify_scheduler_token(headers: &HeaderMap, expected: &str) -> Result<()> {
    if expected.is_empty() {
        return Err(NotifyError::unauthorized("scheduler token is not configured"));
    }
    let presented = headers
        .get(SCHEDULER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| NotifyError::unauthorized("missing scheduler token"))?;

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(NotifyError::unauthorized("invalid scheduler token"))
    }
}
