use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AppError;

#[derive(Deserialize)]
struct Claims {
    sub: String,
    tenant: String,
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Authenticated caller: user, owning tenant and role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSession {
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
}

fn token_from_parts(parts: &Parts) -> Option<String> {
    let from_cookie = parts
        .headers
        .get(axum::http::header::COOKIE)
        .and_then(|header| header.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("auth_token=").map(|s| s.to_string())
            })
        });
    from_cookie.or_else(|| {
        parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|authz| authz.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
    })
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or(AppError::Unauthorized)?;
        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized)?;
        if decoded.claims.tenant.trim().is_empty() {
            return Err(AppError::Unauthorized);
        }
        Ok(TenantSession {
            user_id: decoded.claims.sub,
            tenant_id: decoded.claims.tenant,
            role: decoded.claims.role,
        })
    }
}
