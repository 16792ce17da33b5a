use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::billing::models::Tier;

#[derive(Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    tier: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Identity behind a request. `tier` seeds the subscriber on first sign-in only.
#[derive(Debug, Clone)]
pub struct AuthSubscriber {
    pub subject: String,
    pub tier: Tier,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthSubscriber
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token_opt = if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("auth_token=").map(|s| s.to_string())
            })
        } else if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
            authz
                .to_str()
                .ok()
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
        } else {
            None
        };
        let token = token_opt.ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::JWT_SECRET.as_deref().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "JWT secret not configured".into(),
        ))?;
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;

        let subject = decoded.claims.sub.trim().to_string();
        if subject.is_empty() {
            return Err((StatusCode::UNAUTHORIZED, "Invalid token".into()));
        }
        Ok(AuthSubscriber {
            subject,
            tier: decoded
                .claims
                .tier
                .as_deref()
                .map(Tier::parse)
                .unwrap_or_default(),
        })
    }
}
