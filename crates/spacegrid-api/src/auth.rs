//! Request authentication.
//!
//! Tokens come from `Authorization: Bearer <token>` or a `token` query
//! parameter (browsers cannot set headers on WebSocket upgrades).

use std::collections::HashMap;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use spacegrid_core::UserId;

use crate::ApiState;
use crate::error::ApiError;

/// Verified identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
}

pub trait Signer: Send + Sync {
    /// Claims for a valid token, `None` otherwise.
    fn verify(&self, token: &str) -> Option<Claims>;
}

/// Pre-shared tokens mapped to user ids, from `[auth] tokens`.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenSigner {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenSigner {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }
}

impl Signer for StaticTokenSigner {
    fn verify(&self, token: &str) -> Option<Claims> {
        self.tokens.get(token).map(|&user_id| Claims { user_id })
    }
}

/// Extractor for an authenticated caller. Rejects with 401.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl FromRequestParts<ApiState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).or_else(|| query_token(parts)).ok_or(ApiError::Unauthorized)?;
        state.signer.verify(&token).map(AuthUser).ok_or(ApiError::Unauthorized)
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn query_token(parts: &Parts) -> Option<String> {
    parts
        .uri
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn static_signer_maps_tokens() {
        let signer = StaticTokenSigner::new(HashMap::from([("s3cret".to_string(), 7)]));
        assert_eq!(signer.verify("s3cret"), Some(Claims { user_id: 7 }));
        assert_eq!(signer.verify("guess"), None);
    }

    #[test]
    fn token_sources() {
        assert_eq!(bearer_token(&parts("/", Some("Bearer abc"))), Some("abc".to_string()));
        assert_eq!(bearer_token(&parts("/", Some("Basic abc"))), None);
        assert_eq!(query_token(&parts("/ws/1/chat?x=1&token=abc", None)), Some("abc".to_string()));
        assert_eq!(query_token(&parts("/ws/1/chat?token=", None)), None);
    }
}
