//! Connection authentication against a static table of bearer tokens.

use std::collections::HashMap;
use std::str::FromStr;

use axum::http::{header, HeaderMap};

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub principal: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid token")]
    InvalidToken,
}

/// Turns a presented credential into an [`Identity`].
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// One `principal=secret` pair from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpec {
    pub principal: String,
    pub secret: String,
}

impl FromStr for TokenSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (principal, secret) = s
            .split_once('=')
            .ok_or_else(|| format!("expected principal=secret, got {s:?}"))?;
        let principal = principal.trim();
        let secret = secret.trim();
        if principal.is_empty() || secret.is_empty() {
            return Err("principal and secret must both be non-empty".into());
        }
        Ok(Self {
            principal: principal.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// Maps secrets to principals.
pub struct TokenTable {
    by_secret: HashMap<String, String>,
}

impl TokenTable {
    pub fn new(specs: impl IntoIterator<Item = TokenSpec>) -> Self {
        let by_secret = specs
            .into_iter()
            .map(|spec| (spec.secret, spec.principal))
            .collect();
        Self { by_secret }
    }

    pub fn len(&self) -> usize {
        self.by_secret.len()
    }
}

impl Authenticator for TokenTable {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        self.by_secret
            .get(token)
            .map(|principal| Identity {
                principal: principal.clone(),
            })
            .ok_or(AuthError::InvalidToken)
    }
}

/// Extract the token from an `Authorization: Bearer …` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}
