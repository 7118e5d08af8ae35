//! Auth interceptor surface.
//!
//! A single operation: given the raw `authorization` header, either return
//! an auth context or reject with a status. Implementations parse a scheme
//! prefix, validate it, and return a typed outcome — pluggable so a router
//! isn't locked to one fixed scheme.

use std::collections::HashMap;

use crate::status::{StatusCode, TempoError};

/// An ordered multimap of auth properties, with one key optionally
/// designated the peer-identity key (§4.9, glossary "Peer identity").
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    properties: Vec<(String, String)>,
    peer_identity_key: Option<String>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_peer_identity_key(&mut self, key: impl Into<String>) {
        self.peer_identity_key = Some(key.into());
    }

    /// The peer is authenticated iff a peer-identity key has been
    /// designated (§4.9).
    pub fn is_authenticated(&self) -> bool {
        self.peer_identity_key.is_some()
    }

    pub fn peer_identity(&self) -> Option<&str> {
        self.peer_identity_key.as_deref().and_then(|k| self.get(k))
    }
}

/// A per-request authenticator. Implementors validate the raw
/// `authorization` header and either produce an [`AuthContext`] or reject
/// with a status (propagated normally, §4.9).
pub trait AuthInterceptor: Send + Sync {
    fn authenticate(&self, authorization: Option<&str>) -> Result<AuthContext, TempoError>;
}

/// No authentication: always succeeds with an empty, unauthenticated
/// context. The default when a router is built without an interceptor.
pub struct NoopAuthInterceptor;

impl AuthInterceptor for NoopAuthInterceptor {
    fn authenticate(&self, _authorization: Option<&str>) -> Result<AuthContext, TempoError> {
        Ok(AuthContext::new())
    }
}

/// A static bearer-token interceptor: `Authorization: Bearer <token>` must
/// match one of a configured set of tokens, identified by the caller name
/// bound to that token.
pub struct BearerTokenAuthInterceptor {
    tokens: HashMap<String, String>,
}

impl BearerTokenAuthInterceptor {
    /// `tokens` maps bearer token -> caller identity.
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl AuthInterceptor for BearerTokenAuthInterceptor {
    fn authenticate(&self, authorization: Option<&str>) -> Result<AuthContext, TempoError> {
        let header = authorization.ok_or_else(|| {
            TempoError::new(StatusCode::Unauthenticated, "missing authorization header")
        })?;
        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            TempoError::new(
                StatusCode::Unauthenticated,
                "authorization header must use the Bearer scheme",
            )
        })?;
        let Some(identity) = self.tokens.get(token) else {
            return Err(TempoError::new(
                StatusCode::Unauthenticated,
                "unknown bearer token",
            ));
        };

        let mut ctx = AuthContext::new();
        ctx.insert("caller", identity.clone());
        ctx.set_peer_identity_key("caller");
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interceptor() -> BearerTokenAuthInterceptor {
        let mut tokens = HashMap::new();
        tokens.insert("secret-token".to_string(), "alice".to_string());
        BearerTokenAuthInterceptor::new(tokens)
    }

    #[test]
    fn valid_token_yields_authenticated_context() {
        let ctx = interceptor()
            .authenticate(Some("Bearer secret-token"))
            .unwrap();
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.peer_identity(), Some("alice"));
    }

    #[test]
    fn missing_header_is_unauthenticated_error() {
        let err = interceptor().authenticate(None).unwrap_err();
        assert_eq!(err.status, StatusCode::Unauthenticated);
    }

    #[test]
    fn wrong_scheme_is_rejected() {
        let err = interceptor()
            .authenticate(Some("Basic dXNlcjpwYXNz"))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::Unauthenticated);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let err = interceptor()
            .authenticate(Some("Bearer not-a-real-token"))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::Unauthenticated);
    }

    #[test]
    fn noop_interceptor_is_never_authenticated() {
        let ctx = NoopAuthInterceptor.authenticate(None).unwrap();
        assert!(!ctx.is_authenticated());
    }
}
