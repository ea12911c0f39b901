//! Who is making the current request.
//!
//! With `server.api_token` set, only requests presenting it as a bearer token
//! are API actors; everything else is public and can neither sync nor mint or
//! use nonces. Without a token every request is trusted, which is only sane on
//! a loopback bind.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use treemirror_core::config::ServerConfig;
use treemirror_core::nonce;
use treemirror_core::ports::Authorizer;
use treemirror_core::types::{Capability, RequestOrigin};

#[derive(Debug, Clone)]
pub struct RequestActor {
    pub origin: RequestOrigin,
    can_manage: bool,
    nonce_secret: String,
}

impl RequestActor {
    pub fn from_headers(headers: &HeaderMap, server: &ServerConfig) -> Self {
        let trusted = match &server.api_token {
            None => true,
            Some(expected) => bearer_token(headers).is_some_and(|presented| tokens_match(presented, expected)),
        };
        Self {
            origin: if trusted {
                RequestOrigin::Api
            } else {
                RequestOrigin::Public
            },
            can_manage: trusted,
            nonce_secret: server.nonce_secret.clone(),
        }
    }

    /// Local operator running the CLI against the database directly.
    pub fn admin(nonce_secret: impl Into<String>) -> Self {
        Self {
            origin: RequestOrigin::Admin,
            can_manage: true,
            nonce_secret: nonce_secret.into(),
        }
    }

    pub fn nonce_for(&self, action: &str) -> Option<String> {
        self.can_manage
            .then(|| nonce::issue(&self.nonce_secret, action))
    }
}

impl Authorizer for RequestActor {
    fn current_actor_can(&self, capability: Capability) -> bool {
        match capability {
            Capability::ManageMenus => self.can_manage,
        }
    }

    fn verify(&self, token: &str, action: &str) -> bool {
        self.can_manage && nonce::verify(&self.nonce_secret, action, token)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Compare through BLAKE3 digests, whose equality is constant-time.
fn tokens_match(presented: &str, expected: &str) -> bool {
    blake3::hash(presented.as_bytes()) == blake3::hash(expected.as_bytes())
}
