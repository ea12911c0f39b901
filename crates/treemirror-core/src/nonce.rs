//! Action nonces guarding the override and completion-poll endpoints.
//!
//! A nonce is a keyed BLAKE3 hash of the action string (`override:<slug>`,
//! `poll:<slug>`), so a token minted for one entity/action cannot be replayed
//! against another.

use crate::constants;

pub fn override_action(slug: &str) -> String {
    format!("override:{slug}")
}

pub fn poll_action(slug: &str) -> String {
    format!("poll:{slug}")
}

fn action_hash(secret: &str, action: &str) -> blake3::Hash {
    let key = blake3::derive_key(constants::NONCE_CONTEXT, secret.as_bytes());
    blake3::keyed_hash(&key, action.as_bytes())
}

/// Mint the nonce for `action`.
pub fn issue(secret: &str, action: &str) -> String {
    action_hash(secret, action).to_hex().to_string()
}

/// Check a presented nonce. Comparison is constant-time.
pub fn verify(secret: &str, action: &str, token: &str) -> bool {
    match blake3::Hash::from_hex(token.trim()) {
        Ok(presented) => presented == action_hash(secret, action),
        Err(_) => false,
    }
}
