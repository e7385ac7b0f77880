//! Bearer token generation, parsing and hashing.
//!
//! Plaintext format: `ns_<base64url(namespace-id)>_<64 hex chars>`. The
//! middle segment lets the server (and clients) recover the namespace id
//! without a registry lookup; authentication still hashes the entire
//! plaintext and compares against the stored hash, so the id segment
//! carries no authority on its own.
//!
//! Stored format: `v1$<salt hex>$<sha256 hex of salt ‖ plaintext>`. The
//! version prefix leaves room to migrate the scheme without rehashing
//! every namespace at once.

use base64::URL_SAFE_NO_PAD;
use eventodb::{Error, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

const TOKEN_PREFIX: &str = "ns";
const SECRET_BYTES: usize = 32;
const SALT_BYTES: usize = 8;
const HASH_VERSION: &str = "v1";

/// Generates a fresh plaintext token for a namespace. The plaintext is
/// returned exactly once; only its hash is ever stored.
pub fn generate(namespace: &str) -> String {
    let mut secret = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut secret);
    format!(
        "{TOKEN_PREFIX}_{}_{}",
        base64::encode_config(namespace, URL_SAFE_NO_PAD),
        hex::encode(secret),
    )
}

/// Extracts the namespace id from a presented token.
pub fn parse_namespace(token: &str) -> Result<String> {
    let mut parts = token.splitn(3, '_');
    let (prefix, encoded, secret) = match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(encoded), Some(secret)) => (prefix, encoded, secret),
        _ => return Err(Error::AuthInvalidToken),
    };

    if prefix != TOKEN_PREFIX || secret.is_empty() {
        return Err(Error::AuthInvalidToken);
    }

    let decoded = base64::decode_config(encoded, URL_SAFE_NO_PAD)
        .map_err(|_| Error::AuthInvalidToken)?;
    String::from_utf8(decoded).map_err(|_| Error::AuthInvalidToken)
}

/// Hashes a plaintext token with a fresh random salt.
pub fn hash(token: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = hex::encode(salt);
    format!("{HASH_VERSION}${salt}${}", digest(&salt, token))
}

/// Verifies a presented plaintext against a stored hash.
pub fn verify(token: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(HASH_VERSION), Some(salt), Some(expected)) => digest(salt, token) == expected,
        _ => false,
    }
}

fn digest(salt: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_parse_back_to_their_namespace() {
        let token = generate("tenant-1");
        assert!(token.starts_with("ns_"));
        assert_eq!(parse_namespace(&token).unwrap(), "tenant-1");

        // 64 hex chars of secret material.
        let secret = token.rsplit('_').next().unwrap();
        assert_eq!(secret.len(), 64);
    }

    #[test]
    fn hash_verifies_only_the_original_plaintext() {
        let token = generate("tenant-1");
        let stored = hash(&token);
        assert!(verify(&token, &stored));
        assert!(!verify(&generate("tenant-1"), &stored));
        assert!(!verify(&token, "garbage"));
    }

    #[test]
    fn two_hashes_of_one_token_differ_but_both_verify() {
        let token = generate("tenant-1");
        let a = hash(&token);
        let b = hash(&token);
        assert_ne!(a, b);
        assert!(verify(&token, &a));
        assert!(verify(&token, &b));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for token in ["", "ns", "ns_", "ns_!!!_abc", "other_dGVuYW50_aa", "ns_dGVuYW50_"] {
            assert!(parse_namespace(token).is_err(), "{token:?} should not parse");
        }
    }
}
