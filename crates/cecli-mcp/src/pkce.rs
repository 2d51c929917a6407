//! PKCE (RFC 7636) code verifier and challenge generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes behind a code verifier; encodes to 86 characters.
const VERIFIER_BYTES: usize = 64;

/// Random bytes behind an OAuth `state` parameter.
const STATE_BYTES: usize = 32;

/// A PKCE verifier and its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generate a fresh PKCE pair from the OS random source.
pub fn generate_pkce() -> PkcePair {
    let verifier = random_urlsafe(VERIFIER_BYTES);
    let challenge = code_challenge(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

/// Compute the S256 challenge for a verifier.
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generate an OAuth `state` parameter.
pub fn generate_state() -> String {
    random_urlsafe(STATE_BYTES)
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_length_within_rfc_bounds() {
        let pair = generate_pkce();
        assert!(pair.verifier.len() >= 43);
        assert!(pair.verifier.len() <= 128);
    }

    #[test]
    fn test_verifier_charset() {
        let pair = generate_pkce();
        assert!(pair
            .verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_challenge_matches_verifier() {
        for _ in 0..8 {
            let pair = generate_pkce();
            assert_eq!(pair.challenge, code_challenge(&pair.verifier));
            assert_eq!(pair.challenge.len(), 43);
            assert!(!pair.challenge.contains('='));
        }
    }

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_pairs_are_unique() {
        let a = generate_pkce();
        let b = generate_pkce();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(generate_state(), generate_state());
    }
}
