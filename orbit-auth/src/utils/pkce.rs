//! RFC 7636 proof key for code exchange. Only `S256` is supported.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const METHOD_S256: &str = "S256";

/// `base64url_nopad(sha256(verifier))`
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn is_supported_method(method: &str) -> bool {
    method == METHOD_S256
}

/// Constant-time comparison of the derived challenge with the stored one.
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    s256_challenge(verifier)
        .as_bytes()
        .ct_eq(challenge.as_bytes())
        .into()
}

/// Verifier syntax from RFC 7636 section 4.1: 43-128 unreserved characters.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// An S256 challenge is a base64url SHA-256 digest: exactly 43 characters.
pub fn is_valid_challenge(challenge: &str) -> bool {
    challenge.len() == 43
        && challenge
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Appendix B of RFC 7636.
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn rfc_vector_matches() {
        assert_eq!(s256_challenge(VERIFIER), CHALLENGE);
        assert!(verify_s256(VERIFIER, CHALLENGE));
    }

    #[test]
    fn mismatched_verifier_fails() {
        assert!(!verify_s256("another-verifier-another-verifier-another-ver", CHALLENGE));
    }

    #[test]
    fn only_s256_is_supported() {
        assert!(is_supported_method("S256"));
        assert!(!is_supported_method("plain"));
        assert!(!is_supported_method("s256"));
    }

    #[test]
    fn verifier_syntax() {
        assert!(is_valid_verifier(VERIFIER));
        assert!(!is_valid_verifier("short"));
        assert!(!is_valid_verifier(&"a".repeat(129)));
        assert!(!is_valid_verifier(&format!("{}!", "a".repeat(50))));
    }

    #[test]
    fn challenge_syntax() {
        assert!(is_valid_challenge(CHALLENGE));
        assert!(!is_valid_challenge(VERIFIER.trim_end_matches('k')));
        assert!(!is_valid_challenge(&format!("{}=", &CHALLENGE[..42])));
    }
}
