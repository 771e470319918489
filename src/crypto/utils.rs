//! Utility functions for cryptographic operations.

use rand::RngCore;

/// Number of random bytes behind a stream token.
pub const TOKEN_BYTES: usize = 16;

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate an opaque, URL-safe stream token (lowercase hex).
pub fn generate_token() -> String {
    hex::encode(generate_random_bytes(TOKEN_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(generate_random_bytes(0).len(), 0);
        assert_eq!(generate_random_bytes(33).len(), 33);
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }
}
