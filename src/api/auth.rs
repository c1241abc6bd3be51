// =============================================================================
// Webhook Secret Verification
// =============================================================================
//
// Every webhook payload carries a shared secret that must match the value
// configured at startup. Comparison is performed in constant time to prevent
// timing side-channel attacks.
// =============================================================================

/// Compare two byte slices in constant time. Returns `true` if they are
/// identical. The comparison always examines every byte of both slices even
/// when a mismatch is found early, preventing timing side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // A length mismatch already leaks that lengths differ, which is
        // acceptable for shared-secret authentication (the sender does not
        // control the expected secret length).
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validate the secret presented in a webhook payload against the configured
/// one. An empty configured secret rejects everything.
pub fn verify_webhook_secret(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn empty_configured_secret_rejects() {
        assert!(!verify_webhook_secret("", ""));
        assert!(!verify_webhook_secret("anything", ""));
    }

    #[test]
    fn matching_secret_accepted() {
        assert!(verify_webhook_secret("s3cret", "s3cret"));
        assert!(!verify_webhook_secret("s3cret!", "s3cret"));
    }
}
