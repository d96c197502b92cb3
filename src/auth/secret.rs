//! Shared-secret strength checks
//!
//! Webhook tokens are validated once at startup or reload. The entropy score
//! is a heuristic over the character distribution: it catches repeated
//! patterns and dictionary-like secrets, it does not prove randomness.

use std::collections::HashMap;

use thiserror::Error;

/// Minimum accepted secret length, in characters.
pub const MIN_SECRET_LENGTH: usize = 32;

/// Minimum accepted Shannon entropy, in bits per character.
pub const MIN_SECRET_ENTROPY: f64 = 3.5;

/// Why a secret was refused
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeakSecret {
    #[error("secret is empty")]
    EmptySecret,

    #[error("secret is too short: {len} characters (min {min})")]
    TooShort { len: usize, min: usize },

    #[error("secret entropy too low: {bits:.2} bits/char (min {min:.1})")]
    LowEntropy { bits: f64, min: f64 },
}

/// Shannon entropy of `text` in bits per character: `-Σ p·log2(p)` over the
/// character frequencies. Empty input scores 0.
pub fn shannon_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Accept or reject a shared secret.
///
/// Rules are checked in order: non-empty, at least [`MIN_SECRET_LENGTH`]
/// characters, then at least [`MIN_SECRET_ENTROPY`] bits per character.
pub fn validate_secret(secret: &str) -> Result<(), WeakSecret> {
    if secret.is_empty() {
        return Err(WeakSecret::EmptySecret);
    }

    let len = secret.chars().count();
    if len < MIN_SECRET_LENGTH {
        return Err(WeakSecret::TooShort {
            len,
            min: MIN_SECRET_LENGTH,
        });
    }

    let bits = shannon_entropy(secret);
    if bits < MIN_SECRET_ENTROPY {
        return Err(WeakSecret::LowEntropy {
            bits,
            min: MIN_SECRET_ENTROPY,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRONG: &str = "aB3$xY9!qW2@eR5#tY7&uI1*oP4^zX6%";

    #[test]
    fn test_entropy_values() {
        assert_eq!(shannon_entropy(""), 0.0);
        assert_eq!(shannon_entropy("aaaa"), 0.0);
        assert!((shannon_entropy("abab") - 1.0).abs() < 1e-9);
        assert!((shannon_entropy("abcd") - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_secret() {
        assert_eq!(validate_secret(""), Err(WeakSecret::EmptySecret));
    }

    #[test]
    fn test_short_secrets_rejected_regardless_of_content() {
        for secret in ["a", "hunter2", &STRONG[..31]] {
            assert!(matches!(
                validate_secret(secret),
                Err(WeakSecret::TooShort { min: 32, .. })
            ));
        }
    }

    #[test]
    fn test_repeated_character_rejected_for_entropy() {
        let secret = "x".repeat(64);
        match validate_secret(&secret) {
            Err(WeakSecret::LowEntropy { bits, min }) => {
                assert!(bits.abs() < 1e-9);
                assert_eq!(min, MIN_SECRET_ENTROPY);
            }
            other => panic!("expected LowEntropy, got {:?}", other),
        }
    }

    #[test]
    fn test_patterned_secret_rejected() {
        assert!(matches!(
            validate_secret(&"password".repeat(4)),
            Err(WeakSecret::LowEntropy { .. })
        ));
        assert!(matches!(
            validate_secret(&"abcd".repeat(8)),
            Err(WeakSecret::LowEntropy { .. })
        ));
    }

    #[test]
    fn test_strong_secret_accepted() {
        assert_eq!(STRONG.len(), 32);
        assert!(validate_secret(STRONG).is_ok());
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 16 two-byte characters: 32 bytes but only 16 characters.
        let secret = "éèêëàâäôöûüùïîçñ";
        assert!(matches!(
            validate_secret(secret),
            Err(WeakSecret::TooShort { len: 16, .. })
        ));
    }
}
