//! Passkey generation.
//!
//! A passkey is 16 bytes from the OS random source, hex encoded. It is a
//! capability token: whoever holds it can redeem the entry once.

use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use std::fmt;

/// Raw passkey length (bytes) - 128 bits
pub const PASSKEY_BYTES: usize = 16;

/// Encoded passkey length (hex chars)
pub const PASSKEY_LEN: usize = PASSKEY_BYTES * 2;

/// Opaque one-time token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Passkey(String);

impl Passkey {
    /// Generate a fresh passkey from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PASSKEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept only tokens shaped like generator output.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == PASSKEY_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines. Full passkeys never reach the logs.
    pub fn redacted(&self) -> String {
        let head: String = self.0.chars().take(6).collect();
        format!("{}…", head)
    }
}

impl fmt::Display for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_is_fixed_length_hex() {
        let key = Passkey::generate();
        assert_eq!(key.as_str().len(), PASSKEY_LEN);
        assert!(Passkey::parse(key.as_str()).is_some());
    }

    #[test]
    fn test_generate_does_not_repeat() {
        let keys: HashSet<Passkey> = (0..1000).map(|_| Passkey::generate()).collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Passkey::parse("").is_none());
        assert!(Passkey::parse("abc").is_none());
        assert!(Passkey::parse(&"g".repeat(PASSKEY_LEN)).is_none());
        assert!(Passkey::parse(&"A".repeat(PASSKEY_LEN)).is_none());
        assert!(Passkey::parse(&"0".repeat(PASSKEY_LEN + 1)).is_none());
        assert!(Passkey::parse(&"0f".repeat(PASSKEY_BYTES)).is_some());
    }

    #[test]
    fn test_redacted_hides_most_of_key() {
        let key = Passkey::generate();
        let shown = key.redacted();
        assert!(shown.starts_with(&key.as_str()[..6]));
        assert!(!shown.contains(&key.as_str()[6..]));
    }
}
