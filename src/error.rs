//! Error types surfaced by the gateway.
//!
//! Every variant maps to one client-facing outcome. Not-found deliberately
//! covers unknown keys, consumed keys, kind mismatches and expired entries so
//! a caller cannot probe which of those applies.

use std::time::Duration;
use thiserror::Error;

/// Message shared by every not-found outcome.
pub const NOT_FOUND_MESSAGE: &str = "Invalid passkey or data type";

#[derive(Debug, Error)]
pub enum VaultError {
    /// Missing or invalid input (empty text, absent file, absent passkey).
    #[error("{0}")]
    InvalidInput(String),

    #[error("{}", NOT_FOUND_MESSAGE)]
    NotFound,

    #[error("Payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("Too many requests, retry in {} seconds", whole_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    /// Capability switched off for the current runtime mode.
    #[error("Not found")]
    Disabled,

    /// Blob write/read/verify/delete failure.
    #[error("Blob storage failure: {0}")]
    Backend(String),
}

/// Seconds to wait, never below one.
fn whole_secs(duration: &Duration) -> u64 {
    duration.as_secs().max(1)
}

impl VaultError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Wrap a backend failure, keeping the whole context chain.
    pub fn backend(err: anyhow::Error) -> Self {
        Self::Backend(format!("{:#}", err))
    }

    /// Whether this error is the caller's fault (4xx class).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Backend(_))
    }

    /// Message safe to show to a client. Backend detail stays in the logs.
    pub fn public_message(&self, fallback: &str) -> String {
        match self {
            Self::Backend(_) => fallback.to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_is_generic() {
        assert_eq!(VaultError::NotFound.to_string(), NOT_FOUND_MESSAGE);
    }

    #[test]
    fn test_backend_detail_hidden_from_clients() {
        let err = VaultError::backend(anyhow::anyhow!("disk on fire"));
        assert!(!err.is_client_error());
        assert_eq!(err.public_message("Failed to decrypt image"), "Failed to decrypt image");
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_rate_limited_rounds_up_to_one_second() {
        let err = VaultError::RateLimited {
            retry_after: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "Too many requests, retry in 1 seconds");
    }
}
