//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns [`Error`]. The variants
//! mirror the error kinds spec'd for the core: validation failures surface
//! unchanged, chain/storage failures carry the upstream message, and the
//! orchestrators pattern-match on [`Error::DerivationMismatch`] and
//! [`Error::Broadcast`] to decide what is recoverable per-record versus
//! fatal for the whole operation.

use thiserror::Error;

use crate::funding::RejectedCandidate;

/// Root error type for the stealth-pool engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: non-hex, wrong byte length, out-of-range index,
    /// cross-network address, invalid paycode version.
    #[error("validation error: {0}")]
    Validation(String),

    /// The chain oracle rejected a call or returned an unexpected shape.
    #[error("chain error ({rpc}): {message}")]
    Chain { rpc: &'static str, message: String },

    /// The funding selector exhausted every candidate.
    #[error("insufficient funds: no UTXO satisfied the request")]
    InsufficientFunds {
        rejected: Vec<RejectedCandidate>,
    },

    /// Below-dust output, shard remainder below shard-dust, base-import
    /// without env unlock, covenant-push-parse mismatch, and similar
    /// policy-level refusals.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// A record's on-chain hash160 disagreed with the re-derived child
    /// key. Always fatal for that record, not necessarily for the
    /// operation driving it.
    #[error("derivation mismatch for {context}: expected {expected}, derived {derived}")]
    DerivationMismatch {
        context: String,
        expected: String,
        derived: String,
    },

    /// Rejection by the network: op_equalverify, mandatory-script-verify-
    /// flag-failed, script failed, code 16, etc. The import orchestrator
    /// treats this class as retryable across category-mode candidates.
    #[error("broadcast rejected: {0}")]
    Broadcast(String),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Wallet-state store errors.
    #[error("storage error: {0}")]
    Storage(#[from] crate::store::StoreError),

    /// IO errors from the store's file backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors from the store envelope.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal invariant violation: should not be reachable from valid
    /// input, surfaced rather than panicking.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn chain(rpc: &'static str, message: impl Into<String>) -> Self {
        Self::Chain {
            rpc,
            message: message.into(),
        }
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::PolicyViolation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error class is the one the import orchestrator retries
    /// across category-mode candidates (spec §7: the `BroadcastError`
    /// class covering op_equalverify / mandatory-script-verify-flag-failed
    /// / script failed / code 16).
    pub fn is_broadcast_retryable(&self) -> bool {
        match self {
            Error::Broadcast(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("equalverify")
                    || lower.contains("mandatory-script-verify-flag-failed")
                    || lower.contains("script failed")
                    || lower.contains("code 16")
                    || lower.contains("non-mandatory-script-verify-flag")
            }
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Chain { .. } => "CHAIN_ERROR",
            Error::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Error::PolicyViolation(_) => "POLICY_VIOLATION",
            Error::DerivationMismatch { .. } => "DERIVATION_MISMATCH",
            Error::Broadcast(_) => "BROADCAST_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_retry_classification() {
        let e = Error::Broadcast("mandatory-script-verify-flag-failed (Script failed)".into());
        assert!(e.is_broadcast_retryable());

        let e = Error::Broadcast("66: insufficient priority".into());
        assert!(!e.is_broadcast_retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::validation("x").error_code(), "VALIDATION_ERROR");
        assert_eq!(Error::policy("x").error_code(), "POLICY_VIOLATION");
    }
}
