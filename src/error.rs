//! Error types for the vehicle ledger

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Unknown `tx_id`, or one that has already been finalized.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Invalid decision: {0:?} (expected \"approve\" or \"reject\")")]
    InvalidDecision(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    /// Hash linkage or proof-of-work broken. Fatal: the ledger must not serve
    /// a chain in this state.
    #[error("Chain integrity violation: {0}")]
    ChainIntegrityViolation(String),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
    /// A durable record exists but cannot be decoded.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
    #[error("Nonce search exhausted for block {index} after {max_nonce} attempts")]
    NonceExhausted { index: u64, max_nonce: u64 },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Errors after which the ledger must refuse further requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::ChainIntegrityViolation(_) | LedgerError::NonceExhausted { .. }
        )
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::PersistenceFailure(err.to_string())
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::PersistenceFailure(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::CorruptRecord(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for LedgerError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LedgerError::InvalidTransaction(err.to_string())
    }
}

impl From<toml::de::Error> for LedgerError {
    fn from(err: toml::de::Error) -> Self {
        LedgerError::Config(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, LedgerError>;
