//! Error types for the Conduit bridge

use crate::ledger::BridgeStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Recoverable user-input errors surfaced by the intake flow
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("could not parse amount")]
    ParseError,

    #[error("amount out of range: minimum {min}, maximum {max}")]
    OutOfRange { min: Decimal, max: Decimal },

    #[error("invalid destination address")]
    InvalidAddress,
}

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("transaction {id} not found")]
    NotFound { id: String },

    #[error("duplicate transaction id {id}")]
    DuplicateId { id: String },

    #[error("deposit amount mismatch for {id}: expected {expected}, saw {actual}")]
    AmountMismatch {
        id: String,
        expected: Decimal,
        actual: Decimal,
    },

    #[error("chain error on {chain}: {message}")]
    TransientChain { chain: String, message: String },

    #[error("settlement rejected for {id}: {reason}")]
    PermanentSettlement { id: String, reason: String },

    #[error("transaction {id} expired")]
    Expired { id: String },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: BridgeStatus,
        to: BridgeStatus,
    },

    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("chat transport error: {0}")]
    Transport(String),

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::TransientChain { .. } | BridgeError::Timeout { .. }
        )
    }

    /// Check if error should surface to the user directly
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            BridgeError::Validation(_) | BridgeError::NotFound { .. }
        )
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
