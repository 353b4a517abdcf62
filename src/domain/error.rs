//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use thiserror::Error;

use super::money::{MoneyError, RateError};

/// Domain-specific errors
///
/// These errors represent business rule violations, idempotency conflicts and
/// ledger integrity faults. They are independent of the web/infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Debit larger than the current balance
    #[error("Insufficient balance on account {account_number}: requested {requested}, current {current}")]
    InsufficientBalance {
        account_number: String,
        requested: i64,
        current: i64,
    },

    /// Operation not allowed in the account's current status
    #[error("Invalid account state: {0}")]
    InvalidAccountState(String),

    /// Amount is zero, negative, out of range or malformed
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Rate outside 0..=10000bps or finer than one basis point
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    /// Command is malformed (e.g. partially populated savings fields)
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(i64),

    /// Internal transfer to the same account
    #[error("Cannot transfer to the same account")]
    SameAccountTransfer,

    /// A prior attempt with the same idempotency key has not reached a terminal state
    #[error("Transfer in progress for source account {source_account_id} with idempotency key {idempotency_key}")]
    TransferInProgress {
        source_account_id: i64,
        idempotency_key: String,
    },

    /// Terminal or out-of-order state change
    #[error("Invalid {entity} state transition: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// A referenced transfer or account vanished mid-flow
    #[error("Ledger integrity fault: {0}")]
    LedgerNotFound(String),
}

impl DomainError {
    /// Create an insufficient balance error
    pub fn insufficient_balance(account_number: impl Into<String>, requested: i64, current: i64) -> Self {
        Self::InsufficientBalance {
            account_number: account_number.into(),
            requested,
            current,
        }
    }

    /// Create a state transition error
    pub fn transition(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::InvalidAccountState(_) => "invalid_account_state",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidRate(_) => "invalid_rate",
            Self::InvalidCommand(_) => "invalid_command",
            Self::AccountNotFound(_) => "account_not_found",
            Self::TransactionNotFound(_) => "transaction_not_found",
            Self::SameAccountTransfer => "same_account_transfer",
            Self::TransferInProgress { .. } => "transfer_in_progress",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::LedgerNotFound(_) => "ledger_not_found",
        }
    }

    /// Check if this is a client error (user's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance { .. }
                | Self::InvalidAccountState(_)
                | Self::InvalidAmount(_)
                | Self::InvalidRate(_)
                | Self::InvalidCommand(_)
                | Self::SameAccountTransfer
        )
    }

    /// Check if this is a conflict error (the caller should not blindly retry)
    pub fn is_conflict_error(&self) -> bool {
        matches!(
            self,
            Self::TransferInProgress { .. } | Self::InvalidStateTransition { .. }
        )
    }

    /// Integrity faults indicate corrupted state, never user error
    pub fn is_integrity_fault(&self) -> bool {
        matches!(self, Self::LedgerNotFound(_))
    }
}

impl From<MoneyError> for DomainError {
    fn from(err: MoneyError) -> Self {
        Self::InvalidAmount(err.to_string())
    }
}

impl From<RateError> for DomainError {
    fn from(err: RateError) -> Self {
        Self::InvalidRate(err.to_string())
    }
}
