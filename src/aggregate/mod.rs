//! Aggregate module
//!
//! Aggregates own their invariants: every state change goes through a
//! method that checks the current status before mutating anything.

pub mod account;
pub mod schedule;
pub mod transaction;
pub mod transfer;

pub use account::{Account, AccountKind, AccountStatus, CompoundingType, NewAccount, SavingsTerms};
pub use schedule::{AutoTransferSchedule, ScheduleSettings, TransferCycle};
pub use transaction::{Direction, Transaction, TransactionStatus, TransactionType};
pub use transfer::{LedgerEntry, Transfer, TransferStatus, TransferType};

/// Store-assigned identities. Zero means "not persisted yet".
pub type AccountId = i64;
pub type TransactionId = i64;
pub type TransferId = i64;
pub type LedgerEntryId = i64;
pub type ScheduleId = i64;
