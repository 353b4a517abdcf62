//! Domain module
//!
//! Value types, errors and outbound events shared by the ledger core.

pub mod context;
pub mod error;
pub mod events;
pub mod money;

pub use context::OperationContext;
pub use error::DomainError;
pub use events::{EventPublisher, LedgerEvent};
pub use money::{BasisPoints, Money, MoneyError, RateError, MAX_BASIS_POINTS, MAX_MONEY};
