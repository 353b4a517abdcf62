//! won_ledger Library
//!
//! Re-exports modules for integration testing and the server binary.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod handlers;
pub mod interest;
pub mod jobs;
pub mod store;

mod error;

pub use config::Config;
pub use domain::{BasisPoints, DomainError, EventPublisher, LedgerEvent, Money, OperationContext};
pub use error::{AppError, AppResult, ErrorResponse};
