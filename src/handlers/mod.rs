//! Command Handlers module
//!
//! Handlers coordinate aggregates and the store: each operation opens a unit
//! of work, locks what it mutates, applies domain rules and commits.

mod account_handler;
mod commands;
mod schedule_handler;
mod transfer_handler;

#[cfg(test)]
mod tests;

pub use account_handler::{format_account_number, AccountHandler, ProductCatalog, ProductTerms};
pub use commands::*;
pub use schedule_handler::ScheduleHandler;
pub use transfer_handler::{TransferHandler, ABANDONED_REASON};
