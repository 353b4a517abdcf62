//! Interest module
//!
//! Pure accrual arithmetic plus the job that applies it to open accounts.

mod accrual_job;
mod engine;

pub use accrual_job::{AccrualJob, AccrualReport};
pub use engine::{accrued_until, compute_accrual, months_between, round_accrual, AccrualInput, ACCRUAL_SCALE};
