//! Auto-transfer job
//!
//! Executes due savings auto-transfers. The due schedules are locked for the
//! whole batch so two pollers never run the same schedule; each transfer goes
//! through the idempotent [`TransferHandler`] keyed by the schedule's attempt.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

use crate::aggregate::{AccountId, AccountStatus, AutoTransferSchedule, TransferStatus, TransferType};
use crate::domain::{DomainError, EventPublisher, LedgerEvent, OperationContext};
use crate::error::AppError;
use crate::handlers::{TransferCommand, TransferHandler, TransferResult};
use crate::store::{Store, StoreError, UnitOfWork};

pub const AUTO_TRANSFER_MEMO: &str = "auto-transfer";

/// Outcome of one auto-transfer pass
#[derive(Debug, Clone, Default)]
pub struct AutoTransferReport {
    pub due: usize,
    pub executed: usize,
    pub insufficient_balance: usize,
    pub failed: usize,
    pub skipped: usize,
    pub disabled: usize,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// What happened to one schedule during a pass
#[derive(Debug)]
enum Outcome {
    Executed(TransferResult),
    Failed,
    InsufficientBalance,
    InFlight,
    Disabled,
    Error(String),
}

pub struct AutoTransferJob {
    store: Arc<dyn Store>,
    transfers: Arc<TransferHandler>,
    events: EventPublisher,
}

impl AutoTransferJob {
    pub fn new(store: Arc<dyn Store>, transfers: Arc<TransferHandler>, events: EventPublisher) -> Self {
        Self {
            store,
            transfers,
            events,
        }
    }

    /// Run every schedule due on or before `reference`
    pub async fn run_once(&self, reference: NaiveDate) -> Result<AutoTransferReport, StoreError> {
        let mut uow = self.store.begin().await?;
        let mut schedules = uow.schedules().find_due_schedules_for_update(reference).await?;

        let mut report = AutoTransferReport {
            due: schedules.len(),
            ..AutoTransferReport::default()
        };
        let mut executed_events = Vec::new();

        for schedule in schedules.iter_mut() {
            let outcome = self.execute(uow.as_mut(), schedule, reference).await;
            match outcome {
                Outcome::Executed(result) => {
                    report.executed += 1;
                    if let Some(next_run_date) = schedule.next_run_date() {
                        executed_events.push(LedgerEvent::AutoTransferExecuted {
                            schedule_id: schedule.id(),
                            account_id: schedule.account_id(),
                            transfer_id: result.transfer_id,
                            next_run_date,
                            executed_at: result.settled_at.unwrap_or_else(Utc::now),
                        });
                    }
                }
                Outcome::Failed => report.failed += 1,
                Outcome::InsufficientBalance => report.insufficient_balance += 1,
                Outcome::InFlight => report.skipped += 1,
                Outcome::Disabled => report.disabled += 1,
                Outcome::Error(message) => {
                    report.errors.push(format!("schedule {}: {}", schedule.id(), message));
                }
            }
            uow.schedules().update(schedule).await?;
        }
        uow.commit().await?;

        for event in executed_events {
            self.events.publish(event);
        }

        report.completed_at = Utc::now();
        tracing::info!(
            due = report.due,
            executed = report.executed,
            insufficient_balance = report.insufficient_balance,
            failed = report.failed,
            skipped = report.skipped,
            disabled = report.disabled,
            errors = report.errors.len(),
            "Auto-transfer pass completed"
        );
        Ok(report)
    }

    async fn execute(
        &self,
        uow: &mut dyn UnitOfWork,
        schedule: &mut AutoTransferSchedule,
        reference: NaiveDate,
    ) -> Outcome {
        let (Some(amount), Some(key)) = (schedule.amount(), schedule.attempt_key()) else {
            tracing::warn!(schedule_id = schedule.id(), "Due schedule is incomplete, disabling");
            schedule.disable();
            return Outcome::Disabled;
        };

        // Checked before any transfer row exists, so an underfunded schedule
        // polled every minute leaves nothing behind. The transfer re-checks
        // under the account lock.
        match uow.accounts().find_by_id(schedule.withdrawal_account_id()).await {
            Ok(Some(withdrawal)) if withdrawal.status() == AccountStatus::Active && withdrawal.balance() < amount => {
                tracing::warn!(
                    schedule_id = schedule.id(),
                    withdrawal_account_id = schedule.withdrawal_account_id(),
                    balance = withdrawal.balance().value(),
                    amount = amount.value(),
                    "Auto-transfer skipped: insufficient balance"
                );
                return Outcome::InsufficientBalance;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(schedule_id = schedule.id(), error = %e, "Could not read withdrawal account");
                return Outcome::Error(e.to_string());
            }
        }

        let mut command = TransferCommand::new(schedule.withdrawal_account_id(), schedule.account_id(), amount.value())
            .with_transfer_type(TransferType::Internal)
            .with_idempotency_key(key)
            .with_memo(AUTO_TRANSFER_MEMO);
        if let Some(run_date) = schedule.next_run_date() {
            command = command.with_value_date(run_date);
        }

        let context = OperationContext::system("auto_transfer");
        match self.transfers.execute(command, &context).await {
            Ok(result) if result.status == TransferStatus::Settled => {
                match schedule.mark_executed(Utc::now(), reference) {
                    Ok(next_run_date) => {
                        tracing::info!(
                            schedule_id = schedule.id(),
                            account_id = schedule.account_id(),
                            transfer_id = result.transfer_id,
                            %next_run_date,
                            "Auto-transfer executed"
                        );
                        Outcome::Executed(result)
                    }
                    Err(e) => {
                        tracing::error!(schedule_id = schedule.id(), error = %e, "Failed to advance schedule");
                        Outcome::Error(e.to_string())
                    }
                }
            }
            Ok(result) => {
                // Replay of an attempt that already ended without settling
                tracing::warn!(
                    schedule_id = schedule.id(),
                    transfer_id = result.transfer_id,
                    status = result.status.as_str(),
                    "Auto-transfer attempt did not settle"
                );
                schedule.record_failure();
                Outcome::Failed
            }
            Err(e) => self.handle_error(uow, schedule, e).await,
        }
    }

    async fn handle_error(
        &self,
        uow: &mut dyn UnitOfWork,
        schedule: &mut AutoTransferSchedule,
        error: AppError,
    ) -> Outcome {
        match error.as_domain() {
            Some(DomainError::InsufficientBalance { .. }) => {
                tracing::warn!(
                    schedule_id = schedule.id(),
                    withdrawal_account_id = schedule.withdrawal_account_id(),
                    "Auto-transfer skipped: insufficient balance"
                );
                schedule.record_failure();
                Outcome::InsufficientBalance
            }
            Some(DomainError::TransferInProgress { .. }) => Outcome::InFlight,
            Some(DomainError::InvalidAccountState(_)) | Some(DomainError::AccountNotFound(_)) => {
                match self.parties_gone(uow, schedule).await {
                    Ok(true) => {
                        tracing::info!(schedule_id = schedule.id(), "Account closed, disabling auto-transfer");
                        schedule.disable();
                        Outcome::Disabled
                    }
                    Ok(false) => {
                        tracing::warn!(schedule_id = schedule.id(), error = %error, "Auto-transfer rejected");
                        schedule.record_failure();
                        Outcome::Failed
                    }
                    Err(e) => {
                        schedule.record_failure();
                        Outcome::Error(e.to_string())
                    }
                }
            }
            _ => {
                tracing::error!(schedule_id = schedule.id(), error = %error, "Auto-transfer failed");
                schedule.record_failure();
                Outcome::Error(error.to_string())
            }
        }
    }

    /// Either side is missing or CLOSED
    async fn parties_gone(&self, uow: &mut dyn UnitOfWork, schedule: &AutoTransferSchedule) -> Result<bool, StoreError> {
        for account_id in [schedule.withdrawal_account_id(), schedule.account_id()] {
            if !is_open(uow, account_id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

async fn is_open(uow: &mut dyn UnitOfWork, account_id: AccountId) -> Result<bool, StoreError> {
    let account = uow.accounts().find_by_id(account_id).await?;
    Ok(account.map_or(false, |a| a.status() != AccountStatus::Closed))
}
