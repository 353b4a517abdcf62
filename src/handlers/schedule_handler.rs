//! Auto-transfer schedule handler

use chrono::Utc;
use std::sync::Arc;

use crate::aggregate::{AccountId, AccountStatus, AutoTransferSchedule};
use crate::domain::{DomainError, OperationContext};
use crate::error::AppError;
use crate::store::{Store, UnitOfWork};

use super::UpdateAutoTransferScheduleCommand;

/// Handler for the auto-transfer settings of savings accounts
pub struct ScheduleHandler {
    store: Arc<dyn Store>,
}

impl ScheduleHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create the schedule on first use, otherwise apply the new settings
    pub async fn update(
        &self,
        command: UpdateAutoTransferScheduleCommand,
        context: &OperationContext,
    ) -> Result<AutoTransferSchedule, AppError> {
        let settings = command.settings()?;
        let today = Utc::now().date_naive();
        let account_id = command.account_id;

        let mut uow = self.store.begin().await?;
        let existing = uow.schedules().find_by_account_id_for_update(account_id).await?;

        let account = uow
            .accounts()
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| DomainError::AccountNotFound(account_id.to_string()))?;
        if !account.is_savings() {
            return Err(DomainError::InvalidAccountState(format!(
                "account {} is not a savings account",
                account.account_number()
            ))
            .into());
        }
        if account.status() == AccountStatus::Closed {
            return Err(DomainError::InvalidAccountState(format!(
                "account {} is closed",
                account.account_number()
            ))
            .into());
        }

        let schedule = match existing {
            Some(mut schedule) => {
                if let Some(requested) = command.withdrawal_account_id {
                    if requested != schedule.withdrawal_account_id() {
                        return Err(DomainError::InvalidCommand(
                            "withdrawal account of an existing schedule cannot change".to_string(),
                        )
                        .into());
                    }
                }
                schedule.update(settings, today)?;
                uow.schedules().update(&schedule).await?;
                schedule
            }
            None => {
                let withdrawal_account_id = command.withdrawal_account_id.ok_or_else(|| {
                    DomainError::InvalidCommand("new schedule requires a withdrawal account".to_string())
                })?;
                require_usable(uow.as_mut(), withdrawal_account_id).await?;

                let schedule = AutoTransferSchedule::new(account_id, withdrawal_account_id, settings, today)?;
                uow.schedules().create(&schedule).await?
            }
        };
        uow.commit().await?;

        tracing::info!(
            account_id,
            schedule_id = schedule.id(),
            enabled = schedule.enabled(),
            next_run_date = ?schedule.next_run_date(),
            correlation_id = ?context.correlation_id,
            "Auto-transfer schedule updated"
        );
        Ok(schedule)
    }

    pub async fn get(&self, account_id: AccountId) -> Result<AutoTransferSchedule, AppError> {
        let mut uow = self.store.begin().await?;
        uow.schedules()
            .find_by_account_id(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("auto-transfer schedule of account {}", account_id)))
    }
}

async fn require_usable(uow: &mut dyn UnitOfWork, account_id: AccountId) -> Result<(), AppError> {
    let account = uow
        .accounts()
        .find_by_id(account_id)
        .await?
        .ok_or_else(|| DomainError::AccountNotFound(account_id.to_string()))?;
    if account.status() == AccountStatus::Closed {
        return Err(DomainError::InvalidAccountState(format!(
            "withdrawal account {} is closed",
            account.account_number()
        ))
        .into());
    }
    Ok(())
}
