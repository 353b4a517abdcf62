//! Interest accrual job
//!
//! Applies [`compute_accrual`](super::compute_accrual) to every open account,
//! one unit of work per account so a single failure never rolls back the rest.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::aggregate::AccountId;
use crate::domain::{DomainError, EventPublisher, LedgerEvent};
use crate::store::{Store, StoreError};

/// Outcome of one accrual pass
#[derive(Debug, Clone, Default)]
pub struct AccrualReport {
    pub accounts_scanned: usize,
    pub accounts_accrued: usize,
    pub total_accrued: Decimal,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
enum AccrualError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Accrues interest on all open accounts up to a point in time
pub struct AccrualJob {
    store: Arc<dyn Store>,
    events: EventPublisher,
}

impl AccrualJob {
    pub fn new(store: Arc<dyn Store>, events: EventPublisher) -> Self {
        Self { store, events }
    }

    /// Accrue every ACTIVE and FROZEN account up to `as_of`
    pub async fn run_once(&self, as_of: DateTime<Utc>) -> Result<AccrualReport, StoreError> {
        let ids = {
            let mut uow = self.store.begin().await?;
            uow.accounts().find_open_ids().await?
        };

        let mut report = AccrualReport {
            accounts_scanned: ids.len(),
            ..AccrualReport::default()
        };

        for account_id in ids {
            match self.accrue_account(account_id, as_of).await {
                Ok(Some(amount)) => {
                    report.accounts_accrued += 1;
                    report.total_accrued += amount;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, account_id, "Interest accrual failed");
                    report.errors.push(format!("account {}: {}", account_id, e));
                }
            }
        }

        report.completed_at = Utc::now();
        tracing::info!(
            accounts_scanned = report.accounts_scanned,
            accounts_accrued = report.accounts_accrued,
            total_accrued = %report.total_accrued,
            errors = report.errors.len(),
            "Interest accrual pass completed"
        );
        Ok(report)
    }

    async fn accrue_account(
        &self,
        account_id: AccountId,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Decimal>, AccrualError> {
        let mut uow = self.store.begin().await?;
        let Some(mut account) = uow.accounts().find_by_id_for_update(account_id).await? else {
            // Deleted between listing and locking
            return Ok(None);
        };
        if account.last_accrual_ts() >= as_of {
            return Ok(None);
        }

        let amount = account.accrue(as_of)?;
        let account = uow.accounts().save(&account).await?;
        uow.commit().await?;

        if amount.is_zero() {
            return Ok(None);
        }

        tracing::debug!(account_id, amount = %amount, "Interest accrued");
        self.events.publish(LedgerEvent::InterestAccrued {
            account_id,
            amount,
            total_accrued: account.interest_accrued(),
            as_of,
        });
        Ok(Some(amount))
    }
}
