//! Transfer Handler
//!
//! Idempotent two-leg transfers. A transfer is recorded as REQUESTED in one
//! unit of work, posted (both legs, both transactions, both ledger entries)
//! in a second, and marked FAILED in a third if posting did not commit.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::{
    Account, AccountId, AccountStatus, Direction, Transaction, TransactionType, Transfer, TransferId,
    TransferStatus,
};
use crate::domain::{DomainError, EventPublisher, LedgerEvent, Money, OperationContext};
use crate::error::AppError;
use crate::store::{AccountInternalApi, AccountSnapshot, LocalAccountApi, Store, StoreError, UnitOfWork};

use super::{TransferCommand, TransferResult};

/// Reason recorded on transfers abandoned mid-flight
pub const ABANDONED_REASON: &str = "abandoned before posting";

// =========================================================================
// Leg posting
// =========================================================================

/// Post both legs of a REQUESTED transfer and settle it.
///
/// `source` and `target` are the locked local accounts; `None` marks a leg
/// owned by another service. Nothing is committed here.
pub(crate) async fn post_legs(
    uow: &mut dyn UnitOfWork,
    transfer: &mut Transfer,
    source: Option<&mut Account>,
    target: Option<&mut Account>,
) -> Result<(), AppError> {
    let amount = transfer.amount();
    let memo = transfer.memo().map(str::to_string);

    transfer.advance()?;
    let debit_id = match source {
        Some(account) => {
            account.withdraw(amount)?;
            uow.accounts().save(account).await?;
            let tx = Transaction::post(
                account.id(),
                TransactionType::TransferOut,
                amount,
                transfer.value_date(),
                memo.clone(),
            )?
            .for_transfer(transfer.id());
            Some(uow.transactions().save(&tx).await?.id())
        }
        None => None,
    };
    transfer.record_leg(Direction::Debit, debit_id)?;

    transfer.advance()?;
    let credit_id = match target {
        Some(account) => {
            account.deposit(amount)?;
            uow.accounts().save(account).await?;
            let tx = Transaction::post(
                account.id(),
                TransactionType::TransferIn,
                amount,
                transfer.value_date(),
                memo,
            )?
            .for_transfer(transfer.id());
            Some(uow.transactions().save(&tx).await?.id())
        }
        None => None,
    };
    transfer.record_leg(Direction::Credit, credit_id)?;

    transfer.settle()?;
    Ok(())
}

/// `save_and_flush` on a vanished transfer is an integrity fault
pub(crate) fn flush_error(err: StoreError) -> AppError {
    match err {
        StoreError::RowNotFound(what) => DomainError::LedgerNotFound(what).into(),
        other => other.into(),
    }
}

// =========================================================================
// TransferHandler
// =========================================================================

/// Handler for transfers between accounts
pub struct TransferHandler {
    store: Arc<dyn Store>,
    accounts: Arc<dyn AccountInternalApi>,
    events: EventPublisher,
}

impl TransferHandler {
    pub fn new(store: Arc<dyn Store>, events: EventPublisher) -> Self {
        Self {
            accounts: Arc::new(LocalAccountApi::new(store.clone())),
            store,
            events,
        }
    }

    /// Validate transfer parties through another snapshot source
    pub fn with_account_api(mut self, accounts: Arc<dyn AccountInternalApi>) -> Self {
        self.accounts = accounts;
        self
    }

    /// Execute the transfer command
    pub async fn execute(
        &self,
        command: TransferCommand,
        context: &OperationContext,
    ) -> Result<TransferResult, AppError> {
        let amount = Money::positive(command.amount)?;
        let value_date = command.value_date.unwrap_or_else(|| Utc::now().date_naive());

        let transfer_id = match self.request(command, amount, value_date).await? {
            Requested::Replayed(result) => {
                tracing::info!(
                    transfer_id = result.transfer_id,
                    status = %result.status,
                    correlation_id = ?context.correlation_id,
                    "Returning result of earlier transfer with same idempotency key"
                );
                return Ok(result);
            }
            Requested::New(id) => id,
        };

        match self.post(transfer_id).await {
            Ok(transfer) => {
                tracing::info!(
                    transfer_id,
                    source_account_id = transfer.source_account_id(),
                    target_account_id = transfer.target_account_id(),
                    amount = transfer.amount().value(),
                    correlation_id = ?context.correlation_id,
                    initiator = ?context.initiator,
                    "Transfer settled"
                );
                self.events.publish(LedgerEvent::TransferSettled {
                    transfer_id,
                    source_account_id: transfer.source_account_id(),
                    target_account_id: transfer.target_account_id(),
                    amount: transfer.amount().value(),
                    settled_at: transfer.settled_at().unwrap_or_else(Utc::now),
                });
                Ok(TransferResult::from(&transfer))
            }
            Err(e) => {
                match e.as_domain() {
                    Some(domain) if domain.is_integrity_fault() => {
                        tracing::error!(transfer_id, error = %e, "Transfer posting hit an integrity fault");
                    }
                    _ => {
                        tracing::warn!(
                            transfer_id,
                            error = %e,
                            correlation_id = ?context.correlation_id,
                            "Transfer failed"
                        );
                    }
                }
                self.mark_failed(transfer_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Look up a transfer
    pub async fn get(&self, transfer_id: TransferId) -> Result<TransferResult, AppError> {
        let mut uow = self.store.begin().await?;
        let transfer = uow
            .ledger()
            .find_by_id(transfer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transfer {}", transfer_id)))?;
        Ok(TransferResult::from(&transfer))
    }

    /// Void a transfer that has not been posted
    pub async fn cancel(&self, transfer_id: TransferId) -> Result<TransferResult, AppError> {
        let mut uow = self.store.begin().await?;
        let mut transfer = uow
            .ledger()
            .find_by_id_for_update(transfer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transfer {}", transfer_id)))?;

        transfer.cancel()?;
        let transfer = uow.ledger().save_and_flush(&transfer).await.map_err(flush_error)?;
        uow.commit().await?;

        tracing::info!(transfer_id, "Transfer cancelled");
        Ok(TransferResult::from(&transfer))
    }

    /// Fail transfers stuck before posting since before `older_than`.
    ///
    /// Returns how many were failed.
    pub async fn fail_stale(&self, older_than: DateTime<Utc>) -> Result<usize, AppError> {
        let ids = {
            let mut uow = self.store.begin().await?;
            uow.ledger().find_stale(older_than).await?
        };

        let mut failed = 0;
        for transfer_id in ids {
            let mut uow = self.store.begin().await?;
            let Some(mut transfer) = uow.ledger().find_by_id_for_update(transfer_id).await? else {
                continue;
            };
            // Re-check under the lock; posting may have finished meanwhile
            if transfer.status().is_terminal() || transfer.updated_at() >= older_than {
                continue;
            }

            transfer.fail(ABANDONED_REASON)?;
            let transfer = uow.ledger().save_and_flush(&transfer).await.map_err(flush_error)?;
            uow.commit().await?;

            tracing::warn!(transfer_id, "Stale transfer marked as failed");
            self.publish_failed(&transfer);
            failed += 1;
        }
        Ok(failed)
    }

    // =====================================================================
    // Phases
    // =====================================================================

    /// Idempotency lookup, validation and the REQUESTED record.
    ///
    /// Each step runs in its own short unit of work and the party snapshots
    /// are taken with none open, so a request never holds one connection
    /// while waiting for another.
    async fn request(
        &self,
        command: TransferCommand,
        amount: Money,
        value_date: chrono::NaiveDate,
    ) -> Result<Requested, AppError> {
        let source_account_id = command.source_account_id;
        let key = command.idempotency_key.clone();

        if let Some(key) = &key {
            let existing = {
                let mut uow = self.store.begin().await?;
                uow.ledger()
                    .find_by_source_account_id_and_idempotency_key(source_account_id, key)
                    .await?
            };
            if let Some(existing) = existing {
                return replay(&existing).map(Requested::Replayed);
            }
        }

        let transfer = Transfer::request(
            command.transfer_type,
            source_account_id,
            command.target_account_id,
            amount,
            value_date,
            key.clone(),
            command.memo,
        )?;
        self.require_active(transfer.source_account_id()).await?;
        self.require_active(transfer.target_account_id()).await?;

        let mut uow = self.store.begin().await?;
        let saved = match uow.ledger().save(&transfer).await {
            Ok(saved) => uow.commit().await.map(|_| saved),
            Err(e) => Err(e),
        };

        match saved {
            Ok(saved) => {
                tracing::debug!(transfer_id = saved.id(), idempotency_key = ?key, "Transfer requested");
                Ok(Requested::New(saved.id()))
            }
            // A concurrent request with the same key won the insert
            Err(e) if e.is_unique_violation() => {
                let key = key.unwrap_or_default();
                self.replay_by_key(source_account_id, &key).await.map(Requested::Replayed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replay_by_key(&self, source_account_id: AccountId, key: &str) -> Result<TransferResult, AppError> {
        let mut uow = self.store.begin().await?;
        let existing = uow
            .ledger()
            .find_by_source_account_id_and_idempotency_key(source_account_id, key)
            .await?
            .ok_or_else(|| DomainError::TransferInProgress {
                source_account_id,
                idempotency_key: key.to_string(),
            })?;
        replay(&existing)
    }

    /// Lock the transfer, then its local accounts in id order, and post
    async fn post(&self, transfer_id: TransferId) -> Result<Transfer, AppError> {
        let mut uow = self.store.begin().await?;
        let mut transfer = uow
            .ledger()
            .find_by_id_for_update(transfer_id)
            .await?
            .ok_or_else(|| DomainError::LedgerNotFound(format!("transfer {}", transfer_id)))?;
        if transfer.status() != TransferStatus::Requested {
            return Err(DomainError::transition("transfer", transfer.status(), TransferStatus::DebitPending).into());
        }

        let transfer_type = transfer.transfer_type();
        let source_id = transfer_type.debits_locally().then(|| transfer.source_account_id());
        let target_id = transfer_type.credits_locally().then(|| transfer.target_account_id());

        let mut lock_order: Vec<AccountId> = source_id.into_iter().chain(target_id).collect();
        lock_order.sort_unstable();
        lock_order.dedup();

        let mut locked: HashMap<AccountId, Account> = HashMap::new();
        for account_id in lock_order {
            let account = uow
                .accounts()
                .find_by_id_for_update(account_id)
                .await?
                .ok_or_else(|| DomainError::LedgerNotFound(format!("account {}", account_id)))?;
            locked.insert(account_id, account);
        }
        let mut source = source_id.and_then(|id| locked.remove(&id));
        let mut target = target_id.and_then(|id| locked.remove(&id));

        post_legs(uow.as_mut(), &mut transfer, source.as_mut(), target.as_mut()).await?;

        let transfer = uow.ledger().save_and_flush(&transfer).await.map_err(flush_error)?;
        uow.commit().await?;
        Ok(transfer)
    }

    /// Record FAILED after posting rolled back. Errors here are logged only;
    /// the caller already has the original error.
    async fn mark_failed(&self, transfer_id: TransferId, reason: &str) {
        match self.try_mark_failed(transfer_id, reason).await {
            Ok(Some(transfer)) => self.publish_failed(&transfer),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(transfer_id, error = %e, "Could not mark transfer as failed");
            }
        }
    }

    async fn try_mark_failed(&self, transfer_id: TransferId, reason: &str) -> Result<Option<Transfer>, AppError> {
        let mut uow = self.store.begin().await?;
        let Some(mut transfer) = uow.ledger().find_by_id_for_update(transfer_id).await? else {
            return Ok(None);
        };
        if transfer.status().is_terminal() {
            return Ok(None);
        }

        transfer.fail(reason)?;
        let transfer = uow.ledger().save_and_flush(&transfer).await.map_err(flush_error)?;
        uow.commit().await?;
        Ok(Some(transfer))
    }

    fn publish_failed(&self, transfer: &Transfer) {
        self.events.publish(LedgerEvent::TransferFailed {
            transfer_id: transfer.id(),
            source_account_id: transfer.source_account_id(),
            reason: transfer.failure_reason().unwrap_or_default().to_string(),
            failed_at: transfer.updated_at(),
        });
    }

    async fn require_active(&self, account_id: AccountId) -> Result<AccountSnapshot, AppError> {
        let snapshot = self
            .accounts
            .snapshot(account_id)
            .await?
            .ok_or_else(|| DomainError::AccountNotFound(account_id.to_string()))?;
        if snapshot.status != AccountStatus::Active {
            return Err(DomainError::InvalidAccountState(format!(
                "account {} is {}",
                account_id, snapshot.status
            ))
            .into());
        }
        Ok(snapshot)
    }
}

enum Requested {
    New(TransferId),
    Replayed(TransferResult),
}

/// Terminal transfers are returned verbatim; anything else is still in flight
fn replay(existing: &Transfer) -> Result<TransferResult, AppError> {
    if existing.status().is_terminal() {
        return Ok(TransferResult::from(existing));
    }
    Err(DomainError::TransferInProgress {
        source_account_id: existing.source_account_id(),
        idempotency_key: existing.idempotency_key().unwrap_or_default().to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::TransferType;
    use chrono::NaiveDate;

    fn requested(status: TransferStatus) -> Transfer {
        let mut transfer = Transfer::request(
            TransferType::Internal,
            100,
            200,
            Money::new(1000).unwrap(),
            NaiveDate::from_ymd_opt(2026, 10, 14).unwrap(),
            Some("tx-1".to_string()),
            None,
        )
        .unwrap();
        transfer.id = 7;
        if status != TransferStatus::Requested {
            transfer.transition(status).unwrap();
        }
        transfer
    }

    #[test]
    fn test_replay_terminal_returns_snapshot() {
        let mut transfer = requested(TransferStatus::Requested);
        transfer.fail("insufficient balance").unwrap();

        let result = replay(&transfer).unwrap();
        assert_eq!(result.transfer_id, 7);
        assert_eq!(result.status, TransferStatus::Failed);
        assert_eq!(result.failure_reason.as_deref(), Some("insufficient balance"));
    }

    #[test]
    fn test_replay_in_flight_is_conflict() {
        let transfer = requested(TransferStatus::DebitPending);
        let err = replay(&transfer).unwrap_err();
        assert!(matches!(
            err.as_domain(),
            Some(DomainError::TransferInProgress { source_account_id: 100, .. })
        ));
    }

    #[test]
    fn test_flush_error_maps_missing_row_to_integrity_fault() {
        let err = flush_error(StoreError::RowNotFound("transfer 7".to_string()));
        assert!(matches!(err.as_domain(), Some(DomainError::LedgerNotFound(_))));

        let err = flush_error(StoreError::Corrupt("status".to_string()));
        assert!(matches!(err, AppError::Store(_)));
    }
}
