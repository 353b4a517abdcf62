//! Scenario tests for handlers
//!
//! Every scenario runs against the in-memory store, which enforces the same
//! row locks and unique constraints as the PostgreSQL store.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    use crate::aggregate::{
        Account, AccountId, AccountStatus, CompoundingType, Direction, NewAccount, SavingsTerms,
        ScheduleSettings, Transfer, TransactionStatus, TransactionType, TransferCycle, TransferStatus,
        TransferType,
    };
    use crate::domain::{BasisPoints, DomainError, EventPublisher, LedgerEvent, Money, OperationContext};
    use crate::error::AppError;
    use crate::handlers::{
        AccountHandler, AdjustTransactionCommand, AutoTransferSetup, CloseAccountCommand,
        CreateAccountCommand, DepositCommand, FreezeAccountCommand, ReverseTransactionCommand,
        ScheduleHandler, TransferCommand, TransferHandler, UpdateAutoTransferScheduleCommand,
        UpdateBonusRateCommand, VoidTransactionCommand, WithdrawCommand, ABANDONED_REASON,
    };
    use crate::store::{
        AccountInternalApi, AccountRepository, AccountSnapshot, AutoTransferScheduleRepository, LedgerRepository,
        LocalAccountApi, MemoryStore, Store, StoreError, TransactionRepository, UnitOfWork,
    };

    struct Harness {
        store: Arc<dyn Store>,
        accounts: AccountHandler,
        transfers: Arc<TransferHandler>,
        schedules: ScheduleHandler,
        events: mpsc::Receiver<LedgerEvent>,
    }

    fn harness() -> Harness {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (publisher, events) = EventPublisher::channel(64);
        Harness {
            accounts: AccountHandler::new(store.clone(), publisher.clone()),
            transfers: Arc::new(TransferHandler::new(store.clone(), publisher)),
            schedules: ScheduleHandler::new(store.clone()),
            store,
            events,
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new().with_initiator("test")
    }

    impl Harness {
        async fn open(&self, customer_id: i64, balance: i64) -> Account {
            let account = self
                .accounts
                .create(
                    CreateAccountCommand::DemandDeposit {
                        customer_id,
                        product_id: 1,
                    },
                    &ctx(),
                )
                .await
                .unwrap();
            if balance == 0 {
                return account;
            }
            self.accounts
                .deposit(DepositCommand::new(account.id(), balance), &ctx())
                .await
                .unwrap()
        }

        async fn open_savings(&self, customer_id: i64, payout: Option<AccountId>) -> Account {
            self.accounts
                .create(
                    CreateAccountCommand::Savings {
                        customer_id,
                        product_id: 2,
                        goal_amount: Money::new(1_000_000).unwrap(),
                        term_months: 12,
                        payout_account_id: payout,
                        auto_transfer: None,
                    },
                    &ctx(),
                )
                .await
                .unwrap()
        }

        async fn balance(&self, account_id: AccountId) -> i64 {
            self.accounts.get(account_id).await.unwrap().balance().value()
        }

        fn drain_events(&mut self) -> Vec<LedgerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn domain(err: &AppError) -> &DomainError {
        err.as_domain().unwrap_or_else(|| panic!("expected domain error, got {:?}", err))
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    #[tokio::test]
    async fn test_create_allocates_distinct_numbers() {
        let h = harness();
        let first = h.open(17, 0).await;
        let second = h.open(17, 0).await;

        assert_eq!(first.account_number(), "00100001700001");
        assert_eq!(second.account_number(), "00100001700002");
        assert_eq!(first.status(), AccountStatus::Active);

        let listed = h.accounts.list_by_customer(17).await.unwrap();
        assert_eq!(listed.len(), 2);

        let by_number = h.accounts.get_by_number("00100001700002").await.unwrap();
        assert_eq!(by_number.id(), second.id());
    }

    #[tokio::test]
    async fn test_create_savings_with_schedule() {
        let h = harness();
        let checking = h.open(1, 0).await;
        let savings = h
            .accounts
            .create(
                CreateAccountCommand::Savings {
                    customer_id: 1,
                    product_id: 3,
                    goal_amount: Money::new(1_200_000).unwrap(),
                    term_months: 12,
                    payout_account_id: Some(checking.id()),
                    auto_transfer: Some(AutoTransferSetup {
                        withdrawal_account_id: checking.id(),
                        settings: ScheduleSettings {
                            enabled: true,
                            cycle: Some(TransferCycle::Monthly),
                            transfer_day: Some(25),
                            amount: Some(Money::new(100_000).unwrap()),
                        },
                    }),
                },
                &ctx(),
            )
            .await
            .unwrap();

        assert!(savings.is_savings());
        assert!(savings.maturity_date().is_some());
        assert_eq!(savings.payout_account_id(), Some(checking.id()));

        let schedule = h.schedules.get(savings.id()).await.unwrap();
        assert!(schedule.enabled());
        assert_eq!(schedule.withdrawal_account_id(), checking.id());
        assert!(schedule.next_run_date().is_some());
    }

    #[tokio::test]
    async fn test_create_unknown_product() {
        let h = harness();
        let err = h
            .accounts
            .create(
                CreateAccountCommand::DemandDeposit {
                    customer_id: 1,
                    product_id: 99,
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_withdraw_never_goes_negative() {
        let h = harness();
        let account = h.open(1, 1000).await;

        let err = h
            .accounts
            .withdraw(WithdrawCommand::new(account.id(), 1001), &ctx())
            .await
            .unwrap_err();
        match domain(&err) {
            DomainError::InsufficientBalance {
                account_number,
                requested,
                current,
            } => {
                assert_eq!(account_number, account.account_number());
                assert_eq!(*requested, 1001);
                assert_eq!(*current, 1000);
            }
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
        assert_eq!(h.balance(account.id()).await, 1000);

        let account = assert_ok!(h.accounts.withdraw(WithdrawCommand::new(account.id(), 1000), &ctx()).await);
        assert_eq!(account.balance().value(), 0);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let h = harness();
        let account = h.open(1, 0).await;
        let err = h
            .accounts
            .deposit(DepositCommand::new(account.id(), 0), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_frozen_account_rejects_deposits() {
        let h = harness();
        let account = h.open(1, 0).await;

        let frozen = h
            .accounts
            .freeze(
                FreezeAccountCommand {
                    account_id: account.id(),
                    reason: Some("fraud check".to_string()),
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(frozen.status(), AccountStatus::Frozen);

        let err = h
            .accounts
            .deposit(DepositCommand::new(account.id(), 100), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));

        let active = h.accounts.unfreeze(account.id(), &ctx()).await.unwrap();
        assert_eq!(active.status(), AccountStatus::Active);
        assert_ok!(h.accounts.deposit(DepositCommand::new(account.id(), 100), &ctx()).await);
    }

    #[tokio::test]
    async fn test_bonus_rate_ratchet() {
        let mut h = harness();
        let account = h.open_savings(1, None).await;

        let raise = |percent: Decimal| UpdateBonusRateCommand {
            account_id: account.id(),
            new_rate_percent: percent,
        };

        let updated = h.accounts.update_bonus_rate(raise(dec!(1.5)), &ctx()).await.unwrap();
        assert_eq!(updated.bonus_rate().value(), 150);

        let unchanged = h.accounts.update_bonus_rate(raise(dec!(1.0)), &ctx()).await.unwrap();
        assert_eq!(unchanged.bonus_rate().value(), 150);
        assert_eq!(unchanged.updated_at(), updated.updated_at());

        let same = h.accounts.update_bonus_rate(raise(dec!(1.5)), &ctx()).await.unwrap();
        assert_eq!(same.bonus_rate().value(), 150);

        let raised = h.accounts.update_bonus_rate(raise(dec!(2.0)), &ctx()).await.unwrap();
        assert_eq!(raised.bonus_rate().value(), 200);

        let raised_events = h
            .drain_events()
            .into_iter()
            .filter(|e| e.event_type() == "BonusRateRaised")
            .count();
        assert_eq!(raised_events, 2);

        let err = h.accounts.update_bonus_rate(raise(dec!(101)), &ctx()).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidRate(_)));

        let err = h.accounts.update_bonus_rate(raise(Decimal::MAX), &ctx()).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidRate(_)));
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    #[tokio::test]
    async fn test_transfer_idempotent_replay() {
        let mut h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;
        h.drain_events();

        let command = TransferCommand::new(source.id(), target.id(), 1000).with_idempotency_key("tx-1");
        let first = h.transfers.execute(command.clone(), &ctx()).await.unwrap();

        assert_eq!(first.status, TransferStatus::Settled);
        assert!(first.debit_transaction_id.is_some());
        assert!(first.credit_transaction_id.is_some());
        assert_ne!(first.debit_transaction_id, first.credit_transaction_id);
        assert_eq!(h.balance(source.id()).await, 4000);
        assert_eq!(h.balance(target.id()).await, 1000);

        let second = h.transfers.execute(command, &ctx()).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(h.balance(source.id()).await, 4000);
        assert_eq!(h.balance(target.id()).await, 1000);

        let settled = h
            .drain_events()
            .into_iter()
            .filter(|e| e.event_type() == "TransferSettled")
            .count();
        assert_eq!(settled, 1);

        // Only one posting per side
        let source_history = h.accounts.history(source.id(), 0, 20).await.unwrap();
        let outgoing = source_history
            .items
            .iter()
            .filter(|t| t.transaction_type() == TransactionType::TransferOut)
            .count();
        assert_eq!(outgoing, 1);
    }

    #[tokio::test]
    async fn test_settled_transfer_is_balanced() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;

        let result = h
            .transfers
            .execute(TransferCommand::new(source.id(), target.id(), 2500).with_memo("rent"), &ctx())
            .await
            .unwrap();

        let mut uow = h.store.begin().await.unwrap();
        let transfer: Transfer = uow.ledger().find_by_id(result.transfer_id).await.unwrap().unwrap();
        assert_eq!(transfer.status(), TransferStatus::Settled);
        assert_eq!(transfer.entries().len(), 2);
        assert!(transfer.is_balanced());
        let sum: i64 = transfer.entries().iter().map(|e| e.signed_amount()).sum();
        assert_eq!(sum, 0);

        let debit = transfer.entry(Direction::Debit).unwrap();
        let credit = transfer.entry(Direction::Credit).unwrap();
        assert_eq!(debit.account_id(), source.id());
        assert_eq!(credit.account_id(), target.id());
        assert_eq!(debit.amount(), credit.amount());

        let debit_tx = uow
            .transactions()
            .load(debit.transaction_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(debit_tx.transaction_type(), TransactionType::TransferOut);
        assert_eq!(debit_tx.direction(), Direction::Debit);
        assert_eq!(debit_tx.transfer_id(), Some(result.transfer_id));
        assert_eq!(debit_tx.description(), Some("rent"));
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_transfer() {
        let mut h = harness();
        let source = h.open(1, 500).await;
        let target = h.open(2, 0).await;
        h.drain_events();

        let command = TransferCommand::new(source.id(), target.id(), 1000).with_idempotency_key("tx-short");
        let err = h.transfers.execute(command.clone(), &ctx()).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::InsufficientBalance { .. }));
        assert_eq!(h.balance(source.id()).await, 500);
        assert_eq!(h.balance(target.id()).await, 0);

        let failed = h.drain_events();
        assert!(failed.iter().any(|e| e.event_type() == "TransferFailed"));

        // Same key replays the terminal FAILED snapshot without retrying
        let replay = h.transfers.execute(command, &ctx()).await.unwrap();
        assert_eq!(replay.status, TransferStatus::Failed);
        assert!(replay.failure_reason.unwrap().contains("Insufficient balance"));
        assert!(replay.debit_transaction_id.is_none());

        // No ledger legs were left behind
        let history = h.accounts.history(source.id(), 0, 20).await.unwrap();
        assert!(history.items.iter().all(|t| t.transfer_id().is_none()));
    }

    #[tokio::test]
    async fn test_transfer_validation() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;

        let err = h
            .transfers
            .execute(TransferCommand::new(source.id(), source.id(), 100), &ctx())
            .await
            .unwrap_err();
        assert_eq!(domain(&err), &DomainError::SameAccountTransfer);

        let err = h
            .transfers
            .execute(TransferCommand::new(source.id(), target.id(), 0), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAmount(_)));

        let err = h
            .transfers
            .execute(TransferCommand::new(source.id(), 9_999, 100), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::AccountNotFound(_)));

        h.accounts
            .freeze(
                FreezeAccountCommand {
                    account_id: target.id(),
                    reason: None,
                },
                &ctx(),
            )
            .await
            .unwrap();
        let err = h
            .transfers
            .execute(TransferCommand::new(source.id(), target.id(), 100), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));
        assert_eq!(h.balance(source.id()).await, 5000);
    }

    #[tokio::test]
    async fn test_concurrent_transfers_never_double_spend() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let transfers = h.transfers.clone();
            let command = TransferCommand::new(source.id(), target.id(), 1000);
            tasks.push(tokio::spawn(async move { transfers.execute(command, &ctx()).await }));
        }

        let mut settled = 0;
        let mut short = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(result) => {
                    assert_eq!(result.status, TransferStatus::Settled);
                    settled += 1;
                }
                Err(e) => {
                    assert!(matches!(domain(&e), DomainError::InsufficientBalance { .. }));
                    short += 1;
                }
            }
        }

        assert_eq!(settled, 5);
        assert_eq!(short, 5);
        assert_eq!(h.balance(source.id()).await, 0);
        assert_eq!(h.balance(target.id()).await, 5000);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_posts_once() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let transfers = h.transfers.clone();
            let command = TransferCommand::new(source.id(), target.id(), 1000).with_idempotency_key("same-key");
            tasks.push(tokio::spawn(async move { transfers.execute(command, &ctx()).await }));
        }

        let mut transfer_ids = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(result) => transfer_ids.push(result.transfer_id),
                Err(e) => assert!(matches!(domain(&e), DomainError::TransferInProgress { .. })),
            }
        }

        assert!(!transfer_ids.is_empty());
        transfer_ids.dedup();
        assert_eq!(transfer_ids.len(), 1);
        assert_eq!(h.balance(source.id()).await, 4000);
        assert_eq!(h.balance(target.id()).await, 1000);
    }

    #[tokio::test]
    async fn test_cancel_only_before_posting() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;

        // A request that never got posted
        let mut uow = h.store.begin().await.unwrap();
        let pending = Transfer::request(
            TransferType::Internal,
            source.id(),
            target.id(),
            Money::new(100).unwrap(),
            Utc::now().date_naive(),
            Some("stuck".to_string()),
            None,
        )
        .unwrap();
        let pending = uow.ledger().save(&pending).await.unwrap();
        uow.commit().await.unwrap();

        // The key stays blocked while the attempt is in flight
        let err = h
            .transfers
            .execute(
                TransferCommand::new(source.id(), target.id(), 100).with_idempotency_key("stuck"),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::TransferInProgress { .. }));

        let cancelled = h.transfers.cancel(pending.id()).await.unwrap();
        assert_eq!(cancelled.status, TransferStatus::Void);

        let err = h.transfers.cancel(pending.id()).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidStateTransition { .. }));

        let settled = h
            .transfers
            .execute(TransferCommand::new(source.id(), target.id(), 100), &ctx())
            .await
            .unwrap();
        let err = h.transfers.cancel(settled.transfer_id).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidStateTransition { .. }));

        let err = h.transfers.get(424_242).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fail_stale_transfers() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;

        let mut uow = h.store.begin().await.unwrap();
        let pending = Transfer::request(
            TransferType::Internal,
            source.id(),
            target.id(),
            Money::new(100).unwrap(),
            Utc::now().date_naive(),
            None,
            None,
        )
        .unwrap();
        let pending = uow.ledger().save(&pending).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(h.transfers.fail_stale(Utc::now() - Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(h.transfers.fail_stale(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);

        let failed = h.transfers.get(pending.id()).await.unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some(ABANDONED_REASON));
        assert_eq!(h.balance(source.id()).await, 5000);
    }

    /// Knows one account held by another service
    struct RemoteAwareApi {
        local: LocalAccountApi,
        remote_id: AccountId,
    }

    #[async_trait]
    impl AccountInternalApi for RemoteAwareApi {
        async fn snapshot(&self, account_id: AccountId) -> Result<Option<AccountSnapshot>, StoreError> {
            if account_id == self.remote_id {
                return Ok(Some(AccountSnapshot {
                    account_id,
                    customer_id: 900,
                    balance: Money::ZERO,
                    status: AccountStatus::Active,
                }));
            }
            self.local.snapshot(account_id).await
        }
    }

    #[tokio::test]
    async fn test_external_transfers_post_local_leg_only() {
        let h = harness();
        let local = h.open(1, 5000).await;
        let remote_id = 77_000;
        let transfers = TransferHandler::new(h.store.clone(), EventPublisher::disabled()).with_account_api(Arc::new(
            RemoteAwareApi {
                local: LocalAccountApi::new(h.store.clone()),
                remote_id,
            },
        ));

        let outbound = transfers
            .execute(
                TransferCommand::new(local.id(), remote_id, 1200).with_transfer_type(TransferType::ExternalOutbound),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(outbound.status, TransferStatus::Settled);
        assert!(outbound.debit_transaction_id.is_some());
        assert!(outbound.credit_transaction_id.is_none());
        assert_eq!(h.balance(local.id()).await, 3800);

        let inbound = transfers
            .execute(
                TransferCommand::new(remote_id, local.id(), 200).with_transfer_type(TransferType::ExternalInbound),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(inbound.status, TransferStatus::Settled);
        assert!(inbound.debit_transaction_id.is_none());
        assert!(inbound.credit_transaction_id.is_some());
        assert_eq!(h.balance(local.id()).await, 4000);
    }

    /// Store that tracks how many units of work are open at once
    struct CountingStore {
        inner: Arc<dyn Store>,
        open: Arc<AtomicUsize>,
    }

    struct OpenUnit(Arc<AtomicUsize>);

    impl Drop for OpenUnit {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct CountedUnitOfWork {
        inner: Box<dyn UnitOfWork>,
        _open: OpenUnit,
    }

    #[async_trait]
    impl UnitOfWork for CountedUnitOfWork {
        fn accounts(&mut self) -> &mut dyn AccountRepository {
            self.inner.accounts()
        }

        fn transactions(&mut self) -> &mut dyn TransactionRepository {
            self.inner.transactions()
        }

        fn ledger(&mut self) -> &mut dyn LedgerRepository {
            self.inner.ledger()
        }

        fn schedules(&mut self) -> &mut dyn AutoTransferScheduleRepository {
            self.inner.schedules()
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            let CountedUnitOfWork { inner, _open } = *self;
            inner.commit().await
        }
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
            let inner = self.inner.begin().await?;
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountedUnitOfWork {
                inner,
                _open: OpenUnit(self.open.clone()),
            }))
        }
    }

    /// Snapshot source that notes how many units of work were open per lookup
    struct RecordingApi {
        local: LocalAccountApi,
        open: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl AccountInternalApi for RecordingApi {
        async fn snapshot(&self, account_id: AccountId) -> Result<Option<AccountSnapshot>, StoreError> {
            self.seen.lock().push(self.open.load(Ordering::SeqCst));
            self.local.snapshot(account_id).await
        }
    }

    #[tokio::test]
    async fn test_party_snapshots_taken_with_no_unit_of_work_open() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;

        let open = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store: Arc<dyn Store> = Arc::new(CountingStore {
            inner: h.store.clone(),
            open: open.clone(),
        });
        let transfers = TransferHandler::new(store, EventPublisher::disabled()).with_account_api(Arc::new(
            RecordingApi {
                local: LocalAccountApi::new(h.store.clone()),
                open: open.clone(),
                seen: seen.clone(),
            },
        ));

        let result = transfers
            .execute(
                TransferCommand::new(source.id(), target.id(), 700).with_idempotency_key("pool-1"),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, TransferStatus::Settled);
        assert_eq!(*seen.lock(), vec![0, 0]);
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert_eq!(h.balance(target.id()).await, 700);
    }

    // =========================================================================
    // Closing
    // =========================================================================

    #[tokio::test]
    async fn test_close_savings_pays_out_to_payout_account() {
        let mut h = harness();
        let checking = h.open(1, 0).await;
        let savings = h.open_savings(1, Some(checking.id())).await;
        h.accounts
            .deposit(DepositCommand::new(savings.id(), 300_000), &ctx())
            .await
            .unwrap();
        h.drain_events();

        let result = h.accounts.close(CloseAccountCommand::new(savings.id()), &ctx()).await.unwrap();

        assert_eq!(result.account.status(), AccountStatus::Closed);
        assert!(result.account.closed_at().is_some());
        assert_eq!(result.account.balance().value(), 0);
        assert_eq!(result.account.interest_accrued(), Decimal::ZERO);
        assert!(result.interest_forfeited < Decimal::ONE);
        let paid = result.interest_paid;
        assert_eq!(h.balance(checking.id()).await, 300_000 + paid);

        let payout_id = result.payout_transfer_id.unwrap();
        let payout = h.transfers.get(payout_id).await.unwrap();
        assert_eq!(payout.status, TransferStatus::Settled);
        assert_eq!(payout.transfer_type, TransferType::Internal);
        assert_eq!(payout.amount, 300_000 + paid);

        let events = h.drain_events();
        assert!(events.iter().any(|e| e.event_type() == "AccountClosed"));
        assert!(events.iter().any(|e| e.event_type() == "TransferSettled"));

        // Terminal: nothing moves in or out afterwards
        let err = h
            .accounts
            .deposit(DepositCommand::new(savings.id(), 100), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));

        let err = h
            .accounts
            .close(CloseAccountCommand::new(savings.id()), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_close_with_balance_needs_payout() {
        let h = harness();
        let account = h.open(1, 100).await;

        let err = h
            .accounts
            .close(CloseAccountCommand::new(account.id()), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));
        assert_eq!(h.accounts.get(account.id()).await.unwrap().status(), AccountStatus::Active);

        let other = h.open(1, 0).await;
        let result = h
            .accounts
            .close(CloseAccountCommand::new(account.id()).with_payout_account(other.id()), &ctx())
            .await
            .unwrap();
        assert_eq!(result.account.status(), AccountStatus::Closed);
        assert_eq!(h.balance(other.id()).await, 100);
    }

    #[tokio::test]
    async fn test_close_disables_schedule() {
        let h = harness();
        let checking = h.open(1, 0).await;
        let savings = h.open_savings(1, Some(checking.id())).await;
        h.schedules
            .update(
                UpdateAutoTransferScheduleCommand {
                    account_id: savings.id(),
                    enabled: true,
                    cycle: Some(TransferCycle::Weekly),
                    transfer_day: Some(5),
                    amount: Some(10_000),
                    withdrawal_account_id: Some(checking.id()),
                },
                &ctx(),
            )
            .await
            .unwrap();

        h.accounts.close(CloseAccountCommand::new(savings.id()), &ctx()).await.unwrap();

        let schedule = h.schedules.get(savings.id()).await.unwrap();
        assert!(!schedule.enabled());
        assert!(schedule.next_run_date().is_none());
    }

    #[tokio::test]
    async fn test_discard_only_pristine_accounts() {
        let h = harness();
        let pristine = h.open(1, 0).await;
        assert_ok!(h.accounts.discard(pristine.id(), &ctx()).await);
        let err = h.accounts.get(pristine.id()).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::AccountNotFound(_)));

        let used = h.open(1, 100).await;
        h.accounts
            .withdraw(WithdrawCommand::new(used.id(), 100), &ctx())
            .await
            .unwrap();
        let err = h.accounts.discard(used.id(), &ctx()).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));
    }

    // =========================================================================
    // Corrections
    // =========================================================================

    #[tokio::test]
    async fn test_reverse_deposit() {
        let h = harness();
        let account = h.open(1, 0).await;
        h.accounts
            .deposit(DepositCommand::new(account.id(), 700).with_description("cash"), &ctx())
            .await
            .unwrap();
        let deposit = h.accounts.history(account.id(), 0, 1).await.unwrap().items.remove(0);

        let reversal = h
            .accounts
            .reverse_transaction(
                ReverseTransactionCommand {
                    transaction_id: deposit.id(),
                    reason: Some("posted twice".to_string()),
                },
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(reversal.transaction_type(), TransactionType::Reversal);
        assert_eq!(reversal.direction(), Direction::Debit);
        assert_eq!(reversal.related_transaction_id(), Some(deposit.id()));
        assert_eq!(h.balance(account.id()).await, 0);

        let again = h
            .accounts
            .reverse_transaction(
                ReverseTransactionCommand {
                    transaction_id: deposit.id(),
                    reason: None,
                },
                &ctx(),
            )
            .await;
        let err = assert_err!(again);
        assert!(matches!(domain(&err), DomainError::InvalidStateTransition { .. }));
        assert_eq!(h.balance(account.id()).await, 0);
    }

    #[tokio::test]
    async fn test_reversal_respects_balance() {
        let h = harness();
        let account = h.open(1, 0).await;
        h.accounts
            .deposit(DepositCommand::new(account.id(), 700), &ctx())
            .await
            .unwrap();
        let deposit = h.accounts.history(account.id(), 0, 1).await.unwrap().items.remove(0);
        h.accounts
            .withdraw(WithdrawCommand::new(account.id(), 500), &ctx())
            .await
            .unwrap();

        let err = h
            .accounts
            .reverse_transaction(
                ReverseTransactionCommand {
                    transaction_id: deposit.id(),
                    reason: None,
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InsufficientBalance { .. }));
        assert_eq!(h.balance(account.id()).await, 200);
    }

    #[tokio::test]
    async fn test_transfer_legs_cannot_be_reversed() {
        let h = harness();
        let source = h.open(1, 5000).await;
        let target = h.open(2, 0).await;
        let result = h
            .transfers
            .execute(TransferCommand::new(source.id(), target.id(), 1000), &ctx())
            .await
            .unwrap();

        let err = h
            .accounts
            .reverse_transaction(
                ReverseTransactionCommand {
                    transaction_id: result.credit_transaction_id.unwrap(),
                    reason: None,
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));
    }

    #[tokio::test]
    async fn test_adjust_and_void() {
        let h = harness();
        let account = h.open(1, 0).await;
        h.accounts
            .deposit(DepositCommand::new(account.id(), 1000), &ctx())
            .await
            .unwrap();
        let deposit = h.accounts.history(account.id(), 0, 1).await.unwrap().items.remove(0);

        let err = h
            .accounts
            .adjust_transaction(
                AdjustTransactionCommand {
                    transaction_id: deposit.id(),
                    direction: Direction::Debit,
                    amount: 1001,
                    reason: None,
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAmount(_)));

        let adjustment = h
            .accounts
            .adjust_transaction(
                AdjustTransactionCommand {
                    transaction_id: deposit.id(),
                    direction: Direction::Debit,
                    amount: 100,
                    reason: Some("fee correction".to_string()),
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(adjustment.transaction_type(), TransactionType::Adjustment);
        assert_eq!(h.balance(account.id()).await, 900);

        // Compensated transactions stay as they are
        let err = h
            .accounts
            .void_transaction(
                VoidTransactionCommand {
                    transaction_id: deposit.id(),
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));

        // Void the adjustment instead; its debit is undone
        let voided = h
            .accounts
            .void_transaction(
                VoidTransactionCommand {
                    transaction_id: adjustment.id(),
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(voided.status(), TransactionStatus::Void);
        assert_eq!(voided.balance_impact(), 0);
        assert_eq!(h.balance(account.id()).await, 1000);

        let err = h
            .accounts
            .void_transaction(
                VoidTransactionCommand {
                    transaction_id: adjustment.id(),
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_history_paging() {
        let h = harness();
        let account = h.open(1, 0).await;
        for amount in 1..=5 {
            h.accounts
                .deposit(DepositCommand::new(account.id(), amount * 100), &ctx())
                .await
                .unwrap();
        }

        let first = h.accounts.history(account.id(), 0, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].amount().value(), 500);

        let last = h.accounts.history(account.id(), 2, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].amount().value(), 100);

        let clamped = h.accounts.history(account.id(), 0, 10_000).await.unwrap();
        assert_eq!(clamped.size, 100);
        assert_eq!(clamped.items.len(), 5);

        let err = h.accounts.history(9_999, 0, 10).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::AccountNotFound(_)));
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    #[tokio::test]
    async fn test_schedule_update_rules() {
        let h = harness();
        let checking = h.open(1, 0).await;
        let savings = h.open_savings(1, None).await;

        let command = |enabled: bool| UpdateAutoTransferScheduleCommand {
            account_id: savings.id(),
            enabled,
            cycle: Some(TransferCycle::Monthly),
            transfer_day: Some(31),
            amount: Some(50_000),
            withdrawal_account_id: None,
        };

        // First use needs the withdrawal account
        let err = h.schedules.update(command(true), &ctx()).await.unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidCommand(_)));

        let created = h
            .schedules
            .update(
                UpdateAutoTransferScheduleCommand {
                    withdrawal_account_id: Some(checking.id()),
                    ..command(true)
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert!(created.enabled());
        assert!(created.next_run_date().is_some());

        let disabled = h.schedules.update(command(false), &ctx()).await.unwrap();
        assert!(!disabled.enabled());
        assert_eq!(disabled.transfer_day(), Some(31));
        assert!(disabled.next_run_date().is_none());

        // Demand deposit accounts have no schedule
        let err = h
            .schedules
            .update(
                UpdateAutoTransferScheduleCommand {
                    account_id: checking.id(),
                    withdrawal_account_id: Some(savings.id()),
                    ..command(true)
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(domain(&err), DomainError::InvalidAccountState(_)));
    }

    #[tokio::test]
    async fn test_close_pays_interest_when_accrued() {
        let h = harness();
        let checking = h.open(1, 0).await;

        // A year-old savings account with a full year of interest due
        let mut savings = Account::open(
            NewAccount {
                account_number: "90000000000001".to_string(),
                customer_id: 1,
                product_id: 1,
                compounding_type: CompoundingType::Simple,
                base_rate: BasisPoints::new(400).unwrap(),
                savings: Some(SavingsTerms {
                    goal_amount: Money::new(1_000_000).unwrap(),
                    term_months: 12,
                    payout_account_id: Some(checking.id()),
                }),
            },
            Utc::now() - Duration::days(365),
        )
        .unwrap();
        savings.deposit(Money::new(1_000_000).unwrap()).unwrap();
        let savings = {
            let mut uow = h.store.begin().await.unwrap();
            let stored = uow.accounts().save(&savings).await.unwrap();
            uow.commit().await.unwrap();
            stored
        };

        let result = h.accounts.close(CloseAccountCommand::new(savings.id()), &ctx()).await.unwrap();
        assert!(result.interest_paid >= 39_999);
        assert!(result.interest_transaction_id.is_some());
        assert_eq!(h.balance(checking.id()).await, 1_000_000 + result.interest_paid);
    }
}
