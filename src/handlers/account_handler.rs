//! Account Handler
//!
//! Opening, cash movements, rate changes, freezing, closing and corrections.
//! Every mutation runs in one unit of work holding the account row lock.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::{
    Account, AccountId, AccountStatus, AutoTransferSchedule, CompoundingType, NewAccount,
    SavingsTerms, Transaction, TransactionId, TransactionStatus, TransactionType, Transfer,
    TransferType,
};
use crate::domain::{BasisPoints, DomainError, EventPublisher, LedgerEvent, Money, OperationContext};
use crate::error::AppError;
use crate::store::{clamp_page_size, Store, UnitOfWork};

use super::transfer_handler::{flush_error, post_legs};
use super::{
    AdjustTransactionCommand, CloseAccountCommand, CloseAccountResult, CreateAccountCommand,
    DepositCommand, FreezeAccountCommand, ReverseTransactionCommand, TransactionPage,
    UpdateBonusRateCommand, VoidTransactionCommand, WithdrawCommand,
};

/// Attempts at finding a free account number before giving up
const ACCOUNT_NUMBER_ATTEMPTS: i64 = 20;

/// Commits retried after losing an account number race
const ACCOUNT_NUMBER_RACES: u32 = 3;

// =========================================================================
// Products
// =========================================================================

/// Interest terms attached to a product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductTerms {
    pub compounding_type: CompoundingType,
    pub base_rate: BasisPoints,
}

/// Products accounts can be opened against
#[derive(Debug, Clone)]
pub struct ProductCatalog {
    products: HashMap<i64, ProductTerms>,
}

impl ProductCatalog {
    pub fn empty() -> Self {
        Self {
            products: HashMap::new(),
        }
    }

    pub fn with_product(mut self, product_id: i64, compounding_type: CompoundingType, base_rate: BasisPoints) -> Self {
        self.products.insert(
            product_id,
            ProductTerms {
                compounding_type,
                base_rate,
            },
        );
        self
    }

    pub fn terms(&self, product_id: i64) -> Result<ProductTerms, DomainError> {
        self.products
            .get(&product_id)
            .copied()
            .ok_or_else(|| DomainError::InvalidCommand(format!("unknown product {}", product_id)))
    }
}

impl Default for ProductCatalog {
    /// Demand deposit (1) and one savings product per compounding type
    fn default() -> Self {
        let bps = |v: u32| BasisPoints::new(v).unwrap_or(BasisPoints::ZERO);
        Self::empty()
            .with_product(1, CompoundingType::Simple, bps(10))
            .with_product(2, CompoundingType::Daily, bps(300))
            .with_product(3, CompoundingType::Month, bps(350))
            .with_product(4, CompoundingType::Year, bps(400))
    }
}

/// `<product 3 digits><customer 6 digits><sequence 5 digits>`
pub fn format_account_number(product_id: i64, customer_id: i64, sequence: i64) -> String {
    format!(
        "{:03}{:06}{:05}",
        product_id.rem_euclid(1_000),
        customer_id.rem_euclid(1_000_000),
        sequence.rem_euclid(100_000)
    )
}

// =========================================================================
// AccountHandler
// =========================================================================

/// Handler for account lifecycle and balance operations
pub struct AccountHandler {
    store: Arc<dyn Store>,
    events: EventPublisher,
    catalog: ProductCatalog,
}

impl AccountHandler {
    pub fn new(store: Arc<dyn Store>, events: EventPublisher) -> Self {
        Self {
            store,
            events,
            catalog: ProductCatalog::default(),
        }
    }

    pub fn with_catalog(mut self, catalog: ProductCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Open a demand deposit or savings account
    pub async fn create(
        &self,
        command: CreateAccountCommand,
        context: &OperationContext,
    ) -> Result<Account, AppError> {
        let mut attempt = 1;
        loop {
            match self.try_create(command.clone(), context).await {
                // Another opening took the same number between check and commit
                Err(AppError::Store(e)) if e.is_unique_violation() && attempt < ACCOUNT_NUMBER_RACES => {
                    tracing::debug!(attempt, "Account number taken concurrently, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_create(
        &self,
        command: CreateAccountCommand,
        context: &OperationContext,
    ) -> Result<Account, AppError> {
        let terms = self.catalog.terms(command.product_id())?;
        let customer_id = command.customer_id();
        let product_id = command.product_id();

        let (savings, auto_transfer) = match command {
            CreateAccountCommand::DemandDeposit { .. } => (None, None),
            CreateAccountCommand::Savings {
                goal_amount,
                term_months,
                payout_account_id,
                auto_transfer,
                ..
            } => (
                Some(SavingsTerms {
                    goal_amount,
                    term_months,
                    payout_account_id,
                }),
                auto_transfer,
            ),
        };

        let mut uow = self.store.begin().await?;

        if let Some(payout_id) = savings.as_ref().and_then(|s| s.payout_account_id) {
            require_open(uow.as_mut(), payout_id).await?;
        }
        if let Some(setup) = &auto_transfer {
            require_open(uow.as_mut(), setup.withdrawal_account_id).await?;
        }

        let account_number = self.allocate_account_number(uow.as_mut(), product_id, customer_id).await?;
        let now = Utc::now();
        let account = Account::open(
            NewAccount {
                account_number,
                customer_id,
                product_id,
                compounding_type: terms.compounding_type,
                base_rate: terms.base_rate,
                savings,
            },
            now,
        )?;
        let account = uow.accounts().save(&account).await?;

        if let Some(setup) = auto_transfer {
            let schedule = AutoTransferSchedule::new(
                account.id(),
                setup.withdrawal_account_id,
                setup.settings,
                now.date_naive(),
            )?;
            uow.schedules().create(&schedule).await?;
        }

        uow.commit().await?;

        tracing::info!(
            account_id = account.id(),
            account_number = %account.account_number(),
            kind = account.kind().as_str(),
            customer_id,
            correlation_id = ?context.correlation_id,
            "Account opened"
        );
        Ok(account)
    }

    async fn allocate_account_number(
        &self,
        uow: &mut dyn UnitOfWork,
        product_id: i64,
        customer_id: i64,
    ) -> Result<String, AppError> {
        let existing = uow.accounts().find_by_customer_id(customer_id).await?.len() as i64;
        for attempt in 0..ACCOUNT_NUMBER_ATTEMPTS {
            let candidate = format_account_number(product_id, customer_id, existing + attempt + 1);
            if !uow.accounts().exists_by_account_number(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(AppError::Internal(format!(
            "no free account number for customer {} on product {}",
            customer_id, product_id
        )))
    }

    pub async fn get(&self, account_id: AccountId) -> Result<Account, AppError> {
        let mut uow = self.store.begin().await?;
        uow.accounts()
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| DomainError::AccountNotFound(account_id.to_string()).into())
    }

    pub async fn get_by_number(&self, account_number: &str) -> Result<Account, AppError> {
        let mut uow = self.store.begin().await?;
        uow.accounts()
            .find_by_account_number(account_number)
            .await?
            .ok_or_else(|| DomainError::AccountNotFound(account_number.to_string()).into())
    }

    pub async fn list_by_customer(&self, customer_id: i64) -> Result<Vec<Account>, AppError> {
        let mut uow = self.store.begin().await?;
        Ok(uow.accounts().find_by_customer_id(customer_id).await?)
    }

    // =====================================================================
    // Balance
    // =====================================================================

    pub async fn deposit(&self, command: DepositCommand, context: &OperationContext) -> Result<Account, AppError> {
        let amount = Money::positive(command.amount)?;
        let mut uow = self.store.begin().await?;
        let mut account = lock_account(uow.as_mut(), command.account_id).await?;

        account.deposit(amount)?;
        let tx = Transaction::post(
            account.id(),
            TransactionType::Deposit,
            amount,
            Utc::now().date_naive(),
            command.description,
        )?;
        let account = uow.accounts().save(&account).await?;
        let tx = uow.transactions().save(&tx).await?;
        uow.commit().await?;

        tracing::info!(
            account_id = account.id(),
            transaction_id = tx.id(),
            amount = amount.value(),
            correlation_id = ?context.correlation_id,
            "Deposit posted"
        );
        Ok(account)
    }

    pub async fn withdraw(&self, command: WithdrawCommand, context: &OperationContext) -> Result<Account, AppError> {
        let amount = Money::positive(command.amount)?;
        let mut uow = self.store.begin().await?;
        let mut account = lock_account(uow.as_mut(), command.account_id).await?;

        account.withdraw(amount)?;
        let tx = Transaction::post(
            account.id(),
            TransactionType::Withdrawal,
            amount,
            Utc::now().date_naive(),
            command.description,
        )?;
        let account = uow.accounts().save(&account).await?;
        let tx = uow.transactions().save(&tx).await?;
        uow.commit().await?;

        tracing::info!(
            account_id = account.id(),
            transaction_id = tx.id(),
            amount = amount.value(),
            correlation_id = ?context.correlation_id,
            "Withdrawal posted"
        );
        Ok(account)
    }

    // =====================================================================
    // Rates and status
    // =====================================================================

    /// Raise the bonus rate. Accrual up to now happens at the old rate first.
    pub async fn update_bonus_rate(
        &self,
        command: UpdateBonusRateCommand,
        context: &OperationContext,
    ) -> Result<Account, AppError> {
        let new_rate = BasisPoints::from_percent(command.new_rate_percent)?;
        let mut uow = self.store.begin().await?;
        let mut account = lock_account(uow.as_mut(), command.account_id).await?;
        let previous = account.bonus_rate();

        if new_rate <= previous {
            tracing::debug!(
                account_id = account.id(),
                current_bps = previous.value(),
                requested_bps = new_rate.value(),
                "Bonus rate not raised"
            );
            return Ok(account);
        }

        let now = Utc::now();
        account.accrue(now)?;
        account.update_bonus_rate(new_rate)?;
        let account = uow.accounts().save(&account).await?;
        uow.commit().await?;

        tracing::info!(
            account_id = account.id(),
            previous_bps = previous.value(),
            new_bps = new_rate.value(),
            correlation_id = ?context.correlation_id,
            "Bonus rate raised"
        );
        self.events.publish(LedgerEvent::BonusRateRaised {
            account_id: account.id(),
            previous_bps: previous.value(),
            new_bps: new_rate.value(),
            raised_at: now,
        });
        Ok(account)
    }

    pub async fn freeze(&self, command: FreezeAccountCommand, context: &OperationContext) -> Result<Account, AppError> {
        let mut uow = self.store.begin().await?;
        let mut account = lock_account(uow.as_mut(), command.account_id).await?;

        account.freeze()?;
        let account = uow.accounts().save(&account).await?;
        uow.commit().await?;

        tracing::warn!(
            account_id = account.id(),
            reason = ?command.reason,
            correlation_id = ?context.correlation_id,
            "Account frozen"
        );
        Ok(account)
    }

    pub async fn unfreeze(&self, account_id: AccountId, context: &OperationContext) -> Result<Account, AppError> {
        let mut uow = self.store.begin().await?;
        let mut account = lock_account(uow.as_mut(), account_id).await?;

        account.unfreeze()?;
        let account = uow.accounts().save(&account).await?;
        uow.commit().await?;

        tracing::info!(account_id, correlation_id = ?context.correlation_id, "Account unfrozen");
        Ok(account)
    }

    // =====================================================================
    // Closing
    // =====================================================================

    /// Close an account.
    ///
    /// Interest is accrued up to now and its whole-won part posted; the
    /// balance then moves to the payout account as a settled internal
    /// transfer. Any auto-transfer into the account is disabled.
    pub async fn close(
        &self,
        command: CloseAccountCommand,
        context: &OperationContext,
    ) -> Result<CloseAccountResult, AppError> {
        let account_id = command.account_id;
        let mut uow = self.store.begin().await?;

        // Schedule row first, matching the scheduler's lock order
        let schedule = uow.schedules().find_by_account_id_for_update(account_id).await?;

        let unlocked = uow
            .accounts()
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| DomainError::AccountNotFound(account_id.to_string()))?;
        if unlocked.status() == AccountStatus::Closed {
            return Err(DomainError::transition("account", AccountStatus::Closed, AccountStatus::Closed).into());
        }
        let payout_id = command.payout_account_id.or(unlocked.payout_account_id());
        if payout_id == Some(account_id) {
            return Err(DomainError::SameAccountTransfer.into());
        }

        let (mut account, mut payout) = match payout_id {
            Some(payout_id) if payout_id < account_id => {
                let payout = lock_account(uow.as_mut(), payout_id).await?;
                (lock_account(uow.as_mut(), account_id).await?, Some(payout))
            }
            Some(payout_id) => {
                let account = lock_account(uow.as_mut(), account_id).await?;
                (account, Some(lock_account(uow.as_mut(), payout_id).await?))
            }
            None => (lock_account(uow.as_mut(), account_id).await?, None),
        };

        let now = Utc::now();
        account.accrue(now)?;
        let (payable, forfeited) = account.take_accrued_interest()?;

        let mut interest_transaction_id = None;
        if !payable.is_zero() {
            account.deposit(payable)?;
            let tx = Transaction::post(
                account.id(),
                TransactionType::Interest,
                payable,
                now.date_naive(),
                Some("interest paid on closing".to_string()),
            )?;
            interest_transaction_id = Some(uow.transactions().save(&tx).await?.id());
        }
        uow.accounts().save(&account).await?;

        let mut payout_transfer = None;
        let balance = account.balance();
        if !balance.is_zero() {
            let payout = payout.as_mut().ok_or_else(|| {
                DomainError::InvalidAccountState(format!(
                    "account {} holds {} and has no payout account",
                    account.account_number(),
                    balance
                ))
            })?;

            let transfer = Transfer::request(
                TransferType::Internal,
                account.id(),
                payout.id(),
                balance,
                now.date_naive(),
                None,
                Some("account closing payout".to_string()),
            )?;
            let mut transfer = uow.ledger().save(&transfer).await?;
            post_legs(uow.as_mut(), &mut transfer, Some(&mut account), Some(payout)).await?;
            payout_transfer = Some(uow.ledger().save_and_flush(&transfer).await.map_err(flush_error)?);
        }

        account.close(now)?;
        let account = uow.accounts().save(&account).await?;

        if let Some(mut schedule) = schedule {
            if schedule.enabled() {
                schedule.disable();
                uow.schedules().update(&schedule).await?;
            }
        }

        uow.commit().await?;

        tracing::info!(
            account_id,
            interest_paid = payable.value(),
            interest_forfeited = %forfeited,
            payout_account_id = ?payout_id,
            correlation_id = ?context.correlation_id,
            "Account closed"
        );

        if let Some(transaction_id) = interest_transaction_id {
            self.events.publish(LedgerEvent::InterestPaid {
                account_id,
                transaction_id,
                amount: payable.value(),
                forfeited,
                paid_at: now,
            });
        }
        if let Some(transfer) = &payout_transfer {
            self.events.publish(LedgerEvent::TransferSettled {
                transfer_id: transfer.id(),
                source_account_id: transfer.source_account_id(),
                target_account_id: transfer.target_account_id(),
                amount: transfer.amount().value(),
                settled_at: transfer.settled_at().unwrap_or(now),
            });
        }
        self.events.publish(LedgerEvent::AccountClosed {
            account_id,
            payout_account_id: payout_transfer.as_ref().map(|t| t.target_account_id()),
            closed_at: now,
        });

        Ok(CloseAccountResult {
            account,
            interest_paid: payable.value(),
            interest_forfeited: forfeited,
            interest_transaction_id,
            payout_transfer_id: payout_transfer.map(|t| t.id()),
        })
    }

    /// Delete an account opened by mistake: ACTIVE, empty and never posted to
    pub async fn discard(&self, account_id: AccountId, context: &OperationContext) -> Result<(), AppError> {
        let mut uow = self.store.begin().await?;
        let account = lock_account(uow.as_mut(), account_id).await?;

        account.ensure_active("discard")?;
        if !account.balance().is_zero() || !account.interest_accrued().is_zero() {
            return Err(DomainError::InvalidAccountState(format!(
                "account {} still holds money",
                account.account_number()
            ))
            .into());
        }
        let has_history = !uow.transactions().load_by_account(account_id, 0, 1).await?.is_empty();
        let has_schedule = uow.schedules().find_by_account_id(account_id).await?.is_some();
        if has_history || has_schedule {
            return Err(DomainError::InvalidAccountState(format!(
                "account {} has history and can only be closed",
                account.account_number()
            ))
            .into());
        }

        if !uow.accounts().delete(account_id).await? {
            return Err(DomainError::LedgerNotFound(format!("account {}", account_id)).into());
        }
        uow.commit().await?;

        tracing::info!(account_id, correlation_id = ?context.correlation_id, "Account discarded");
        Ok(())
    }

    // =====================================================================
    // History and corrections
    // =====================================================================

    /// Newest first
    pub async fn history(&self, account_id: AccountId, page: u32, size: u32) -> Result<TransactionPage, AppError> {
        let size = clamp_page_size(size);
        let mut uow = self.store.begin().await?;
        if uow.accounts().find_by_id(account_id).await?.is_none() {
            return Err(DomainError::AccountNotFound(account_id.to_string()).into());
        }
        let items = uow.transactions().load_by_account(account_id, page, size).await?;
        Ok(TransactionPage {
            account_id,
            page,
            size,
            items,
        })
    }

    /// Post a REVERSAL that mirrors the original transaction
    pub async fn reverse_transaction(
        &self,
        command: ReverseTransactionCommand,
        context: &OperationContext,
    ) -> Result<Transaction, AppError> {
        let reason = command.reason;
        self.compensate(command.transaction_id, context, |original| {
            Transaction::compensating(
                TransactionType::Reversal,
                original.direction().opposite(),
                original.amount(),
                original,
                reason,
            )
        })
        .await
    }

    /// Post an ADJUSTMENT of at most the original amount
    pub async fn adjust_transaction(
        &self,
        command: AdjustTransactionCommand,
        context: &OperationContext,
    ) -> Result<Transaction, AppError> {
        let amount = Money::positive(command.amount)?;
        let reason = command.reason;
        let direction = command.direction;
        self.compensate(command.transaction_id, context, move |original| {
            Transaction::compensating(TransactionType::Adjustment, direction, amount, original, reason)
        })
        .await
    }

    async fn compensate(
        &self,
        transaction_id: TransactionId,
        context: &OperationContext,
        build: impl FnOnce(&Transaction) -> Result<Transaction, DomainError>,
    ) -> Result<Transaction, AppError> {
        let mut uow = self.store.begin().await?;
        let (mut account, original) = self.lock_original(uow.as_mut(), transaction_id).await?;

        let related = uow.transactions().load_related(transaction_id).await?;
        let compensation = build(&original)?;
        if compensation.transaction_type() == TransactionType::Reversal
            && related.iter().any(|t| {
                t.transaction_type() == TransactionType::Reversal && t.status() == TransactionStatus::Posted
            })
        {
            return Err(DomainError::transition("transaction", "REVERSED", TransactionType::Reversal).into());
        }

        apply_impact(&mut account, compensation.balance_impact())?;
        let account = uow.accounts().save(&account).await?;
        let compensation = uow.transactions().save(&compensation).await?;
        uow.commit().await?;

        tracing::info!(
            account_id = account.id(),
            transaction_id,
            compensation_id = compensation.id(),
            kind = compensation.transaction_type().as_str(),
            amount = compensation.amount().value(),
            correlation_id = ?context.correlation_id,
            "Compensating transaction posted"
        );
        Ok(compensation)
    }

    /// Void a transaction nothing has compensated yet, undoing its balance impact
    pub async fn void_transaction(
        &self,
        command: VoidTransactionCommand,
        context: &OperationContext,
    ) -> Result<Transaction, AppError> {
        let transaction_id = command.transaction_id;
        let mut uow = self.store.begin().await?;
        let (mut account, mut original) = self.lock_original(uow.as_mut(), transaction_id).await?;

        let related = uow.transactions().load_related(transaction_id).await?;
        if related.iter().any(|t| t.status() == TransactionStatus::Posted) {
            return Err(DomainError::InvalidAccountState(format!(
                "transaction {} has compensating postings and cannot be voided",
                transaction_id
            ))
            .into());
        }

        let impact = original.balance_impact();
        original.void()?;
        apply_impact(&mut account, -impact)?;
        uow.accounts().save(&account).await?;
        uow.transactions().update(&original).await?;
        uow.commit().await?;

        tracing::info!(
            account_id = account.id(),
            transaction_id,
            correlation_id = ?context.correlation_id,
            "Transaction voided"
        );
        Ok(original)
    }

    /// Load a correctable transaction and lock its account
    async fn lock_original(
        &self,
        uow: &mut dyn UnitOfWork,
        transaction_id: TransactionId,
    ) -> Result<(Account, Transaction), AppError> {
        let original = uow
            .transactions()
            .load(transaction_id)
            .await?
            .ok_or(DomainError::TransactionNotFound(transaction_id))?;
        if original.transfer_id().is_some() {
            return Err(DomainError::InvalidAccountState(format!(
                "transaction {} belongs to transfer and cannot be corrected on its own",
                transaction_id
            ))
            .into());
        }

        let account = lock_account(uow, original.account_id()).await?;
        // Re-read under the account lock; status may have changed meanwhile
        let original = uow
            .transactions()
            .load(transaction_id)
            .await?
            .ok_or(DomainError::TransactionNotFound(transaction_id))?;
        Ok((account, original))
    }
}

/// Lock an account row; missing accounts are `AccountNotFound`
async fn lock_account(uow: &mut dyn UnitOfWork, account_id: AccountId) -> Result<Account, AppError> {
    uow.accounts()
        .find_by_id_for_update(account_id)
        .await?
        .ok_or_else(|| DomainError::AccountNotFound(account_id.to_string()).into())
}

async fn require_open(uow: &mut dyn UnitOfWork, account_id: AccountId) -> Result<(), AppError> {
    let account = uow
        .accounts()
        .find_by_id(account_id)
        .await?
        .ok_or_else(|| DomainError::AccountNotFound(account_id.to_string()))?;
    if account.status() == AccountStatus::Closed {
        return Err(DomainError::InvalidAccountState(format!(
            "account {} is closed",
            account.account_number()
        ))
        .into());
    }
    Ok(())
}

/// Apply a signed balance change through the aggregate's own checks
fn apply_impact(account: &mut Account, impact: i64) -> Result<(), DomainError> {
    let amount = Money::new(impact.saturating_abs())?;
    match impact {
        i if i > 0 => account.deposit(amount),
        i if i < 0 => account.withdraw(amount),
        _ => Ok(()),
    }
}
