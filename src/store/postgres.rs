//! PostgreSQL store
//!
//! One sqlx transaction per unit of work. Row locks come from
//! `SELECT ... FOR UPDATE`; the scheduler poll uses `SKIP LOCKED` so
//! concurrent instances split the due schedules between them.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use std::str::FromStr;

use crate::aggregate::{
    Account, AccountId, AutoTransferSchedule, LedgerEntry, Transaction, TransactionId, Transfer,
    TransferId,
};
use crate::domain::{BasisPoints, Money};

use super::{
    clamp_page_size, AccountRepository, AutoTransferScheduleRepository, LedgerRepository, Store,
    StoreError, TransactionRepository, UnitOfWork,
};

const UNIQUE_VIOLATION: &str = "23505";

const ACCOUNT_COLUMNS: &str = r#"
    id, account_number, customer_id, product_id, kind, compounding_type, status,
    balance, base_rate_bps, bonus_rate_bps, interest_accrued, goal_amount, term_months,
    maturity_date, payout_account_id, opened_at, closed_at, last_accrual_ts,
    last_rate_change_at, created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, account_id, transaction_type, direction, amount, value_date, posted_at, status,
    related_transaction_id, transfer_id, description
"#;

const TRANSFER_COLUMNS: &str = r#"
    id, transfer_type, status, idempotency_key, source_account_id, target_account_id,
    amount, value_date, memo, failure_reason, requested_at, updated_at, settled_at
"#;

const SCHEDULE_COLUMNS: &str = r#"
    id, account_id, withdrawal_account_id, cycle, transfer_day, amount, enabled,
    next_run_date, last_executed_at, failed_attempts, created_at, updated_at
"#;

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

/// Unit of work over one database transaction; rolled back on drop
pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

// =========================================================================
// Row mapping
// =========================================================================

fn parse<T: FromStr<Err = String>>(value: String) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Corrupt)
}

fn money(value: i64) -> Result<Money, StoreError> {
    Money::new(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn basis_points(value: i32) -> Result<BasisPoints, StoreError> {
    u32::try_from(value)
        .ok()
        .and_then(|v| BasisPoints::new(v).ok())
        .ok_or_else(|| StoreError::Corrupt(format!("rate out of range: {}", value)))
}

fn unsigned(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", column, value)))
}

fn signed(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} too large: {}", column, value)))
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        id: row.try_get("id")?,
        account_number: row.try_get("account_number")?,
        customer_id: row.try_get("customer_id")?,
        product_id: row.try_get("product_id")?,
        kind: parse(row.try_get("kind")?)?,
        compounding_type: parse(row.try_get("compounding_type")?)?,
        status: parse(row.try_get("status")?)?,
        balance: money(row.try_get("balance")?)?,
        base_rate: basis_points(row.try_get("base_rate_bps")?)?,
        bonus_rate: basis_points(row.try_get("bonus_rate_bps")?)?,
        interest_accrued: row.try_get("interest_accrued")?,
        goal_amount: row
            .try_get::<Option<i64>, _>("goal_amount")?
            .map(money)
            .transpose()?,
        term_months: row
            .try_get::<Option<i32>, _>("term_months")?
            .map(|v| unsigned(v, "term_months"))
            .transpose()?,
        maturity_date: row.try_get("maturity_date")?,
        payout_account_id: row.try_get("payout_account_id")?,
        opened_at: row.try_get("opened_at")?,
        closed_at: row.try_get("closed_at")?,
        last_accrual_ts: row.try_get("last_accrual_ts")?,
        last_rate_change_at: row.try_get("last_rate_change_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    Ok(Transaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        transaction_type: parse(row.try_get("transaction_type")?)?,
        direction: parse(row.try_get("direction")?)?,
        amount: money(row.try_get("amount")?)?,
        value_date: row.try_get("value_date")?,
        posted_at: row.try_get("posted_at")?,
        status: parse(row.try_get("status")?)?,
        related_transaction_id: row.try_get("related_transaction_id")?,
        transfer_id: row.try_get("transfer_id")?,
        description: row.try_get("description")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        direction: parse(row.try_get("direction")?)?,
        amount: money(row.try_get("amount")?)?,
        status: parse(row.try_get("status")?)?,
        value_date: row.try_get("value_date")?,
        posted_at: row.try_get("posted_at")?,
        transaction_id: row.try_get("transaction_id")?,
    })
}

fn transfer_from_row(row: &PgRow, entries: Vec<LedgerEntry>) -> Result<Transfer, StoreError> {
    Ok(Transfer {
        id: row.try_get("id")?,
        transfer_type: parse(row.try_get("transfer_type")?)?,
        status: parse(row.try_get("status")?)?,
        idempotency_key: row.try_get("idempotency_key")?,
        source_account_id: row.try_get("source_account_id")?,
        target_account_id: row.try_get("target_account_id")?,
        amount: money(row.try_get("amount")?)?,
        value_date: row.try_get("value_date")?,
        memo: row.try_get("memo")?,
        entries,
        failure_reason: row.try_get("failure_reason")?,
        requested_at: row.try_get("requested_at")?,
        updated_at: row.try_get("updated_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<AutoTransferSchedule, StoreError> {
    Ok(AutoTransferSchedule {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        withdrawal_account_id: row.try_get("withdrawal_account_id")?,
        cycle: row
            .try_get::<Option<String>, _>("cycle")?
            .map(parse)
            .transpose()?,
        transfer_day: row
            .try_get::<Option<i32>, _>("transfer_day")?
            .map(|v| unsigned(v, "transfer_day"))
            .transpose()?,
        amount: row
            .try_get::<Option<i64>, _>("amount")?
            .map(money)
            .transpose()?,
        enabled: row.try_get("enabled")?,
        next_run_date: row.try_get("next_run_date")?,
        last_executed_at: row.try_get("last_executed_at")?,
        failed_attempts: unsigned(row.try_get("failed_attempts")?, "failed_attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Map SQLSTATE 23505 to a unique violation
fn map_write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::UniqueViolation(db.constraint().unwrap_or("unique").to_string());
        }
    }
    StoreError::Database(err)
}

impl PgUnitOfWork {
    async fn fetch_account(&mut self, id: AccountId, lock: bool) -> Result<Option<Account>, StoreError> {
        let sql = format!(
            "SELECT {} FROM account WHERE id = $1{}",
            ACCOUNT_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn load_entries(&mut self, transfer_id: TransferId) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, direction, amount, status, value_date, posted_at, transaction_id
            FROM ledger_entry
            WHERE transfer_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(transfer_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn fetch_transfer(&mut self, sql: &str, binds: TransferLookup<'_>) -> Result<Option<Transfer>, StoreError> {
        let query = sqlx::query(sql);
        let query = match binds {
            TransferLookup::Id(id) => query.bind(id),
            TransferLookup::Key(source, key) => query.bind(source).bind(key),
        };
        let Some(row) = query.fetch_optional(&mut *self.tx).await? else {
            return Ok(None);
        };

        let id: TransferId = row.try_get("id")?;
        let entries = self.load_entries(id).await?;
        transfer_from_row(&row, entries).map(Some)
    }

    /// Insert entries that have no id yet
    async fn insert_new_entries(&mut self, transfer: &mut Transfer) -> Result<(), StoreError> {
        let transfer_id = transfer.id;
        for entry in transfer.entries.iter_mut().filter(|e| e.id == 0) {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO ledger_entry (
                    transfer_id, account_id, direction, amount, status,
                    value_date, posted_at, transaction_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
                "#,
            )
            .bind(transfer_id)
            .bind(entry.account_id)
            .bind(entry.direction.as_str())
            .bind(entry.amount.value())
            .bind(entry.status.as_str())
            .bind(entry.value_date)
            .bind(entry.posted_at)
            .bind(entry.transaction_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
            entry.id = id;
        }
        Ok(())
    }

    async fn fetch_schedule(&mut self, account_id: AccountId, lock: bool) -> Result<Option<AutoTransferSchedule>, StoreError> {
        let sql = format!(
            "SELECT {} FROM account_auto_transfer WHERE account_id = $1{}",
            SCHEDULE_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }
}

enum TransferLookup<'a> {
    Id(TransferId),
    Key(AccountId, &'a str),
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn accounts(&mut self) -> &mut dyn AccountRepository {
        self
    }

    fn transactions(&mut self) -> &mut dyn TransactionRepository {
        self
    }

    fn ledger(&mut self) -> &mut dyn LedgerRepository {
        self
    }

    fn schedules(&mut self) -> &mut dyn AutoTransferScheduleRepository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await.map_err(map_write_error)
    }
}

// =========================================================================
// Accounts
// =========================================================================

#[async_trait]
impl AccountRepository for PgUnitOfWork {
    async fn find_by_id(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.fetch_account(id, false).await
    }

    async fn find_by_id_for_update(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.fetch_account(id, true).await
    }

    async fn find_by_account_number(&mut self, account_number: &str) -> Result<Option<Account>, StoreError> {
        let sql = format!("SELECT {} FROM account WHERE account_number = $1", ACCOUNT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(account_number)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_customer_id(&mut self, customer_id: i64) -> Result<Vec<Account>, StoreError> {
        let sql = format!(
            "SELECT {} FROM account WHERE customer_id = $1 ORDER BY id ASC",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(customer_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn find_open_ids(&mut self) -> Result<Vec<AccountId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM account WHERE status <> 'CLOSED' ORDER BY id ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn exists_by_account_number(&mut self, account_number: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM account WHERE account_number = $1)",
        )
        .bind(account_number)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn save(&mut self, account: &Account) -> Result<Account, StoreError> {
        let term_months = account
            .term_months
            .map(|t| signed(t, "term_months"))
            .transpose()?;
        let base_rate = signed(account.base_rate.value(), "base_rate_bps")?;
        let bonus_rate = signed(account.bonus_rate.value(), "bonus_rate_bps")?;
        let goal_amount = account.goal_amount.map(|g| g.value());

        let mut stored = account.clone();
        if account.id == 0 {
            stored.id = sqlx::query_scalar(
                r#"
                INSERT INTO account (
                    account_number, customer_id, product_id, kind, compounding_type, status,
                    balance, base_rate_bps, bonus_rate_bps, interest_accrued, goal_amount,
                    term_months, maturity_date, payout_account_id, opened_at, closed_at,
                    last_accrual_ts, last_rate_change_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
                RETURNING id
                "#,
            )
            .bind(&account.account_number)
            .bind(account.customer_id)
            .bind(account.product_id)
            .bind(account.kind.as_str())
            .bind(account.compounding_type.as_str())
            .bind(account.status.as_str())
            .bind(account.balance.value())
            .bind(base_rate)
            .bind(bonus_rate)
            .bind(account.interest_accrued)
            .bind(goal_amount)
            .bind(term_months)
            .bind(account.maturity_date)
            .bind(account.payout_account_id)
            .bind(account.opened_at)
            .bind(account.closed_at)
            .bind(account.last_accrual_ts)
            .bind(account.last_rate_change_at)
            .bind(account.created_at)
            .bind(account.updated_at)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
            return Ok(stored);
        }

        let result = sqlx::query(
            r#"
            UPDATE account SET
                status = $2, balance = $3, base_rate_bps = $4, bonus_rate_bps = $5,
                interest_accrued = $6, payout_account_id = $7, closed_at = $8,
                last_accrual_ts = $9, last_rate_change_at = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(account.id)
        .bind(account.status.as_str())
        .bind(account.balance.value())
        .bind(base_rate)
        .bind(bonus_rate)
        .bind(account.interest_accrued)
        .bind(account.payout_account_id)
        .bind(account.closed_at)
        .bind(account.last_accrual_ts)
        .bind(account.last_rate_change_at)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound(format!("account {}", account.id)));
        }
        stored.id = account.id;
        Ok(stored)
    }

    async fn delete(&mut self, id: AccountId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM account WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// =========================================================================
// Transactions
// =========================================================================

#[async_trait]
impl TransactionRepository for PgUnitOfWork {
    async fn load(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let sql = format!(r#"SELECT {} FROM "transaction" WHERE id = $1"#, TRANSACTION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn load_by_account(
        &mut self,
        account_id: AccountId,
        page: u32,
        size: u32,
    ) -> Result<Vec<Transaction>, StoreError> {
        let size = i64::from(clamp_page_size(size));
        let offset = i64::from(page).saturating_mul(size);
        let sql = format!(
            r#"
            SELECT {} FROM "transaction"
            WHERE account_id = $1
            ORDER BY posted_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(size)
            .bind(offset)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn load_related(&mut self, original_id: TransactionId) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            r#"SELECT {} FROM "transaction" WHERE related_transaction_id = $1 ORDER BY id"#,
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(original_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn save(&mut self, transaction: &Transaction) -> Result<Transaction, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO "transaction" (
                account_id, transaction_type, direction, amount, value_date, posted_at,
                status, related_transaction_id, transfer_id, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(transaction.account_id)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.direction.as_str())
        .bind(transaction.amount.value())
        .bind(transaction.value_date)
        .bind(transaction.posted_at)
        .bind(transaction.status.as_str())
        .bind(transaction.related_transaction_id)
        .bind(transaction.transfer_id)
        .bind(&transaction.description)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_write_error)?;

        let mut stored = transaction.clone();
        stored.id = id;
        Ok(stored)
    }

    async fn update(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        let result = sqlx::query(r#"UPDATE "transaction" SET status = $2 WHERE id = $1"#)
            .bind(transaction.id)
            .bind(transaction.status.as_str())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound(format!("transaction {}", transaction.id)));
        }
        Ok(())
    }
}

// =========================================================================
// Transfers
// =========================================================================

#[async_trait]
impl LedgerRepository for PgUnitOfWork {
    async fn find_by_source_account_id_and_idempotency_key(
        &mut self,
        source_account_id: AccountId,
        idempotency_key: &str,
    ) -> Result<Option<Transfer>, StoreError> {
        let sql = format!(
            "SELECT {} FROM transfer WHERE source_account_id = $1 AND idempotency_key = $2 FOR UPDATE",
            TRANSFER_COLUMNS
        );
        self.fetch_transfer(&sql, TransferLookup::Key(source_account_id, idempotency_key))
            .await
    }

    async fn find_by_id(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        let sql = format!("SELECT {} FROM transfer WHERE id = $1", TRANSFER_COLUMNS);
        self.fetch_transfer(&sql, TransferLookup::Id(id)).await
    }

    async fn find_by_id_for_update(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        let sql = format!("SELECT {} FROM transfer WHERE id = $1 FOR UPDATE", TRANSFER_COLUMNS);
        self.fetch_transfer(&sql, TransferLookup::Id(id)).await
    }

    async fn save(&mut self, transfer: &Transfer) -> Result<Transfer, StoreError> {
        let mut stored = transfer.clone();
        stored.id = sqlx::query_scalar(
            r#"
            INSERT INTO transfer (
                transfer_type, status, idempotency_key, source_account_id, target_account_id,
                amount, value_date, memo, failure_reason, requested_at, updated_at, settled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(transfer.transfer_type.as_str())
        .bind(transfer.status.as_str())
        .bind(&transfer.idempotency_key)
        .bind(transfer.source_account_id)
        .bind(transfer.target_account_id)
        .bind(transfer.amount.value())
        .bind(transfer.value_date)
        .bind(&transfer.memo)
        .bind(&transfer.failure_reason)
        .bind(transfer.requested_at)
        .bind(transfer.updated_at)
        .bind(transfer.settled_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_write_error)?;

        for entry in stored.entries.iter_mut() {
            entry.id = 0;
        }
        self.insert_new_entries(&mut stored).await?;
        Ok(stored)
    }

    async fn save_and_flush(&mut self, transfer: &Transfer) -> Result<Transfer, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE transfer SET
                status = $2, failure_reason = $3, updated_at = $4, settled_at = $5
            WHERE id = $1
            "#,
        )
        .bind(transfer.id)
        .bind(transfer.status.as_str())
        .bind(&transfer.failure_reason)
        .bind(transfer.updated_at)
        .bind(transfer.settled_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound(format!("transfer {}", transfer.id)));
        }

        let mut stored = transfer.clone();
        self.insert_new_entries(&mut stored).await?;
        Ok(stored)
    }

    async fn find_stale(&mut self, older_than: DateTime<Utc>) -> Result<Vec<TransferId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM transfer
            WHERE status NOT IN ('SETTLED', 'FAILED', 'VOID')
              AND updated_at < $1
            ORDER BY id ASC
            "#,
        )
        .bind(older_than)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }
}

// =========================================================================
// Auto-transfer schedules
// =========================================================================

#[async_trait]
impl AutoTransferScheduleRepository for PgUnitOfWork {
    async fn find_by_account_id(&mut self, account_id: AccountId) -> Result<Option<AutoTransferSchedule>, StoreError> {
        self.fetch_schedule(account_id, false).await
    }

    async fn find_by_account_id_for_update(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<AutoTransferSchedule>, StoreError> {
        self.fetch_schedule(account_id, true).await
    }

    async fn create(&mut self, schedule: &AutoTransferSchedule) -> Result<AutoTransferSchedule, StoreError> {
        let transfer_day = schedule
            .transfer_day
            .map(|d| signed(d, "transfer_day"))
            .transpose()?;
        let failed_attempts = signed(schedule.failed_attempts, "failed_attempts")?;

        let mut stored = schedule.clone();
        stored.id = sqlx::query_scalar(
            r#"
            INSERT INTO account_auto_transfer (
                account_id, withdrawal_account_id, cycle, transfer_day, amount, enabled,
                next_run_date, last_executed_at, failed_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(schedule.account_id)
        .bind(schedule.withdrawal_account_id)
        .bind(schedule.cycle.map(|c| c.as_str()))
        .bind(transfer_day)
        .bind(schedule.amount.map(|a| a.value()))
        .bind(schedule.enabled)
        .bind(schedule.next_run_date)
        .bind(schedule.last_executed_at)
        .bind(failed_attempts)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_write_error)?;
        Ok(stored)
    }

    async fn update(&mut self, schedule: &AutoTransferSchedule) -> Result<(), StoreError> {
        let transfer_day = schedule
            .transfer_day
            .map(|d| signed(d, "transfer_day"))
            .transpose()?;
        let failed_attempts = signed(schedule.failed_attempts, "failed_attempts")?;

        let result = sqlx::query(
            r#"
            UPDATE account_auto_transfer SET
                cycle = $2, transfer_day = $3, amount = $4, enabled = $5,
                next_run_date = $6, last_executed_at = $7, failed_attempts = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.cycle.map(|c| c.as_str()))
        .bind(transfer_day)
        .bind(schedule.amount.map(|a| a.value()))
        .bind(schedule.enabled)
        .bind(schedule.next_run_date)
        .bind(schedule.last_executed_at)
        .bind(failed_attempts)
        .bind(schedule.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound(format!("schedule {}", schedule.id)));
        }
        Ok(())
    }

    async fn find_due_schedules_for_update(
        &mut self,
        reference: NaiveDate,
    ) -> Result<Vec<AutoTransferSchedule>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM account_auto_transfer
            WHERE enabled = TRUE AND next_run_date <= $1
            ORDER BY id ASC
            FOR UPDATE SKIP LOCKED
            "#,
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(reference)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }
}
