//! Persistence ports
//!
//! Repositories are reached through a [`UnitOfWork`]: one database
//! transaction whose row locks are held until it is committed or dropped.
//! Dropping a unit of work without committing rolls everything back and
//! releases its locks, on every exit path.

mod memory;
mod postgres;
mod snapshot;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use snapshot::{AccountInternalApi, AccountSnapshot, LocalAccountApi};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::aggregate::{
    Account, AccountId, AutoTransferSchedule, Transaction, TransactionId, Transfer, TransferId,
};

/// Largest page served by transaction history
pub const MAX_PAGE_SIZE: u32 = 100;

/// Errors that can occur in the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unique constraint violated on commit or insert
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Update or lookup of a row that must exist
    #[error("Row not found: {0}")]
    RowNotFound(String),

    /// Stored value cannot be mapped back to the domain
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

#[async_trait]
pub trait AccountRepository: Send {
    async fn find_by_id(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Load and lock the row until the unit of work ends
    async fn find_by_id_for_update(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn find_by_account_number(&mut self, account_number: &str) -> Result<Option<Account>, StoreError>;

    async fn find_by_customer_id(&mut self, customer_id: i64) -> Result<Vec<Account>, StoreError>;

    /// Ids of ACTIVE and FROZEN accounts, ascending
    async fn find_open_ids(&mut self) -> Result<Vec<AccountId>, StoreError>;

    async fn exists_by_account_number(&mut self, account_number: &str) -> Result<bool, StoreError>;

    /// Insert when the id is 0, otherwise update. Returns the stored row.
    async fn save(&mut self, account: &Account) -> Result<Account, StoreError>;

    async fn delete(&mut self, id: AccountId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TransactionRepository: Send {
    async fn load(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// Newest first; `size` is clamped to `1..=MAX_PAGE_SIZE`
    async fn load_by_account(
        &mut self,
        account_id: AccountId,
        page: u32,
        size: u32,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Transactions posted against `original_id` (reversals and adjustments)
    async fn load_related(&mut self, original_id: TransactionId) -> Result<Vec<Transaction>, StoreError>;

    /// Insert a new transaction
    async fn save(&mut self, transaction: &Transaction) -> Result<Transaction, StoreError>;

    /// Persist a status transition; nothing else about a transaction changes
    async fn update(&mut self, transaction: &Transaction) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerRepository: Send {
    /// Lookup by idempotency key, locking the row when found
    async fn find_by_source_account_id_and_idempotency_key(
        &mut self,
        source_account_id: AccountId,
        idempotency_key: &str,
    ) -> Result<Option<Transfer>, StoreError>;

    async fn find_by_id(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    async fn find_by_id_for_update(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    /// Insert a new transfer with its entries
    async fn save(&mut self, transfer: &Transfer) -> Result<Transfer, StoreError>;

    /// Locked update of an existing transfer; new entries are inserted.
    /// Fails with `RowNotFound` if the transfer vanished.
    async fn save_and_flush(&mut self, transfer: &Transfer) -> Result<Transfer, StoreError>;

    /// Non-terminal transfers last touched before `older_than`
    async fn find_stale(&mut self, older_than: DateTime<Utc>) -> Result<Vec<TransferId>, StoreError>;
}

#[async_trait]
pub trait AutoTransferScheduleRepository: Send {
    async fn find_by_account_id(&mut self, account_id: AccountId) -> Result<Option<AutoTransferSchedule>, StoreError>;

    async fn find_by_account_id_for_update(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<AutoTransferSchedule>, StoreError>;

    async fn create(&mut self, schedule: &AutoTransferSchedule) -> Result<AutoTransferSchedule, StoreError>;

    async fn update(&mut self, schedule: &AutoTransferSchedule) -> Result<(), StoreError>;

    /// Enabled schedules with `next_run_date <= reference`, locked.
    /// Rows locked by another unit of work are skipped, not waited for.
    async fn find_due_schedules_for_update(
        &mut self,
        reference: NaiveDate,
    ) -> Result<Vec<AutoTransferSchedule>, StoreError>;
}

/// Scoped transaction over all repositories
#[async_trait]
pub trait UnitOfWork: Send {
    fn accounts(&mut self) -> &mut dyn AccountRepository;

    fn transactions(&mut self) -> &mut dyn TransactionRepository;

    fn ledger(&mut self) -> &mut dyn LedgerRepository;

    fn schedules(&mut self) -> &mut dyn AutoTransferScheduleRepository;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Factory for units of work
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

/// Clamp a requested history page size
pub fn clamp_page_size(size: u32) -> u32 {
    size.clamp(1, MAX_PAGE_SIZE)
}
