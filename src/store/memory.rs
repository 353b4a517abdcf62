//! In-memory store
//!
//! Runs the service without a database and backs the test suite. Every row
//! has its own async mutex standing in for a row-level lock; writes are
//! staged inside the unit of work and become visible only on commit, where
//! the unique constraints are checked.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use crate::aggregate::{
    Account, AccountId, AccountStatus, AutoTransferSchedule, ScheduleId, Transaction, TransactionId,
    Transfer, TransferId,
};

use super::{
    clamp_page_size, AccountRepository, AutoTransferScheduleRepository, LedgerRepository, Store,
    StoreError, TransactionRepository, UnitOfWork,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    Transfer(TransferId),
    Schedule(ScheduleId),
}

#[derive(Debug, Default, Clone)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<TransactionId, Transaction>,
    transfers: BTreeMap<TransferId, Transfer>,
    schedules: BTreeMap<ScheduleId, AutoTransferSchedule>,
}

impl Tables {
    fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.transactions.is_empty()
            && self.transfers.is_empty()
            && self.schedules.is_empty()
    }
}

#[derive(Debug, Default)]
struct Sequences {
    account: AtomicI64,
    transaction: AtomicI64,
    transfer: AtomicI64,
    ledger_entry: AtomicI64,
    schedule: AtomicI64,
}

fn next_id(sequence: &AtomicI64) -> i64 {
    sequence.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowLock<()>>>>,
    sequences: Sequences,
}

impl Inner {
    fn row_lock(&self, key: RowKey) -> Arc<RowLock<()>> {
        self.row_locks
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone()
    }

    /// Forget row locks nobody holds or waits for. Clones are only handed
    /// out under the map mutex, so a count of one means the map is the sole
    /// owner.
    fn prune_row_locks<'a>(&self, keys: impl IntoIterator<Item = &'a RowKey>) {
        let mut row_locks = self.row_locks.lock();
        for key in keys {
            if row_locks.get(key).map_or(false, |lock| Arc::strong_count(lock) == 1) {
                row_locks.remove(key);
            }
        }
    }
}

/// Row locks held by one unit of work; released and pruned on drop
struct HeldLocks {
    inner: Arc<Inner>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            guards: HashMap::new(),
        }
    }

    fn contains(&self, key: &RowKey) -> bool {
        self.guards.contains_key(key)
    }

    fn insert(&mut self, key: RowKey, guard: OwnedMutexGuard<()>) {
        self.guards.insert(key, guard);
    }

    fn release(&mut self, key: RowKey) {
        if self.guards.remove(&key).is_some() {
            self.inner.prune_row_locks([&key]);
        }
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        let keys: Vec<RowKey> = self.guards.keys().copied().collect();
        self.guards.clear();
        self.inner.prune_row_locks(&keys);
    }
}

/// Store kept entirely in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(MemoryUnitOfWork {
            inner: self.inner.clone(),
            held: HeldLocks::new(self.inner.clone()),
            staged: Tables::default(),
            deleted: HashSet::new(),
        }))
    }
}

/// Unit of work over [`MemoryStore`]. Row locks are released on drop.
pub struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    held: HeldLocks,
    staged: Tables,
    deleted: HashSet<AccountId>,
}

impl MemoryUnitOfWork {
    /// Wait for the row lock; re-entrant within the unit of work
    async fn lock(&mut self, key: RowKey) {
        if self.held.contains(&key) {
            return;
        }
        let guard = self.inner.row_lock(key).lock_owned().await;
        self.held.insert(key, guard);
    }

    /// Take the row lock only if nobody else holds it
    fn try_lock(&mut self, key: RowKey) -> bool {
        if self.held.contains(&key) {
            return true;
        }
        match self.inner.row_lock(key).try_lock_owned() {
            Ok(guard) => {
                self.held.insert(key, guard);
                true
            }
            Err(_) => false,
        }
    }

    fn account(&self, id: AccountId) -> Option<Account> {
        if self.deleted.contains(&id) {
            return None;
        }
        let tables = self.inner.tables.lock();
        get(&tables.accounts, &self.staged.accounts, id)
    }

    fn accounts_where(&self, pred: &dyn Fn(&Account) -> bool) -> BTreeMap<AccountId, Account> {
        let mut rows = {
            let tables = self.inner.tables.lock();
            select(&tables.accounts, &self.staged.accounts, pred)
        };
        for id in &self.deleted {
            rows.remove(id);
        }
        rows
    }

    fn transfer(&self, id: TransferId) -> Option<Transfer> {
        let tables = self.inner.tables.lock();
        get(&tables.transfers, &self.staged.transfers, id)
    }

    fn transfers_where(&self, pred: &dyn Fn(&Transfer) -> bool) -> BTreeMap<TransferId, Transfer> {
        let tables = self.inner.tables.lock();
        select(&tables.transfers, &self.staged.transfers, pred)
    }

    fn schedule(&self, id: ScheduleId) -> Option<AutoTransferSchedule> {
        let tables = self.inner.tables.lock();
        get(&tables.schedules, &self.staged.schedules, id)
    }

    fn schedules_where(
        &self,
        pred: &dyn Fn(&AutoTransferSchedule) -> bool,
    ) -> BTreeMap<ScheduleId, AutoTransferSchedule> {
        let tables = self.inner.tables.lock();
        select(&tables.schedules, &self.staged.schedules, pred)
    }

    fn stage_transfer(&mut self, transfer: &Transfer) -> Transfer {
        let mut stored = transfer.clone();
        if stored.id == 0 {
            stored.id = next_id(&self.inner.sequences.transfer);
        }
        for entry in stored.entries.iter_mut().filter(|e| e.id == 0) {
            entry.id = next_id(&self.inner.sequences.ledger_entry);
        }
        self.staged.transfers.insert(stored.id, stored.clone());
        stored
    }
}

/// Own writes win over committed rows
fn get<T: Clone>(committed: &BTreeMap<i64, T>, staged: &BTreeMap<i64, T>, id: i64) -> Option<T> {
    staged.get(&id).or_else(|| committed.get(&id)).cloned()
}

fn select<T: Clone>(
    committed: &BTreeMap<i64, T>,
    staged: &BTreeMap<i64, T>,
    pred: &dyn Fn(&T) -> bool,
) -> BTreeMap<i64, T> {
    let mut rows: BTreeMap<i64, T> = committed
        .iter()
        .filter(|(_, row)| pred(row))
        .map(|(id, row)| (*id, row.clone()))
        .collect();
    for (id, row) in staged {
        if pred(row) {
            rows.insert(*id, row.clone());
        } else {
            rows.remove(id);
        }
    }
    rows
}

/// Check a unique key over the table as it would look after commit
fn ensure_unique<T, K: Eq + Hash>(
    committed: &BTreeMap<i64, T>,
    staged: &BTreeMap<i64, T>,
    removed: &HashSet<i64>,
    key: impl Fn(&T) -> Option<K>,
    constraint: &str,
) -> Result<(), StoreError> {
    if staged.is_empty() {
        return Ok(());
    }

    let mut seen: HashMap<K, i64> = HashMap::new();
    let rows = committed
        .iter()
        .filter(|(id, _)| !staged.contains_key(id) && !removed.contains(id))
        .chain(staged.iter());

    for (id, row) in rows {
        if let Some(k) = key(row) {
            if let Some(other) = seen.insert(k, *id) {
                if other != *id {
                    return Err(StoreError::UniqueViolation(constraint.to_string()));
                }
            }
        }
    }
    Ok(())
}

fn check_constraints(tables: &Tables, staged: &Tables, deleted: &HashSet<AccountId>) -> Result<(), StoreError> {
    let none = HashSet::new();
    ensure_unique(
        &tables.accounts,
        &staged.accounts,
        deleted,
        |a: &Account| Some(a.account_number.clone()),
        "account_account_number_key",
    )?;
    ensure_unique(
        &tables.transfers,
        &staged.transfers,
        &none,
        |t: &Transfer| {
            t.idempotency_key
                .clone()
                .map(|key| (t.source_account_id, key))
        },
        "transfer_source_account_id_idempotency_key_key",
    )?;
    ensure_unique(
        &tables.schedules,
        &staged.schedules,
        &none,
        |s: &AutoTransferSchedule| Some(s.account_id),
        "account_auto_transfer_account_id_key",
    )?;
    Ok(())
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
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
        if this.staged.is_empty() && this.deleted.is_empty() {
            return Ok(());
        }

        {
            let mut tables = this.inner.tables.lock();
            check_constraints(&tables, &this.staged, &this.deleted)?;

            let staged = this.staged;
            tables.accounts.extend(staged.accounts);
            tables.transactions.extend(staged.transactions);
            tables.transfers.extend(staged.transfers);
            tables.schedules.extend(staged.schedules);
            for id in &this.deleted {
                tables.accounts.remove(id);
            }
        }

        // Row locks are released here, after the writes are visible
        drop(this.held);
        Ok(())
    }
}

#[async_trait]
impl AccountRepository for MemoryUnitOfWork {
    async fn find_by_id(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.account(id))
    }

    async fn find_by_id_for_update(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.lock(RowKey::Account(id)).await;
        Ok(self.account(id))
    }

    async fn find_by_account_number(&mut self, account_number: &str) -> Result<Option<Account>, StoreError> {
        let rows = self.accounts_where(&|a: &Account| a.account_number == account_number);
        Ok(rows.into_values().next())
    }

    async fn find_by_customer_id(&mut self, customer_id: i64) -> Result<Vec<Account>, StoreError> {
        let rows = self.accounts_where(&|a: &Account| a.customer_id == customer_id);
        Ok(rows.into_values().collect())
    }

    async fn find_open_ids(&mut self) -> Result<Vec<AccountId>, StoreError> {
        let rows = self.accounts_where(&|a: &Account| a.status != AccountStatus::Closed);
        Ok(rows.into_keys().collect())
    }

    async fn exists_by_account_number(&mut self, account_number: &str) -> Result<bool, StoreError> {
        Ok(!self.accounts_where(&|a: &Account| a.account_number == account_number).is_empty())
    }

    async fn save(&mut self, account: &Account) -> Result<Account, StoreError> {
        let mut stored = account.clone();
        if stored.id == 0 {
            stored.id = next_id(&self.inner.sequences.account);
        } else {
            self.lock(RowKey::Account(stored.id)).await;
            if self.account(stored.id).is_none() {
                return Err(StoreError::RowNotFound(format!("account {}", stored.id)));
            }
        }
        self.staged.accounts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn delete(&mut self, id: AccountId) -> Result<bool, StoreError> {
        self.lock(RowKey::Account(id)).await;
        if self.account(id).is_none() {
            return Ok(false);
        }
        self.staged.accounts.remove(&id);
        self.deleted.insert(id);
        Ok(true)
    }
}

#[async_trait]
impl TransactionRepository for MemoryUnitOfWork {
    async fn load(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let tables = self.inner.tables.lock();
        Ok(get(&tables.transactions, &self.staged.transactions, id))
    }

    async fn load_by_account(
        &mut self,
        account_id: AccountId,
        page: u32,
        size: u32,
    ) -> Result<Vec<Transaction>, StoreError> {
        let size = clamp_page_size(size) as usize;
        let mut rows: Vec<Transaction> = {
            let tables = self.inner.tables.lock();
            select(
                &tables.transactions,
                &self.staged.transactions,
                &|t: &Transaction| t.account_id == account_id,
            )
            .into_values()
            .collect()
        };
        rows.sort_by(|a, b| b.posted_at.cmp(&a.posted_at).then(b.id.cmp(&a.id)));

        Ok(rows
            .into_iter()
            .skip((page as usize).saturating_mul(size))
            .take(size)
            .collect())
    }

    async fn load_related(&mut self, original_id: TransactionId) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.inner.tables.lock();
        Ok(select(
            &tables.transactions,
            &self.staged.transactions,
            &|t: &Transaction| t.related_transaction_id == Some(original_id),
        )
        .into_values()
        .collect())
    }

    async fn save(&mut self, transaction: &Transaction) -> Result<Transaction, StoreError> {
        let mut stored = transaction.clone();
        stored.id = next_id(&self.inner.sequences.transaction);
        self.staged.transactions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        let existing = {
            let tables = self.inner.tables.lock();
            get(&tables.transactions, &self.staged.transactions, transaction.id)
        };
        let mut existing =
            existing.ok_or_else(|| StoreError::RowNotFound(format!("transaction {}", transaction.id)))?;
        existing.status = transaction.status;
        self.staged.transactions.insert(existing.id, existing);
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for MemoryUnitOfWork {
    async fn find_by_source_account_id_and_idempotency_key(
        &mut self,
        source_account_id: AccountId,
        idempotency_key: &str,
    ) -> Result<Option<Transfer>, StoreError> {
        let found = self
            .transfers_where(&|t: &Transfer| {
                t.source_account_id == source_account_id
                    && t.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .into_keys()
            .next();

        match found {
            Some(id) => {
                self.lock(RowKey::Transfer(id)).await;
                Ok(self.transfer(id))
            }
            None => Ok(None),
        }
    }

    async fn find_by_id(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        Ok(self.transfer(id))
    }

    async fn find_by_id_for_update(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        self.lock(RowKey::Transfer(id)).await;
        Ok(self.transfer(id))
    }

    async fn save(&mut self, transfer: &Transfer) -> Result<Transfer, StoreError> {
        let mut fresh = transfer.clone();
        fresh.id = 0;
        Ok(self.stage_transfer(&fresh))
    }

    async fn save_and_flush(&mut self, transfer: &Transfer) -> Result<Transfer, StoreError> {
        self.lock(RowKey::Transfer(transfer.id)).await;
        if transfer.id == 0 || self.transfer(transfer.id).is_none() {
            return Err(StoreError::RowNotFound(format!("transfer {}", transfer.id)));
        }
        Ok(self.stage_transfer(transfer))
    }

    async fn find_stale(&mut self, older_than: DateTime<Utc>) -> Result<Vec<TransferId>, StoreError> {
        let rows = self.transfers_where(&|t: &Transfer| !t.status.is_terminal() && t.updated_at < older_than);
        Ok(rows.into_keys().collect())
    }
}

#[async_trait]
impl AutoTransferScheduleRepository for MemoryUnitOfWork {
    async fn find_by_account_id(&mut self, account_id: AccountId) -> Result<Option<AutoTransferSchedule>, StoreError> {
        Ok(self
            .schedules_where(&|s: &AutoTransferSchedule| s.account_id == account_id)
            .into_values()
            .next())
    }

    async fn find_by_account_id_for_update(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<AutoTransferSchedule>, StoreError> {
        let found = self
            .schedules_where(&|s: &AutoTransferSchedule| s.account_id == account_id)
            .into_keys()
            .next();

        match found {
            Some(id) => {
                self.lock(RowKey::Schedule(id)).await;
                Ok(self.schedule(id))
            }
            None => Ok(None),
        }
    }

    async fn create(&mut self, schedule: &AutoTransferSchedule) -> Result<AutoTransferSchedule, StoreError> {
        let mut stored = schedule.clone();
        stored.id = next_id(&self.inner.sequences.schedule);
        self.staged.schedules.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&mut self, schedule: &AutoTransferSchedule) -> Result<(), StoreError> {
        self.lock(RowKey::Schedule(schedule.id)).await;
        if self.schedule(schedule.id).is_none() {
            return Err(StoreError::RowNotFound(format!("schedule {}", schedule.id)));
        }
        self.staged.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn find_due_schedules_for_update(
        &mut self,
        reference: NaiveDate,
    ) -> Result<Vec<AutoTransferSchedule>, StoreError> {
        let candidates: Vec<ScheduleId> = self
            .schedules_where(&|s: &AutoTransferSchedule| s.is_due(reference))
            .into_keys()
            .collect();

        let mut due = Vec::with_capacity(candidates.len());
        for id in candidates {
            let key = RowKey::Schedule(id);
            if !self.try_lock(key) {
                continue;
            }
            // Another unit of work may have advanced it before we got the lock
            match self.schedule(id) {
                Some(schedule) if schedule.is_due(reference) => due.push(schedule),
                _ => self.held.release(key),
            }
        }
        Ok(due)
    }
}
