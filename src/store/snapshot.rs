//! Account snapshot port
//!
//! Read-only view of an account used to validate the parties of a transfer
//! before any lock is taken.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::aggregate::{AccountId, AccountStatus};
use crate::domain::Money;

use super::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub customer_id: i64,
    pub balance: Money,
    pub status: AccountStatus,
}

/// Snapshot lookup for accounts, local or owned by another service
#[async_trait]
pub trait AccountInternalApi: Send + Sync {
    async fn snapshot(&self, account_id: AccountId) -> Result<Option<AccountSnapshot>, StoreError>;
}

/// Snapshots served from the local store
#[derive(Clone)]
pub struct LocalAccountApi {
    store: Arc<dyn Store>,
}

impl LocalAccountApi {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AccountInternalApi for LocalAccountApi {
    async fn snapshot(&self, account_id: AccountId) -> Result<Option<AccountSnapshot>, StoreError> {
        let mut uow = self.store.begin().await?;
        let account = uow.accounts().find_by_id(account_id).await?;

        Ok(account.map(|a| AccountSnapshot {
            account_id: a.id(),
            customer_id: a.customer_id(),
            balance: a.balance(),
            status: a.status(),
        }))
    }
}
