//! Transfer Aggregate
//!
//! A transfer is the header of a double-entry pair. It walks
//!
//! ```text
//! REQUESTED -> DEBIT_PENDING -> DEBIT_POSTED -> CREDIT_PENDING -> CREDIT_POSTED -> SETTLED
//! ```
//!
//! and may drop to FAILED or VOID from any non-terminal state. Once settled
//! it holds exactly one debit and one credit entry of equal amount.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::{DomainError, Money};

use super::transaction::{Direction, TransactionStatus};
use super::{AccountId, LedgerEntryId, TransactionId, TransferId};

/// Longest idempotency key accepted
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferType {
    Internal,
    ExternalOutbound,
    ExternalInbound,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Internal => "INTERNAL",
            TransferType::ExternalOutbound => "EXTERNAL_OUTBOUND",
            TransferType::ExternalInbound => "EXTERNAL_INBOUND",
        }
    }

    /// The source account is owned here and is debited locally
    pub fn debits_locally(&self) -> bool {
        !matches!(self, TransferType::ExternalInbound)
    }

    /// The target account is owned here and is credited locally
    pub fn credits_locally(&self) -> bool {
        !matches!(self, TransferType::ExternalOutbound)
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTERNAL" => Ok(TransferType::Internal),
            "EXTERNAL_OUTBOUND" => Ok(TransferType::ExternalOutbound),
            "EXTERNAL_INBOUND" => Ok(TransferType::ExternalInbound),
            other => Err(format!("unknown transfer type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Requested,
    DebitPending,
    DebitPosted,
    CreditPending,
    CreditPosted,
    Settled,
    Failed,
    Void,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Requested => "REQUESTED",
            TransferStatus::DebitPending => "DEBIT_PENDING",
            TransferStatus::DebitPosted => "DEBIT_POSTED",
            TransferStatus::CreditPending => "CREDIT_PENDING",
            TransferStatus::CreditPosted => "CREDIT_POSTED",
            TransferStatus::Settled => "SETTLED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Void => "VOID",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Settled | TransferStatus::Failed | TransferStatus::Void
        )
    }

    /// Next step on the happy path
    pub fn next(&self) -> Option<TransferStatus> {
        match self {
            TransferStatus::Requested => Some(TransferStatus::DebitPending),
            TransferStatus::DebitPending => Some(TransferStatus::DebitPosted),
            TransferStatus::DebitPosted => Some(TransferStatus::CreditPending),
            TransferStatus::CreditPending => Some(TransferStatus::CreditPosted),
            TransferStatus::CreditPosted => Some(TransferStatus::Settled),
            TransferStatus::Settled | TransferStatus::Failed | TransferStatus::Void => None,
        }
    }

    pub fn can_transition_to(&self, target: TransferStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            TransferStatus::Failed | TransferStatus::Void => true,
            other => self.next() == Some(other),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(TransferStatus::Requested),
            "DEBIT_PENDING" => Ok(TransferStatus::DebitPending),
            "DEBIT_POSTED" => Ok(TransferStatus::DebitPosted),
            "CREDIT_PENDING" => Ok(TransferStatus::CreditPending),
            "CREDIT_POSTED" => Ok(TransferStatus::CreditPosted),
            "SETTLED" => Ok(TransferStatus::Settled),
            "FAILED" => Ok(TransferStatus::Failed),
            "VOID" => Ok(TransferStatus::Void),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}

/// One half of a transfer.
///
/// `transaction_id` is `None` for the leg held by another service
/// (the remote side of an external transfer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub(crate) id: LedgerEntryId,
    pub(crate) account_id: AccountId,
    pub(crate) direction: Direction,
    pub(crate) amount: Money,
    pub(crate) status: TransactionStatus,
    pub(crate) value_date: NaiveDate,
    pub(crate) posted_at: DateTime<Utc>,
    pub(crate) transaction_id: Option<TransactionId>,
}

impl LedgerEntry {
    pub fn signed_amount(&self) -> i64 {
        match self.status {
            TransactionStatus::Posted => self.direction.signed(self.amount),
            TransactionStatus::Void => 0,
        }
    }

    pub fn id(&self) -> LedgerEntryId {
        self.id
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn value_date(&self) -> NaiveDate {
        self.value_date
    }

    pub fn posted_at(&self) -> DateTime<Utc> {
        self.posted_at
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }
}

/// Transfer Aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub(crate) id: TransferId,
    pub(crate) transfer_type: TransferType,
    pub(crate) status: TransferStatus,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) source_account_id: AccountId,
    pub(crate) target_account_id: AccountId,
    pub(crate) amount: Money,
    pub(crate) value_date: NaiveDate,
    pub(crate) memo: Option<String>,
    pub(crate) entries: Vec<LedgerEntry>,
    pub(crate) failure_reason: Option<String>,
    pub(crate) requested_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) settled_at: Option<DateTime<Utc>>,
}

impl Transfer {
    /// Create a REQUESTED transfer after checking the command's shape
    pub fn request(
        transfer_type: TransferType,
        source_account_id: AccountId,
        target_account_id: AccountId,
        amount: Money,
        value_date: NaiveDate,
        idempotency_key: Option<String>,
        memo: Option<String>,
    ) -> Result<Self, DomainError> {
        if amount.is_zero() {
            return Err(DomainError::InvalidAmount("transfer amount must be positive".to_string()));
        }
        if source_account_id <= 0 || target_account_id <= 0 {
            return Err(DomainError::InvalidCommand("account ids must be positive".to_string()));
        }
        if transfer_type == TransferType::Internal && source_account_id == target_account_id {
            return Err(DomainError::SameAccountTransfer);
        }
        if let Some(key) = &idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(DomainError::InvalidCommand(format!(
                    "idempotency key must be 1-{} characters",
                    MAX_IDEMPOTENCY_KEY_LEN
                )));
            }
        }

        let now = Utc::now();
        Ok(Self {
            id: 0,
            transfer_type,
            status: TransferStatus::Requested,
            idempotency_key,
            source_account_id,
            target_account_id,
            amount,
            value_date,
            memo,
            entries: Vec::with_capacity(2),
            failure_reason: None,
            requested_at: now,
            updated_at: now,
            settled_at: None,
        })
    }

    /// Move to `target`, enforcing the state machine
    pub fn transition(&mut self, target: TransferStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(target) {
            return Err(DomainError::transition("transfer", self.status, target));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Take the next happy-path step
    pub fn advance(&mut self) -> Result<TransferStatus, DomainError> {
        let next = self
            .status
            .next()
            .ok_or_else(|| DomainError::transition("transfer", self.status, "next"))?;
        self.transition(next)?;
        Ok(next)
    }

    /// Record the debit or credit leg while it is pending and advance past it
    pub fn record_leg(
        &mut self,
        direction: Direction,
        transaction_id: Option<TransactionId>,
    ) -> Result<(), DomainError> {
        let (expected, account_id) = match direction {
            Direction::Debit => (TransferStatus::DebitPending, self.source_account_id),
            Direction::Credit => (TransferStatus::CreditPending, self.target_account_id),
        };
        if self.status != expected {
            return Err(DomainError::transition(
                "transfer",
                self.status,
                format!("{} leg", direction.as_str()),
            ));
        }

        self.entries.push(LedgerEntry {
            id: 0,
            account_id,
            direction,
            amount: self.amount,
            status: TransactionStatus::Posted,
            value_date: self.value_date,
            posted_at: Utc::now(),
            transaction_id,
        });
        self.advance()?;
        Ok(())
    }

    /// CREDIT_POSTED -> SETTLED, only with a balanced pair of entries
    pub fn settle(&mut self) -> Result<(), DomainError> {
        if !self.is_balanced() {
            return Err(DomainError::InvalidCommand(format!(
                "transfer {} is not balanced and cannot settle",
                self.id
            )));
        }
        self.transition(TransferStatus::Settled)?;
        self.settled_at = Some(self.updated_at);
        Ok(())
    }

    /// Mark FAILED with a reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        self.transition(TransferStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Cancel an unfinished transfer
    pub fn cancel(&mut self) -> Result<(), DomainError> {
        self.transition(TransferStatus::Void)
    }

    /// Exactly one debit and one credit whose signed amounts cancel out
    pub fn is_balanced(&self) -> bool {
        let debits = self
            .entries
            .iter()
            .filter(|e| e.direction == Direction::Debit)
            .count();
        let credits = self
            .entries
            .iter()
            .filter(|e| e.direction == Direction::Credit)
            .count();
        let sum: i64 = self.entries.iter().map(LedgerEntry::signed_amount).sum();

        debits == 1 && credits == 1 && sum == 0
    }

    pub fn entry(&self, direction: Direction) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.direction == direction)
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn source_account_id(&self) -> AccountId {
        self.source_account_id
    }

    pub fn target_account_id(&self) -> AccountId {
        self.target_account_id
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn value_date(&self) -> NaiveDate {
        self.value_date
    }

    pub fn memo(&self) -> Option<&str> {
        self.memo.as_deref()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        self.settled_at
    }
}
