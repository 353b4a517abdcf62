//! Transaction
//!
//! Immutable posting record against a single account. The only change a
//! posted transaction accepts is POSTED -> VOID.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::{DomainError, Money};

use super::{AccountId, TransactionId, TransferId};

/// Kind of posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    TransferIn,
    TransferOut,
    Interest,
    Fee,
    Reversal,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::TransferIn => "TRANSFER_IN",
            TransactionType::TransferOut => "TRANSFER_OUT",
            TransactionType::Interest => "INTEREST",
            TransactionType::Fee => "FEE",
            TransactionType::Reversal => "REVERSAL",
            TransactionType::Adjustment => "ADJUSTMENT",
        }
    }

    /// Fixed direction of the type, `None` for compensating types whose
    /// direction depends on the transaction they correct.
    pub fn canonical_direction(&self) -> Option<Direction> {
        match self {
            TransactionType::Deposit | TransactionType::TransferIn | TransactionType::Interest => {
                Some(Direction::Credit)
            }
            TransactionType::Withdrawal | TransactionType::TransferOut | TransactionType::Fee => {
                Some(Direction::Debit)
            }
            TransactionType::Reversal | TransactionType::Adjustment => None,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(TransactionType::Deposit),
            "WITHDRAWAL" => Ok(TransactionType::Withdrawal),
            "TRANSFER_IN" => Ok(TransactionType::TransferIn),
            "TRANSFER_OUT" => Ok(TransactionType::TransferOut),
            "INTEREST" => Ok(TransactionType::Interest),
            "FEE" => Ok(TransactionType::Fee),
            "REVERSAL" => Ok(TransactionType::Reversal),
            "ADJUSTMENT" => Ok(TransactionType::Adjustment),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

/// Credit raises the balance, debit lowers it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "CREDIT",
            Direction::Debit => "DEBIT",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        }
    }

    /// Apply the sign of this direction to an amount
    pub fn signed(&self, amount: Money) -> i64 {
        match self {
            Direction::Credit => amount.value(),
            Direction::Debit => -amount.value(),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(Direction::Credit),
            "DEBIT" => Ok(Direction::Debit),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Posted,
    Void,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Posted => "POSTED",
            TransactionStatus::Void => "VOID",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POSTED" => Ok(TransactionStatus::Posted),
            "VOID" => Ok(TransactionStatus::Void),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// Posting record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) account_id: AccountId,
    pub(crate) transaction_type: TransactionType,
    pub(crate) direction: Direction,
    pub(crate) amount: Money,
    pub(crate) value_date: NaiveDate,
    pub(crate) posted_at: DateTime<Utc>,
    pub(crate) status: TransactionStatus,
    pub(crate) related_transaction_id: Option<TransactionId>,
    pub(crate) transfer_id: Option<TransferId>,
    pub(crate) description: Option<String>,
}

impl Transaction {
    /// Post a transaction of a type with a fixed direction
    pub fn post(
        account_id: AccountId,
        transaction_type: TransactionType,
        amount: Money,
        value_date: NaiveDate,
        description: Option<String>,
    ) -> Result<Self, DomainError> {
        let direction = transaction_type.canonical_direction().ok_or_else(|| {
            DomainError::InvalidCommand(format!(
                "{} must reference the transaction it corrects",
                transaction_type
            ))
        })?;
        if amount.is_zero() {
            return Err(DomainError::InvalidAmount(format!(
                "{} amount must be positive",
                transaction_type
            )));
        }

        Ok(Self {
            id: 0,
            account_id,
            transaction_type,
            direction,
            amount,
            value_date,
            posted_at: Utc::now(),
            status: TransactionStatus::Posted,
            related_transaction_id: None,
            transfer_id: None,
            description,
        })
    }

    /// Post a REVERSAL or ADJUSTMENT against `original`.
    ///
    /// A reversal must mirror the original exactly (opposite direction, same
    /// amount); an adjustment may move either way but never more than the
    /// original amount.
    pub fn compensating(
        transaction_type: TransactionType,
        direction: Direction,
        amount: Money,
        original: &Transaction,
        description: Option<String>,
    ) -> Result<Self, DomainError> {
        if original.status != TransactionStatus::Posted {
            return Err(DomainError::transition(
                "transaction",
                original.status,
                transaction_type,
            ));
        }
        if amount.is_zero() {
            return Err(DomainError::InvalidAmount(format!(
                "{} amount must be positive",
                transaction_type
            )));
        }

        match transaction_type {
            TransactionType::Reversal => {
                if direction != original.direction.opposite() || amount != original.amount {
                    return Err(DomainError::InvalidCommand(format!(
                        "reversal of transaction {} must be {} {}",
                        original.id,
                        original.direction.opposite().as_str(),
                        original.amount.value()
                    )));
                }
            }
            TransactionType::Adjustment => {
                if amount > original.amount {
                    return Err(DomainError::InvalidAmount(format!(
                        "adjustment {} exceeds original amount {}",
                        amount.value(),
                        original.amount.value()
                    )));
                }
            }
            other => {
                return Err(DomainError::InvalidCommand(format!(
                    "{} is not a compensating transaction type",
                    other
                )));
            }
        }

        Ok(Self {
            id: 0,
            account_id: original.account_id,
            transaction_type,
            direction,
            amount,
            value_date: Utc::now().date_naive(),
            posted_at: Utc::now(),
            status: TransactionStatus::Posted,
            related_transaction_id: Some(original.id),
            transfer_id: None,
            description,
        })
    }

    /// Link the transaction to the transfer it belongs to
    pub fn for_transfer(mut self, transfer_id: TransferId) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    /// Signed effect on the balance; VOID contributes nothing
    pub fn balance_impact(&self) -> i64 {
        match self.status {
            TransactionStatus::Posted => self.direction.signed(self.amount),
            TransactionStatus::Void => 0,
        }
    }

    /// POSTED -> VOID, one way
    pub fn void(&mut self) -> Result<(), DomainError> {
        if self.status == TransactionStatus::Void {
            return Err(DomainError::transition("transaction", self.status, TransactionStatus::Void));
        }
        self.status = TransactionStatus::Void;
        Ok(())
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn value_date(&self) -> NaiveDate {
        self.value_date
    }

    pub fn posted_at(&self) -> DateTime<Utc> {
        self.posted_at
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn related_transaction_id(&self) -> Option<TransactionId> {
        self.related_transaction_id
    }

    pub fn transfer_id(&self) -> Option<TransferId> {
        self.transfer_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}
