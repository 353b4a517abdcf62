//! Account Aggregate
//!
//! Account is the core aggregate for balances, status and interest settings.
//! Every mutation checks the current status first; nothing leaves CLOSED.

use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::{BasisPoints, DomainError, Money};
use crate::interest;

use super::AccountId;

/// Longest account number accepted
pub const MAX_ACCOUNT_NUMBER_LEN: usize = 32;

/// Account status
///
/// ACTIVE ⇄ FROZEN, and either of them → CLOSED (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Frozen => "FROZEN",
            AccountStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AccountStatus::Active),
            "FROZEN" => Ok(AccountStatus::Frozen),
            "CLOSED" => Ok(AccountStatus::Closed),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// Interest compounding schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompoundingType {
    Simple,
    Daily,
    Month,
    Year,
}

impl CompoundingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompoundingType::Simple => "SIMPLE",
            CompoundingType::Daily => "DAILY",
            CompoundingType::Month => "MONTH",
            CompoundingType::Year => "YEAR",
        }
    }
}

impl FromStr for CompoundingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIMPLE" => Ok(CompoundingType::Simple),
            "DAILY" => Ok(CompoundingType::Daily),
            "MONTH" => Ok(CompoundingType::Month),
            "YEAR" => Ok(CompoundingType::Year),
            other => Err(format!("unknown compounding type: {}", other)),
        }
    }
}

/// Demand-deposit (checking) or savings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountKind {
    DemandDeposit,
    Savings,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::DemandDeposit => "DEMAND_DEPOSIT",
            AccountKind::Savings => "SAVINGS",
        }
    }
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEMAND_DEPOSIT" => Ok(AccountKind::DemandDeposit),
            "SAVINGS" => Ok(AccountKind::Savings),
            other => Err(format!("unknown account kind: {}", other)),
        }
    }
}

/// Savings-only settings, all required together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavingsTerms {
    pub goal_amount: Money,
    pub term_months: u32,
    pub payout_account_id: Option<AccountId>,
}

/// Everything needed to open an account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub account_number: String,
    pub customer_id: i64,
    pub product_id: i64,
    pub compounding_type: CompoundingType,
    pub base_rate: BasisPoints,
    pub savings: Option<SavingsTerms>,
}

/// Account Aggregate
///
/// An `id` of 0 marks an account that has not been persisted yet; the store
/// assigns the identity on first save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub(crate) id: AccountId,
    pub(crate) account_number: String,
    pub(crate) customer_id: i64,
    pub(crate) product_id: i64,
    pub(crate) kind: AccountKind,
    pub(crate) compounding_type: CompoundingType,
    pub(crate) status: AccountStatus,
    pub(crate) balance: Money,
    pub(crate) base_rate: BasisPoints,
    pub(crate) bonus_rate: BasisPoints,
    pub(crate) interest_accrued: Decimal,
    pub(crate) goal_amount: Option<Money>,
    pub(crate) term_months: Option<u32>,
    pub(crate) maturity_date: Option<NaiveDate>,
    pub(crate) payout_account_id: Option<AccountId>,
    pub(crate) opened_at: DateTime<Utc>,
    pub(crate) closed_at: Option<DateTime<Utc>>,
    pub(crate) last_accrual_ts: DateTime<Utc>,
    pub(crate) last_rate_change_at: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Account {
    /// Open a new account. Savings accounts need a goal and a term; demand
    /// deposit accounts carry neither.
    pub fn open(new: NewAccount, now: DateTime<Utc>) -> Result<Self, DomainError> {
        validate_account_number(&new.account_number)?;

        let (kind, goal_amount, term_months, maturity_date, payout_account_id) = match new.savings {
            None => (AccountKind::DemandDeposit, None, None, None, None),
            Some(terms) => {
                if terms.goal_amount.is_zero() {
                    return Err(DomainError::InvalidAmount(
                        "savings goal must be positive".to_string(),
                    ));
                }
                if terms.term_months == 0 {
                    return Err(DomainError::InvalidCommand(
                        "savings term must be at least one month".to_string(),
                    ));
                }
                let maturity = now
                    .date_naive()
                    .checked_add_months(Months::new(terms.term_months))
                    .ok_or_else(|| DomainError::InvalidCommand("savings term too long".to_string()))?;
                (
                    AccountKind::Savings,
                    Some(terms.goal_amount),
                    Some(terms.term_months),
                    Some(maturity),
                    terms.payout_account_id,
                )
            }
        };

        Ok(Self {
            id: 0,
            account_number: new.account_number,
            customer_id: new.customer_id,
            product_id: new.product_id,
            kind,
            compounding_type: new.compounding_type,
            status: AccountStatus::Active,
            balance: Money::ZERO,
            base_rate: new.base_rate,
            bonus_rate: BasisPoints::ZERO,
            interest_accrued: Decimal::ZERO,
            goal_amount,
            term_months,
            maturity_date,
            payout_account_id,
            opened_at: now,
            closed_at: None,
            last_accrual_ts: now,
            last_rate_change_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Require ACTIVE for balance-changing operations
    pub fn ensure_active(&self, operation: &str) -> Result<(), DomainError> {
        if self.status != AccountStatus::Active {
            return Err(DomainError::InvalidAccountState(format!(
                "cannot {} account {} in status {}",
                operation, self.account_number, self.status
            )));
        }
        Ok(())
    }

    fn ensure_open(&self, operation: &str) -> Result<(), DomainError> {
        if self.status == AccountStatus::Closed {
            return Err(DomainError::InvalidAccountState(format!(
                "cannot {} closed account {}",
                operation, self.account_number
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Balance
    // =========================================================================

    /// Credit money to the account
    pub fn deposit(&mut self, amount: Money) -> Result<(), DomainError> {
        self.ensure_active("deposit to")?;
        if amount.is_zero() {
            return Err(DomainError::InvalidAmount("deposit must be positive".to_string()));
        }

        self.balance = self.balance.checked_add(amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Debit money from the account; never drives the balance negative
    pub fn withdraw(&mut self, amount: Money) -> Result<(), DomainError> {
        self.ensure_active("withdraw from")?;
        if amount.is_zero() {
            return Err(DomainError::InvalidAmount("withdrawal must be positive".to_string()));
        }

        let remaining = self.balance.checked_sub(amount).ok_or_else(|| {
            DomainError::insufficient_balance(
                self.account_number.clone(),
                amount.value(),
                self.balance.value(),
            )
        })?;

        self.balance = remaining;
        self.updated_at = Utc::now();
        Ok(())
    }

    // =========================================================================
    // Rates
    // =========================================================================

    /// Ratchet the bonus rate upwards.
    ///
    /// Returns `Ok(false)` without touching the account when `new_rate` is not
    /// strictly higher than the current bonus rate.
    pub fn update_bonus_rate(&mut self, new_rate: BasisPoints) -> Result<bool, DomainError> {
        self.ensure_open("change rate of")?;

        if new_rate <= self.bonus_rate {
            return Ok(false);
        }

        let now = Utc::now();
        self.bonus_rate = new_rate;
        self.last_rate_change_at = Some(now);
        self.updated_at = now;
        Ok(true)
    }

    /// Base plus bonus rate
    pub fn total_rate(&self) -> Decimal {
        self.base_rate.as_fraction() + self.bonus_rate.as_fraction()
    }

    // =========================================================================
    // Interest
    // =========================================================================

    /// Accrue interest for the whole periods up to `as_of` and return the
    /// increment. The watermark stops at the end of the last whole period,
    /// so a partial day is carried into the next accrual rather than lost.
    pub fn accrue(&mut self, as_of: DateTime<Utc>) -> Result<Decimal, DomainError> {
        self.ensure_open("accrue interest on")?;

        let input = interest::AccrualInput {
            principal: self.balance,
            current_accrued: self.interest_accrued,
            base_rate: self.base_rate,
            bonus_rate: self.bonus_rate,
            compounding_type: self.compounding_type,
            last_accrual_ts: self.last_accrual_ts,
            as_of,
        };
        let additional = interest::compute_accrual(&input);
        let accrued_until = interest::accrued_until(&input);

        if accrued_until > self.last_accrual_ts {
            self.interest_accrued += additional;
            self.last_accrual_ts = accrued_until;
            self.updated_at = as_of;
        }
        Ok(additional)
    }

    /// Take the payable (whole won) part of the accrued interest.
    ///
    /// Returns the payable amount and the sub-won remainder; the accrued
    /// balance is reset to zero.
    pub fn take_accrued_interest(&mut self) -> Result<(Money, Decimal), DomainError> {
        self.ensure_open("pay interest on")?;

        let whole = self.interest_accrued.trunc();
        let remainder = self.interest_accrued - whole;
        let payable = whole
            .to_i64()
            .ok_or_else(|| DomainError::InvalidAmount(format!("accrued interest {} out of range", whole)))?;
        let payable = Money::new(payable)?;

        self.interest_accrued = Decimal::ZERO;
        self.updated_at = Utc::now();
        Ok((payable, remainder))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Freeze the account
    pub fn freeze(&mut self) -> Result<(), DomainError> {
        if self.status != AccountStatus::Active {
            return Err(DomainError::transition("account", self.status, AccountStatus::Frozen));
        }
        self.status = AccountStatus::Frozen;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Unfreeze the account
    pub fn unfreeze(&mut self) -> Result<(), DomainError> {
        if self.status != AccountStatus::Frozen {
            return Err(DomainError::transition("account", self.status, AccountStatus::Active));
        }
        self.status = AccountStatus::Active;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Close the account; terminal
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status == AccountStatus::Closed {
            return Err(DomainError::transition("account", self.status, AccountStatus::Closed));
        }
        self.status = AccountStatus::Closed;
        self.closed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    // =========================================================================
    // Getters
    // =========================================================================

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn account_number(&self) -> &str {
        &self.account_number
    }

    pub fn customer_id(&self) -> i64 {
        self.customer_id
    }

    pub fn product_id(&self) -> i64 {
        self.product_id
    }

    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    pub fn is_savings(&self) -> bool {
        self.kind == AccountKind::Savings
    }

    pub fn compounding_type(&self) -> CompoundingType {
        self.compounding_type
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    pub fn base_rate(&self) -> BasisPoints {
        self.base_rate
    }

    pub fn bonus_rate(&self) -> BasisPoints {
        self.bonus_rate
    }

    pub fn interest_accrued(&self) -> Decimal {
        self.interest_accrued
    }

    pub fn goal_amount(&self) -> Option<Money> {
        self.goal_amount
    }

    pub fn term_months(&self) -> Option<u32> {
        self.term_months
    }

    pub fn maturity_date(&self) -> Option<NaiveDate> {
        self.maturity_date
    }

    pub fn payout_account_id(&self) -> Option<AccountId> {
        self.payout_account_id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn last_accrual_ts(&self) -> DateTime<Utc> {
        self.last_accrual_ts
    }

    pub fn last_rate_change_at(&self) -> Option<DateTime<Utc>> {
        self.last_rate_change_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Digits only, 1..=32 characters
pub fn validate_account_number(number: &str) -> Result<(), DomainError> {
    if number.is_empty()
        || number.len() > MAX_ACCOUNT_NUMBER_LEN
        || !number.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(DomainError::InvalidCommand(format!(
            "account number must be 1-{} digits: {:?}",
            MAX_ACCOUNT_NUMBER_LEN, number
        )));
    }
    Ok(())
}
