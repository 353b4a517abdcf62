//! Auto-transfer schedule
//!
//! Periodic debit from a withdrawal account into a savings account.
//! Disabled schedules keep their cycle, day and amount so they can be
//! re-enabled later without re-entering them.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{DomainError, Money};

use super::{AccountId, ScheduleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferCycle {
    Weekly,
    Monthly,
}

impl TransferCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferCycle::Weekly => "WEEKLY",
            TransferCycle::Monthly => "MONTHLY",
        }
    }

    /// Valid `transfer_day` values: ISO weekday for weekly, day of month for monthly
    pub fn day_range(&self) -> std::ops::RangeInclusive<u32> {
        match self {
            TransferCycle::Weekly => 1..=7,
            TransferCycle::Monthly => 1..=31,
        }
    }
}

impl FromStr for TransferCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WEEKLY" => Ok(TransferCycle::Weekly),
            "MONTHLY" => Ok(TransferCycle::Monthly),
            other => Err(format!("unknown transfer cycle: {}", other)),
        }
    }
}

/// Requested schedule settings. Missing fields fall back to the values the
/// schedule already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub cycle: Option<TransferCycle>,
    pub transfer_day: Option<u32>,
    pub amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTransferSchedule {
    pub(crate) id: ScheduleId,
    /// Savings account receiving the money
    pub(crate) account_id: AccountId,
    /// Account debited on every run
    pub(crate) withdrawal_account_id: AccountId,
    pub(crate) cycle: Option<TransferCycle>,
    pub(crate) transfer_day: Option<u32>,
    pub(crate) amount: Option<Money>,
    pub(crate) enabled: bool,
    pub(crate) next_run_date: Option<NaiveDate>,
    pub(crate) last_executed_at: Option<DateTime<Utc>>,
    pub(crate) failed_attempts: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl AutoTransferSchedule {
    pub fn new(
        account_id: AccountId,
        withdrawal_account_id: AccountId,
        settings: ScheduleSettings,
        today: NaiveDate,
    ) -> Result<Self, DomainError> {
        if account_id == withdrawal_account_id {
            return Err(DomainError::SameAccountTransfer);
        }

        let now = Utc::now();
        let mut schedule = Self {
            id: 0,
            account_id,
            withdrawal_account_id,
            cycle: None,
            transfer_day: None,
            amount: None,
            enabled: false,
            next_run_date: None,
            last_executed_at: None,
            failed_attempts: 0,
            created_at: now,
            updated_at: now,
        };
        schedule.update(settings, today)?;
        Ok(schedule)
    }

    /// Apply new settings.
    ///
    /// The next run date is recomputed when the schedule is (re-)enabled or
    /// its cycle/day changes; an amount-only change keeps the pending date.
    pub fn update(&mut self, settings: ScheduleSettings, today: NaiveDate) -> Result<(), DomainError> {
        let cycle = settings.cycle.or(self.cycle);
        let transfer_day = settings.transfer_day.or(self.transfer_day);
        let amount = settings.amount.or(self.amount);

        if !settings.enabled {
            self.cycle = cycle;
            self.transfer_day = transfer_day;
            self.amount = amount;
            self.enabled = false;
            self.next_run_date = None;
            self.updated_at = Utc::now();
            return Ok(());
        }

        let (cycle, transfer_day, amount) = match (cycle, transfer_day, amount) {
            (Some(c), Some(d), Some(a)) => (c, d, a),
            _ => {
                return Err(DomainError::InvalidCommand(
                    "enabled schedule requires cycle, transfer day and amount".to_string(),
                ))
            }
        };
        if !cycle.day_range().contains(&transfer_day) {
            return Err(DomainError::InvalidCommand(format!(
                "transfer day {} out of range for {} cycle",
                transfer_day,
                cycle.as_str()
            )));
        }
        if amount.is_zero() {
            return Err(DomainError::InvalidAmount("auto-transfer amount must be positive".to_string()));
        }

        let timing_changed = self.cycle != Some(cycle) || self.transfer_day != Some(transfer_day);
        if !self.enabled || timing_changed || self.next_run_date.is_none() {
            self.next_run_date = Some(first_run_date(cycle, transfer_day, today).ok_or_else(out_of_range)?);
            self.failed_attempts = 0;
        }

        self.cycle = Some(cycle);
        self.transfer_day = Some(transfer_day);
        self.amount = Some(amount);
        self.enabled = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_due(&self, reference: NaiveDate) -> bool {
        self.enabled && self.next_run_date.map_or(false, |d| d <= reference)
    }

    /// Idempotency key for the current attempt of the pending run.
    ///
    /// A failed attempt bumps `failed_attempts`, so the retry gets a new key
    /// while a crash-and-replay of the same attempt reuses the old one.
    pub fn attempt_key(&self) -> Option<String> {
        self.next_run_date
            .map(|date| format!("auto:{}:{}:{}", self.id, date, self.failed_attempts))
    }

    /// Record a successful run and move `next_run_date` past `reference`
    pub fn mark_executed(
        &mut self,
        executed_at: DateTime<Utc>,
        reference: NaiveDate,
    ) -> Result<NaiveDate, DomainError> {
        let (cycle, transfer_day, current) = match (self.cycle, self.transfer_day, self.next_run_date) {
            (Some(c), Some(d), Some(n)) if self.enabled => (c, d, n),
            _ => {
                return Err(DomainError::InvalidCommand(format!(
                    "schedule {} is not enabled",
                    self.id
                )))
            }
        };

        let mut next = advance_run_date(cycle, transfer_day, current).ok_or_else(out_of_range)?;
        while next <= reference {
            next = advance_run_date(cycle, transfer_day, next).ok_or_else(out_of_range)?;
        }

        self.next_run_date = Some(next);
        self.last_executed_at = Some(executed_at);
        self.failed_attempts = 0;
        self.updated_at = executed_at;
        Ok(next)
    }

    /// Keep `next_run_date` so the next poll retries the same run
    pub fn record_failure(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.updated_at = Utc::now();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.next_run_date = None;
        self.updated_at = Utc::now();
    }

    pub fn id(&self) -> ScheduleId {
        self.id
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn withdrawal_account_id(&self) -> AccountId {
        self.withdrawal_account_id
    }

    pub fn cycle(&self) -> Option<TransferCycle> {
        self.cycle
    }

    pub fn transfer_day(&self) -> Option<u32> {
        self.transfer_day
    }

    pub fn amount(&self) -> Option<Money> {
        self.amount
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn next_run_date(&self) -> Option<NaiveDate> {
        self.next_run_date
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.last_executed_at
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

fn out_of_range() -> DomainError {
    DomainError::InvalidCommand("schedule date out of range".to_string())
}

/// First run strictly after `today`
pub fn first_run_date(cycle: TransferCycle, transfer_day: u32, today: NaiveDate) -> Option<NaiveDate> {
    match cycle {
        TransferCycle::Weekly => {
            let current = today.weekday().number_from_monday();
            let mut ahead = (transfer_day + 7 - current) % 7;
            if ahead == 0 {
                ahead = 7;
            }
            today.checked_add_signed(Duration::days(i64::from(ahead)))
        }
        TransferCycle::Monthly => {
            let this_month = clamped_date(today.year(), today.month(), transfer_day)?;
            if this_month > today {
                Some(this_month)
            } else {
                advance_run_date(cycle, transfer_day, today)
            }
        }
    }
}

/// One cycle after `from`: a week later, or `transfer_day` of the next month
pub fn advance_run_date(cycle: TransferCycle, transfer_day: u32, from: NaiveDate) -> Option<NaiveDate> {
    match cycle {
        TransferCycle::Weekly => from.checked_add_signed(Duration::days(7)),
        TransferCycle::Monthly => {
            let (year, month) = if from.month() == 12 {
                (from.year() + 1, 1)
            } else {
                (from.year(), from.month() + 1)
            };
            clamped_date(year, month, transfer_day)
        }
    }
}

/// `day` in the given month, clamped to the month's last day
fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)))
}

/// Get the number of days in a month
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |last| last.day())
}
