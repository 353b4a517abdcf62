//! Ledger Events
//!
//! Outbound notifications emitted after a unit of work commits. Downstream
//! consumers (game-side coin grants, notifications) read them from a bounded
//! queue, so a slow consumer can never hold up ledger posting.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Facts published by the ledger core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    /// Both legs of a transfer were committed
    TransferSettled {
        transfer_id: i64,
        source_account_id: i64,
        target_account_id: i64,
        amount: i64,
        settled_at: DateTime<Utc>,
    },

    /// A transfer ended in FAILED
    TransferFailed {
        transfer_id: i64,
        source_account_id: i64,
        reason: String,
        failed_at: DateTime<Utc>,
    },

    /// Interest was accrued (not yet paid) on an account
    InterestAccrued {
        account_id: i64,
        amount: Decimal,
        total_accrued: Decimal,
        as_of: DateTime<Utc>,
    },

    /// Accrued interest was posted to the balance
    InterestPaid {
        account_id: i64,
        transaction_id: i64,
        amount: i64,
        forfeited: Decimal,
        paid_at: DateTime<Utc>,
    },

    /// Account reached CLOSED
    AccountClosed {
        account_id: i64,
        payout_account_id: Option<i64>,
        closed_at: DateTime<Utc>,
    },

    /// Bonus rate ratcheted upwards
    BonusRateRaised {
        account_id: i64,
        previous_bps: u32,
        new_bps: u32,
        raised_at: DateTime<Utc>,
    },

    /// A scheduled auto-transfer settled
    AutoTransferExecuted {
        schedule_id: i64,
        account_id: i64,
        transfer_id: i64,
        next_run_date: NaiveDate,
        executed_at: DateTime<Utc>,
    },
}

impl LedgerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::TransferSettled { .. } => "TransferSettled",
            LedgerEvent::TransferFailed { .. } => "TransferFailed",
            LedgerEvent::InterestAccrued { .. } => "InterestAccrued",
            LedgerEvent::InterestPaid { .. } => "InterestPaid",
            LedgerEvent::AccountClosed { .. } => "AccountClosed",
            LedgerEvent::BonusRateRaised { .. } => "BonusRateRaised",
            LedgerEvent::AutoTransferExecuted { .. } => "AutoTransferExecuted",
        }
    }

    /// Get the account this event is primarily about
    pub fn account_id(&self) -> i64 {
        match self {
            LedgerEvent::TransferSettled { source_account_id, .. } => *source_account_id,
            LedgerEvent::TransferFailed { source_account_id, .. } => *source_account_id,
            LedgerEvent::InterestAccrued { account_id, .. } => *account_id,
            LedgerEvent::InterestPaid { account_id, .. } => *account_id,
            LedgerEvent::AccountClosed { account_id, .. } => *account_id,
            LedgerEvent::BonusRateRaised { account_id, .. } => *account_id,
            LedgerEvent::AutoTransferExecuted { account_id, .. } => *account_id,
        }
    }
}

/// Non-blocking publisher over a bounded channel.
///
/// `publish` never awaits: a full or closed queue drops the event with a
/// warning instead of stalling the caller.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: Option<mpsc::Sender<LedgerEvent>>,
}

impl EventPublisher {
    /// Create a publisher and the receiving end of its queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LedgerEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender: Some(sender) }, receiver)
    }

    /// A publisher that discards everything
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Returns true if the event was queued
    pub fn publish(&self, event: LedgerEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    event_type = event.event_type(),
                    account_id = event.account_id(),
                    "Event queue full, dropping ledger event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(
                    event_type = event.event_type(),
                    account_id = event.account_id(),
                    "Event queue closed, dropping ledger event"
                );
                false
            }
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::disabled()
    }
}
