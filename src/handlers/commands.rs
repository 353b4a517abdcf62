//! Command definitions
//!
//! Commands represent intentions to change the ledger. Request types that
//! arrive over the wire are converted into commands before any handler runs.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregate::{
    AccountId, Direction, ScheduleSettings, TransactionId, Transfer, TransferCycle, TransferId,
    TransferStatus, TransferType,
};
use crate::domain::{DomainError, Money};

// =========================================================================
// CreateAccount
// =========================================================================

/// Unit of a savings term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TermUnit {
    Month,
    Year,
}

/// Auto-transfer settings supplied when a savings account is opened
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoTransferRequest {
    /// Defaults to the maturity withdrawal account
    #[serde(default)]
    pub withdrawal_account_id: Option<AccountId>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cycle: Option<TransferCycle>,
    #[serde(default)]
    pub transfer_day: Option<u32>,
    #[serde(default)]
    pub amount: Option<i64>,
}

/// Wire shape of an account opening request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    pub customer_id: i64,
    pub product_id: i64,
    #[serde(default)]
    pub target_amount: Option<i64>,
    #[serde(default)]
    pub term_value: Option<u32>,
    #[serde(default)]
    pub term_unit: Option<TermUnit>,
    #[serde(default)]
    pub maturity_withdrawal_account: Option<AccountId>,
    #[serde(default)]
    pub auto_transfer: Option<AutoTransferRequest>,
}

/// Schedule to create together with a savings account
#[derive(Debug, Clone, PartialEq)]
pub struct AutoTransferSetup {
    pub withdrawal_account_id: AccountId,
    pub settings: ScheduleSettings,
}

/// Command to open an account
#[derive(Debug, Clone, PartialEq)]
pub enum CreateAccountCommand {
    DemandDeposit {
        customer_id: i64,
        product_id: i64,
    },
    Savings {
        customer_id: i64,
        product_id: i64,
        goal_amount: Money,
        term_months: u32,
        payout_account_id: Option<AccountId>,
        auto_transfer: Option<AutoTransferSetup>,
    },
}

impl CreateAccountCommand {
    /// Pick the variant from the populated fields.
    ///
    /// No savings field at all opens a demand deposit account; a goal, term
    /// value and term unit together open a savings account. Anything in
    /// between is rejected.
    pub fn from_request(request: CreateAccountRequest) -> Result<Self, DomainError> {
        if request.customer_id <= 0 || request.product_id <= 0 {
            return Err(DomainError::InvalidCommand(
                "customer and product ids must be positive".to_string(),
            ));
        }

        let any_savings_field = request.target_amount.is_some()
            || request.term_value.is_some()
            || request.term_unit.is_some()
            || request.maturity_withdrawal_account.is_some()
            || request.auto_transfer.is_some();

        if !any_savings_field {
            return Ok(Self::DemandDeposit {
                customer_id: request.customer_id,
                product_id: request.product_id,
            });
        }

        let (target, term_value, term_unit) =
            match (request.target_amount, request.term_value, request.term_unit) {
                (Some(t), Some(v), Some(u)) => (t, v, u),
                _ => {
                    return Err(DomainError::InvalidCommand(
                        "savings account requires target amount, term value and term unit".to_string(),
                    ))
                }
            };

        let goal_amount = Money::positive(target)?;
        let term_months = match term_unit {
            TermUnit::Month => Some(term_value),
            TermUnit::Year => term_value.checked_mul(12),
        }
        .filter(|m| *m > 0)
        .ok_or_else(|| DomainError::InvalidCommand(format!("invalid savings term {}", term_value)))?;

        let auto_transfer = match request.auto_transfer {
            None => None,
            Some(auto) => {
                let withdrawal_account_id = auto
                    .withdrawal_account_id
                    .or(request.maturity_withdrawal_account)
                    .ok_or_else(|| {
                        DomainError::InvalidCommand(
                            "auto-transfer requires a withdrawal account".to_string(),
                        )
                    })?;
                Some(AutoTransferSetup {
                    withdrawal_account_id,
                    settings: ScheduleSettings {
                        enabled: auto.enabled,
                        cycle: auto.cycle,
                        transfer_day: auto.transfer_day,
                        amount: auto.amount.map(Money::positive).transpose()?,
                    },
                })
            }
        };

        Ok(Self::Savings {
            customer_id: request.customer_id,
            product_id: request.product_id,
            goal_amount,
            term_months,
            payout_account_id: request.maturity_withdrawal_account,
            auto_transfer,
        })
    }

    pub fn customer_id(&self) -> i64 {
        match self {
            Self::DemandDeposit { customer_id, .. } | Self::Savings { customer_id, .. } => *customer_id,
        }
    }

    pub fn product_id(&self) -> i64 {
        match self {
            Self::DemandDeposit { product_id, .. } | Self::Savings { product_id, .. } => *product_id,
        }
    }
}

// =========================================================================
// Balance commands
// =========================================================================

/// Command to credit cash to an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositCommand {
    pub account_id: AccountId,
    pub amount: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl DepositCommand {
    pub fn new(account_id: AccountId, amount: i64) -> Self {
        Self {
            account_id,
            amount,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Command to debit cash from an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawCommand {
    pub account_id: AccountId,
    pub amount: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl WithdrawCommand {
    pub fn new(account_id: AccountId, amount: i64) -> Self {
        Self {
            account_id,
            amount,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// =========================================================================
// Transfer
// =========================================================================

/// Command to move money between two accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCommand {
    pub source_account_id: AccountId,
    pub target_account_id: AccountId,
    pub amount: i64,
    /// Defaults to today
    #[serde(default)]
    pub value_date: Option<NaiveDate>,
    #[serde(default = "default_transfer_type")]
    pub transfer_type: TransferType,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
}

fn default_transfer_type() -> TransferType {
    TransferType::Internal
}

impl TransferCommand {
    pub fn new(source_account_id: AccountId, target_account_id: AccountId, amount: i64) -> Self {
        Self {
            source_account_id,
            target_account_id,
            amount,
            value_date: None,
            transfer_type: TransferType::Internal,
            idempotency_key: None,
            memo: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_value_date(mut self, value_date: NaiveDate) -> Self {
        self.value_date = Some(value_date);
        self
    }

    pub fn with_transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }
}

/// Snapshot of a transfer returned to callers. A replayed request gets the
/// same snapshot back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: TransferId,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub source_account_id: AccountId,
    pub target_account_id: AccountId,
    pub amount: i64,
    pub value_date: NaiveDate,
    pub idempotency_key: Option<String>,
    pub debit_transaction_id: Option<TransactionId>,
    pub credit_transaction_id: Option<TransactionId>,
    pub failure_reason: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl From<&Transfer> for TransferResult {
    fn from(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id(),
            transfer_type: transfer.transfer_type(),
            status: transfer.status(),
            source_account_id: transfer.source_account_id(),
            target_account_id: transfer.target_account_id(),
            amount: transfer.amount().value(),
            value_date: transfer.value_date(),
            idempotency_key: transfer.idempotency_key().map(str::to_string),
            debit_transaction_id: transfer
                .entry(Direction::Debit)
                .and_then(|e| e.transaction_id()),
            credit_transaction_id: transfer
                .entry(Direction::Credit)
                .and_then(|e| e.transaction_id()),
            failure_reason: transfer.failure_reason().map(str::to_string),
            settled_at: transfer.settled_at(),
        }
    }
}

// =========================================================================
// Account maintenance
// =========================================================================

/// Command to raise the bonus rate; lower or equal rates are ignored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBonusRateCommand {
    pub account_id: AccountId,
    pub new_rate_percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeAccountCommand {
    pub account_id: AccountId,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Command to close an account and pay out what it holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseAccountCommand {
    pub account_id: AccountId,
    /// Overrides the payout account stored on the account
    #[serde(default)]
    pub payout_account_id: Option<AccountId>,
}

impl CloseAccountCommand {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            payout_account_id: None,
        }
    }

    pub fn with_payout_account(mut self, payout_account_id: AccountId) -> Self {
        self.payout_account_id = Some(payout_account_id);
        self
    }
}

/// What closing an account did
#[derive(Debug, Clone, Serialize)]
pub struct CloseAccountResult {
    pub account: crate::aggregate::Account,
    pub interest_paid: i64,
    pub interest_forfeited: Decimal,
    pub interest_transaction_id: Option<TransactionId>,
    pub payout_transfer_id: Option<TransferId>,
}

// =========================================================================
// Corrections
// =========================================================================

/// Command to post a REVERSAL mirroring a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseTransactionCommand {
    pub transaction_id: TransactionId,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Command to post an ADJUSTMENT against a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustTransactionCommand {
    pub transaction_id: TransactionId,
    pub direction: Direction,
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Command to void a mis-posted transaction outright
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidTransactionCommand {
    pub transaction_id: TransactionId,
}

// =========================================================================
// Auto-transfer schedule
// =========================================================================

/// Command to create or change the auto-transfer of a savings account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAutoTransferScheduleCommand {
    pub account_id: AccountId,
    pub enabled: bool,
    #[serde(default)]
    pub cycle: Option<TransferCycle>,
    #[serde(default)]
    pub transfer_day: Option<u32>,
    #[serde(default)]
    pub amount: Option<i64>,
    /// Required when the account has no schedule yet
    #[serde(default)]
    pub withdrawal_account_id: Option<AccountId>,
}

impl UpdateAutoTransferScheduleCommand {
    pub fn settings(&self) -> Result<ScheduleSettings, DomainError> {
        Ok(ScheduleSettings {
            enabled: self.enabled,
            cycle: self.cycle,
            transfer_day: self.transfer_day,
            amount: self.amount.map(Money::positive).transpose()?,
        })
    }
}

/// One page of an account's transaction history
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub account_id: AccountId,
    pub page: u32,
    pub size: u32,
    pub items: Vec<crate::aggregate::Transaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateAccountRequest {
        CreateAccountRequest {
            customer_id: 17,
            product_id: 2,
            ..CreateAccountRequest::default()
        }
    }

    #[test]
    fn test_demand_deposit_without_savings_fields() {
        let command = CreateAccountCommand::from_request(request()).unwrap();
        assert_eq!(
            command,
            CreateAccountCommand::DemandDeposit {
                customer_id: 17,
                product_id: 2
            }
        );
    }

    #[test]
    fn test_savings_with_years_term() {
        let command = CreateAccountCommand::from_request(CreateAccountRequest {
            target_amount: Some(1_200_000),
            term_value: Some(2),
            term_unit: Some(TermUnit::Year),
            maturity_withdrawal_account: Some(5),
            ..request()
        })
        .unwrap();

        match command {
            CreateAccountCommand::Savings {
                goal_amount,
                term_months,
                payout_account_id,
                auto_transfer,
                ..
            } => {
                assert_eq!(goal_amount.value(), 1_200_000);
                assert_eq!(term_months, 24);
                assert_eq!(payout_account_id, Some(5));
                assert!(auto_transfer.is_none());
            }
            other => panic!("expected savings, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_savings_fields_rejected() {
        let result = CreateAccountCommand::from_request(CreateAccountRequest {
            target_amount: Some(1_000_000),
            ..request()
        });
        assert!(matches!(result, Err(DomainError::InvalidCommand(_))));

        let result = CreateAccountCommand::from_request(CreateAccountRequest {
            maturity_withdrawal_account: Some(5),
            ..request()
        });
        assert!(matches!(result, Err(DomainError::InvalidCommand(_))));
    }

    #[test]
    fn test_auto_transfer_defaults_to_maturity_account() {
        let command = CreateAccountCommand::from_request(CreateAccountRequest {
            target_amount: Some(1_000_000),
            term_value: Some(12),
            term_unit: Some(TermUnit::Month),
            maturity_withdrawal_account: Some(5),
            auto_transfer: Some(AutoTransferRequest {
                enabled: true,
                cycle: Some(TransferCycle::Monthly),
                transfer_day: Some(25),
                amount: Some(100_000),
                ..AutoTransferRequest::default()
            }),
            ..request()
        })
        .unwrap();

        let CreateAccountCommand::Savings { auto_transfer, .. } = command else {
            panic!("expected savings");
        };
        let setup = auto_transfer.unwrap();
        assert_eq!(setup.withdrawal_account_id, 5);
        assert!(setup.settings.enabled);
        assert_eq!(setup.settings.amount.map(|a| a.value()), Some(100_000));
    }

    #[test]
    fn test_auto_transfer_needs_withdrawal_account() {
        let result = CreateAccountCommand::from_request(CreateAccountRequest {
            target_amount: Some(1_000_000),
            term_value: Some(12),
            term_unit: Some(TermUnit::Month),
            auto_transfer: Some(AutoTransferRequest::default()),
            ..request()
        });
        assert!(matches!(result, Err(DomainError::InvalidCommand(_))));
    }

    #[test]
    fn test_transfer_command_builders() {
        let command = TransferCommand::new(100, 200, 1000)
            .with_idempotency_key("tx-1")
            .with_memo("rent");

        assert_eq!(command.transfer_type, TransferType::Internal);
        assert_eq!(command.idempotency_key.as_deref(), Some("tx-1"));
        assert_eq!(command.memo.as_deref(), Some("rent"));
        assert!(command.value_date.is_none());
    }

    #[test]
    fn test_transfer_command_deserialize_defaults() {
        let json = r#"{"source_account_id": 1, "target_account_id": 2, "amount": 500}"#;
        let command: TransferCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command.transfer_type, TransferType::Internal);
        assert!(command.idempotency_key.is_none());
    }
}
