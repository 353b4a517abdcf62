//! API Routes
//!
//! HTTP endpoint definitions. Bodies are converted into handler commands;
//! the handlers do all validation.

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::aggregate::{Account, AccountId, AutoTransferSchedule, Direction, Transaction, TransactionId, TransferCycle, TransferId};
use crate::domain::OperationContext;
use crate::error::AppError;
use crate::handlers::{
    AdjustTransactionCommand, CloseAccountCommand, CloseAccountResult, CreateAccountCommand,
    CreateAccountRequest, DepositCommand, FreezeAccountCommand, ReverseTransactionCommand,
    TransactionPage, TransferCommand, TransferResult, UpdateAutoTransferScheduleCommand,
    UpdateBonusRateCommand, VoidTransactionCommand, WithdrawCommand,
};

use super::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// =========================================================================
// Request types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: i64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BonusRateRequest {
    /// Percent, e.g. `1.5` for 150bps
    pub rate_percent: Decimal,
}

#[derive(Debug, Default, Deserialize)]
pub struct FreezeRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseRequest {
    #[serde(default)]
    pub payout_account_id: Option<AccountId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReverseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub direction: Direction,
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub enabled: bool,
    #[serde(default)]
    pub cycle: Option<TransferCycle>,
    #[serde(default)]
    pub transfer_day: Option<u32>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub withdrawal_account_id: Option<AccountId>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    20
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        // Accounts
        .route("/accounts", post(create_account))
        .route("/accounts/:account_id", get(get_account).delete(discard_account))
        .route("/accounts/by-number/:account_number", get(get_account_by_number))
        .route("/customers/:customer_id/accounts", get(list_customer_accounts))
        .route("/accounts/:account_id/deposit", post(deposit))
        .route("/accounts/:account_id/withdraw", post(withdraw))
        .route("/accounts/:account_id/bonus-rate", put(update_bonus_rate))
        .route("/accounts/:account_id/freeze", post(freeze_account))
        .route("/accounts/:account_id/unfreeze", post(unfreeze_account))
        .route("/accounts/:account_id/close", post(close_account))
        .route("/accounts/:account_id/transactions", get(account_history))
        // Auto-transfer
        .route(
            "/accounts/:account_id/auto-transfer",
            get(get_auto_transfer).put(update_auto_transfer),
        )
        // Transfers
        .route("/transfers", post(transfer))
        .route("/transfers/:transfer_id", get(get_transfer))
        .route("/transfers/:transfer_id/cancel", post(cancel_transfer))
        // Corrections
        .route("/transactions/:transaction_id/reverse", post(reverse_transaction))
        .route("/transactions/:transaction_id/adjust", post(adjust_transaction))
        .route("/transactions/:transaction_id/void", post(void_transaction))
}

// =========================================================================
// Accounts
// =========================================================================

/// Open an account; savings fields select a savings account
async fn create_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    let command = CreateAccountCommand::from_request(request)?;
    let account = state.accounts.create(command, &context).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<Account>, AppError> {
    Ok(Json(state.accounts.get(account_id).await?))
}

async fn get_account_by_number(
    State(state): State<AppState>,
    Path(account_number): Path<String>,
) -> Result<Json<Account>, AppError> {
    Ok(Json(state.accounts.get_by_number(&account_number).await?))
}

async fn list_customer_accounts(
    State(state): State<AppState>,
    Path(customer_id): Path<i64>,
) -> Result<Json<Vec<Account>>, AppError> {
    Ok(Json(state.accounts.list_by_customer(customer_id).await?))
}

/// Delete an account that never held money
async fn discard_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
) -> Result<StatusCode, AppError> {
    state.accounts.discard(account_id, &context).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deposit(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    Json(request): Json<AmountRequest>,
) -> Result<Json<Account>, AppError> {
    let mut command = DepositCommand::new(account_id, request.amount);
    if let Some(description) = request.description {
        command = command.with_description(description);
    }
    Ok(Json(state.accounts.deposit(command, &context).await?))
}

async fn withdraw(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    Json(request): Json<AmountRequest>,
) -> Result<Json<Account>, AppError> {
    let mut command = WithdrawCommand::new(account_id, request.amount);
    if let Some(description) = request.description {
        command = command.with_description(description);
    }
    Ok(Json(state.accounts.withdraw(command, &context).await?))
}

/// Raise the bonus rate; a lower rate leaves the account unchanged
async fn update_bonus_rate(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    Json(request): Json<BonusRateRequest>,
) -> Result<Json<Account>, AppError> {
    let command = UpdateBonusRateCommand {
        account_id,
        new_rate_percent: request.rate_percent,
    };
    Ok(Json(state.accounts.update_bonus_rate(command, &context).await?))
}

async fn freeze_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    request: Option<Json<FreezeRequest>>,
) -> Result<Json<Account>, AppError> {
    let Json(request) = request.unwrap_or_default();
    let command = FreezeAccountCommand {
        account_id,
        reason: request.reason,
    };
    Ok(Json(state.accounts.freeze(command, &context).await?))
}

async fn unfreeze_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<Account>, AppError> {
    Ok(Json(state.accounts.unfreeze(account_id, &context).await?))
}

async fn close_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    request: Option<Json<CloseRequest>>,
) -> Result<Json<CloseAccountResult>, AppError> {
    let Json(request) = request.unwrap_or_default();
    let mut command = CloseAccountCommand::new(account_id);
    if let Some(payout_account_id) = request.payout_account_id {
        command = command.with_payout_account(payout_account_id);
    }
    Ok(Json(state.accounts.close(command, &context).await?))
}

/// Newest-first page of postings
async fn account_history(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<TransactionPage>, AppError> {
    Ok(Json(state.accounts.history(account_id, query.page, query.size).await?))
}

// =========================================================================
// Auto-transfer
// =========================================================================

async fn get_auto_transfer(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<AutoTransferSchedule>, AppError> {
    Ok(Json(state.schedules.get(account_id).await?))
}

async fn update_auto_transfer(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<AutoTransferSchedule>, AppError> {
    let command = UpdateAutoTransferScheduleCommand {
        account_id,
        enabled: request.enabled,
        cycle: request.cycle,
        transfer_day: request.transfer_day,
        amount: request.amount,
        withdrawal_account_id: request.withdrawal_account_id,
    };
    Ok(Json(state.schedules.update(command, &context).await?))
}

// =========================================================================
// Transfers
// =========================================================================

/// Move money between accounts.
///
/// The `Idempotency-Key` header takes precedence over a key in the body.
async fn transfer(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(command): Json<TransferCommand>,
) -> Result<Json<TransferResult>, AppError> {
    let command = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => {
            let key = value
                .to_str()
                .map_err(|_| AppError::InvalidRequest("Idempotency-Key must be ASCII".to_string()))?;
            command.with_idempotency_key(key)
        }
        None => command,
    };

    Ok(Json(state.transfers.execute(command, &context).await?))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<TransferId>,
) -> Result<Json<TransferResult>, AppError> {
    Ok(Json(state.transfers.get(transfer_id).await?))
}

/// Void a transfer that has not started posting
async fn cancel_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<TransferId>,
) -> Result<Json<TransferResult>, AppError> {
    Ok(Json(state.transfers.cancel(transfer_id).await?))
}

// =========================================================================
// Corrections
// =========================================================================

async fn reverse_transaction(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(transaction_id): Path<TransactionId>,
    request: Option<Json<ReverseRequest>>,
) -> Result<(StatusCode, Json<Transaction>), AppError> {
    let Json(request) = request.unwrap_or_default();
    let command = ReverseTransactionCommand {
        transaction_id,
        reason: request.reason,
    };
    let reversal = state.accounts.reverse_transaction(command, &context).await?;
    Ok((StatusCode::CREATED, Json(reversal)))
}

async fn adjust_transaction(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(transaction_id): Path<TransactionId>,
    Json(request): Json<AdjustRequest>,
) -> Result<(StatusCode, Json<Transaction>), AppError> {
    let command = AdjustTransactionCommand {
        transaction_id,
        direction: request.direction,
        amount: request.amount,
        reason: request.reason,
    };
    let adjustment = state.accounts.adjust_transaction(command, &context).await?;
    Ok((StatusCode::CREATED, Json(adjustment)))
}

async fn void_transaction(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(transaction_id): Path<TransactionId>,
) -> Result<Json<Transaction>, AppError> {
    let command = VoidTransactionCommand { transaction_id };
    Ok(Json(state.accounts.void_transaction(command, &context).await?))
}
