//! API module
//!
//! HTTP API endpoints and middleware.

pub mod middleware;
pub mod routes;

use axum::{middleware as axum_middleware, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::domain::EventPublisher;
use crate::handlers::{AccountHandler, ScheduleHandler, TransferHandler};
use crate::store::Store;

pub use routes::create_router;

/// Handlers shared by every request
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountHandler>,
    pub transfers: Arc<TransferHandler>,
    pub schedules: Arc<ScheduleHandler>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, events: EventPublisher) -> Self {
        Self::with_transfers(
            store.clone(),
            events.clone(),
            Arc::new(TransferHandler::new(store, events)),
        )
    }

    /// Share a transfer handler with the job scheduler
    pub fn with_transfers(store: Arc<dyn Store>, events: EventPublisher, transfers: Arc<TransferHandler>) -> Self {
        Self {
            accounts: Arc::new(AccountHandler::new(store.clone(), events)),
            transfers,
            schedules: Arc::new(ScheduleHandler::new(store)),
        }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let api_router = create_router().layer(axum_middleware::from_fn(middleware::logging_middleware));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_router)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
