//! won_ledger - savings and demand deposit ledger API
//!
//! Serves the account, transfer and auto-transfer endpoints and runs the
//! background jobs (auto-transfers, interest accrual, stale transfer sweep).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use won_ledger::api::{self, AppState};
use won_ledger::config::LogFormat;
use won_ledger::db;
use won_ledger::handlers::TransferHandler;
use won_ledger::jobs::{JobScheduler, JobSchedulerConfig};
use won_ledger::store::{MemoryStore, PgStore, Store};
use won_ledger::{Config, EventPublisher, LedgerEvent};

/// Initialize tracing/logging
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "won_ledger=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Drain ledger events into the log until every publisher is gone
fn spawn_event_logger(mut events: mpsc::Receiver<LedgerEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => tracing::info!(
                    event_type = event.event_type(),
                    account_id = event.account_id(),
                    payload = %payload,
                    "Ledger event"
                ),
                Err(e) => tracing::warn!(event_type = event.event_type(), error = %e, "Unserializable ledger event"),
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(environment = %config.environment, "Starting won_ledger server");

    let (store, pool) = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::connect(url, &config).await?;
            db::verify_connection(&pool).await?;

            if !db::check_schema(&pool).await? {
                tracing::error!("Database schema is not complete. Please run migrations.");
                return Err(anyhow::anyhow!("Database schema incomplete"));
            }
            tracing::info!("Database connected successfully");
            (Arc::new(PgStore::new(pool.clone())) as Arc<dyn Store>, Some(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            (Arc::new(MemoryStore::new()) as Arc<dyn Store>, None)
        }
    };

    let (events, receiver) = EventPublisher::channel(config.event_queue_capacity);
    let event_logger = spawn_event_logger(receiver);

    let transfers = Arc::new(TransferHandler::new(store.clone(), events.clone()));
    let scheduler = JobScheduler::with_config(
        store.clone(),
        transfers.clone(),
        events.clone(),
        JobSchedulerConfig::from(&config),
    )
    .start();

    let state = AppState::with_transfers(store, events, transfers);
    let mut app = api::build_router(state);
    if !config.is_production() {
        app = app.layer(CorsLayer::permissive());
    }

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    scheduler.abort();
    event_logger.abort();
    if let Some(pool) = pool {
        pool.close().await;
        tracing::info!("Database connections closed");
    }
    tracing::info!("Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
