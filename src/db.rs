//! Database module
//!
//! Connection and schema checks. The schema itself lives in the raw SQL
//! files under `migrations/`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

/// Tables the PostgreSQL store reads and writes
pub const REQUIRED_TABLES: [&str; 5] = [
    "account",
    "transaction",
    "transfer",
    "ledger_entry",
    "account_auto_transfer",
];

/// Open a pool sized from configuration
pub async fn connect(database_url: &str, config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(database_url)
        .await
}

/// Verify database connectivity
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!(table, "Required table does not exist, apply migrations/0001_core_ledger.sql");
            return Ok(false);
        }
    }

    tracing::info!("Ledger schema verified");
    Ok(true)
}
