//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tower::util::ServiceExt;

use won_ledger::api::{self, AppState};
use won_ledger::store::{MemoryStore, Store};
use won_ledger::EventPublisher;

/// Router over a fresh in-memory store
pub fn memory_app() -> (Router, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone(), EventPublisher::disabled());
    (api::build_router(state), store)
}

/// Send one request and decode the JSON body (Null when empty)
pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    send_with_headers(app, method, uri, body, &[]).await
}

pub async fn send_with_headers(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, json)
}

/// Open a demand deposit account and optionally fund it; returns its id
pub async fn open_funded(app: &Router, customer_id: i64, balance: i64) -> i64 {
    let (status, account) = send(
        app,
        "POST",
        "/api/v1/accounts",
        Some(serde_json::json!({ "customer_id": customer_id, "product_id": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "account creation failed: {}", account);
    let id = account["id"].as_i64().unwrap();

    if balance > 0 {
        let (status, body) = send(
            app,
            "POST",
            &format!("/api/v1/accounts/{}/deposit", id),
            Some(serde_json::json!({ "amount": balance })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "deposit failed: {}", body);
    }
    id
}

/// Setup test database - apply the schema and truncate all tables
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    pool.execute(include_str!("../../migrations/0001_core_ledger.sql"))
        .await
        .expect("Failed to apply schema");

    pool.execute(
        r#"TRUNCATE TABLE ledger_entry, "transaction", transfer, account_auto_transfer, account RESTART IDENTITY CASCADE"#,
    )
    .await
    .expect("Failed to clean up DB");

    pool
}
