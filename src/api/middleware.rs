//! API Middleware
//!
//! Request logging and operation context extraction.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::domain::OperationContext;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const INITIATOR_HEADER: &str = "x-initiator";

// =========================================================================
// mask_headers_for_logging
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &["x-api-key", "authorization", "cookie", "set-cookie"];

/// Mask sensitive headers for logging
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let masked_value = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[invalid utf8]").to_string()
            };
            (name.to_string(), masked_value)
        })
        .collect()
}

/// Build the operation context from request headers.
///
/// A missing or malformed correlation id is replaced by a fresh one.
pub fn context_from_headers(headers: &HeaderMap) -> OperationContext {
    let correlation_id = headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let context = OperationContext::new().with_correlation_id(correlation_id);
    match headers
        .get(INITIATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        Some(initiator) => context.with_initiator(initiator),
        None => context,
    }
}

// =========================================================================
// Request Logging Middleware
// =========================================================================

/// Request logging middleware; also attaches the [`OperationContext`]
pub async fn logging_middleware(mut request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();

    let headers = mask_headers_for_logging(request.headers());

    let context = context_from_headers(request.headers());
    let correlation_id = context.correlation_id;
    request.extensions_mut().insert(context);

    let start = std::time::Instant::now();

    tracing::info!(
        method = %method,
        uri = %uri,
        version = ?version,
        correlation_id = ?correlation_id,
        headers = ?headers,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if let Some(id) = correlation_id {
        if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
    }

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status,
        duration_ms = %duration.as_millis(),
        correlation_id = ?correlation_id,
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_headers_for_logging() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        headers.insert("idempotency-key", "tx-1".parse().unwrap());

        let masked = mask_headers_for_logging(&headers);

        let authorization = masked.iter().find(|(k, _)| k == "authorization");
        let content_type = masked.iter().find(|(k, _)| k == "content-type");
        let idempotency_key = masked.iter().find(|(k, _)| k == "idempotency-key");

        assert_eq!(authorization.unwrap().1, "[REDACTED]");
        assert_eq!(content_type.unwrap().1, "application/json");
        assert_eq!(idempotency_key.unwrap().1, "tx-1");
    }

    #[test]
    fn test_sensitive_headers_list() {
        assert!(SENSITIVE_HEADERS.contains(&"x-api-key"));
        assert!(SENSITIVE_HEADERS.contains(&"authorization"));
        assert!(!SENSITIVE_HEADERS.contains(&"content-type"));
    }

    #[test]
    fn test_context_from_headers() {
        let correlation_id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", correlation_id.to_string().parse().unwrap());
        headers.insert("x-initiator", "teller:42".parse().unwrap());

        let context = context_from_headers(&headers);
        assert_eq!(context.correlation_id, Some(correlation_id));
        assert_eq!(context.initiator.as_deref(), Some("teller:42"));
    }

    #[test]
    fn test_context_gets_fresh_correlation_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", "not-a-uuid".parse().unwrap());

        let context = context_from_headers(&headers);
        assert!(context.correlation_id.is_some());
        assert!(context.initiator.is_none());
    }
}
