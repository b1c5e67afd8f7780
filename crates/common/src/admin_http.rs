//! Lightweight admin HTTP server spawner
//!
//! Exposes `/healthz` and `/metrics` endpoints, with metrics provided by caller.

use std::thread;
use axum::{routing::get, Router};
use axum::http::StatusCode;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tracing::{error, info};

async fn healthz() -> &'static str { "OK" }

async fn metrics_handler(f: fn() -> (StatusCode, String)) -> (StatusCode, String) {
    f()
}

/// Text exposition of everything in the default Prometheus registry.
pub fn encode_metrics() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}"));
    }
    (StatusCode::OK, String::from_utf8(buffer).unwrap_or_default())
}

pub fn router(metrics_fn: fn() -> (StatusCode, String)) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(move || metrics_handler(metrics_fn)))
}

/// Spawn an admin HTTP server exposing healthz and metrics endpoints on its
/// own thread and runtime. Bind or serve failures are logged, not fatal.
pub fn spawn_admin_server(addr: &str, metrics_fn: fn() -> (StatusCode, String)) -> std::io::Result<thread::JoinHandle<()>> {
    let addr = addr.to_string();
    let rt = Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new().name("admin-http".to_string()).spawn(move || {
        rt.block_on(async move {
            let listener = match TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(%addr, error = %e, "admin server bind failed");
                    return;
                }
            };
            info!(%addr, "admin server listening");
            if let Err(e) = axum::serve(listener, router(metrics_fn)).await {
                error!(%addr, error = %e, "admin server stopped");
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use prometheus::{register_int_counter, IntCounter};

    static TEST_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
        register_int_counter!("common_admin_http_test_total", "Counter used by admin_http tests")
            .expect("register test counter")
    });

    #[test]
    fn encode_metrics_includes_registered_counters() {
        TEST_COUNTER.inc();
        let (status, body) = encode_metrics();
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("common_admin_http_test_total 1"));
    }
}
