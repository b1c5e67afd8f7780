//! Shared runtime helpers for the storage daemon.
//! - Logging initialization (`utils::logging`).
//! - Admin HTTP endpoints for health and Prometheus metrics.
//! - Startup environment checks.

pub mod utils;
pub mod env;
pub mod admin_http;
