use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec, IntGauge};

// Prometheus metrics (default registry)
pub static OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "storage_operations_total",
        "Client and administrative operations processed by the storage worker",
        &["op"]
    )
    .expect("register operations_total")
});

pub static QUOTA_EXCEEDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "storage_quota_exceeded_total",
        "Total writes rejected because the area quota would be exceeded"
    )
    .expect("register quota_exceeded_total")
});

pub static STORAGE_EVENTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "storage_events_total",
        "Total storage-changed events fanned out to listeners"
    )
    .expect("register storage_events_total")
});

pub static CACHE_INVALIDATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "storage_cache_invalidations_total",
        "Total cache invalidations sent after administrative clears"
    )
    .expect("register cache_invalidations_total")
});

pub static BACKING_STORE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "storage_backing_store_failures_total",
        "Total backing store failures that left an area memory-only"
    )
    .expect("register backing_store_failures_total")
});

pub static STALE_REFERENCES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "storage_stale_references_total",
        "Total operations ignored because their binding or namespace no longer exists"
    )
    .expect("register stale_references_total")
});

pub static PROTOCOL_VIOLATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "storage_protocol_violations_total",
        "Total protocol violations reported to connections"
    )
    .expect("register protocol_violations_total")
});

pub static QUEUED_TASKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "storage_queued_tasks",
        "Tasks submitted to the storage worker and not yet processed"
    )
    .expect("register queued_tasks")
});

pub fn record_op(op: &str) {
    OPERATIONS_TOTAL.with_label_values(&[op]).inc();
}
