// src/core/metrics.rs

//! Defines and registers Prometheus metrics for plugin monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Worker gauges ---
    /// The number of repository workers currently alive in this process.
    pub static ref LIVE_WORKERS: Gauge =
        register_gauge!("beskar_live_workers", "Number of currently running repository workers.").unwrap();

    // --- Event counters ---
    /// The total number of registry events processed, labeled by action.
    pub static ref EVENTS_PROCESSED_TOTAL: CounterVec =
        register_counter_vec!("beskar_events_processed_total", "Total number of events processed, labeled by action.", &["action"]).unwrap();
    /// The total number of events whose processing failed and was left for retry.
    pub static ref EVENTS_FAILED_TOTAL: Counter =
        register_counter!("beskar_events_failed_total", "Total number of events whose processing failed.").unwrap();
    /// The total number of events dropped because the manifest could not be parsed.
    pub static ref EVENTS_DROPPED_TOTAL: Counter =
        register_counter!("beskar_events_dropped_total", "Total number of malformed events dropped from the queue.").unwrap();

    // --- State layer counters ---
    /// The total number of state database syncs pushed to object storage.
    pub static ref STATE_SYNCS_TOTAL: Counter =
        register_counter!("beskar_state_syncs_total", "Total number of state database syncs to object storage.").unwrap();
    /// The total number of state database syncs that failed.
    pub static ref STATE_SYNC_FAILURES_TOTAL: Counter =
        register_counter!("beskar_state_sync_failures_total", "Total number of failed state database syncs.").unwrap();

    // --- Histograms ---
    /// The wall-clock latency of processing one event.
    pub static ref EVENT_PROCESSING_SECONDS: Histogram =
        register_histogram!("beskar_event_processing_seconds", "Latency of processing a single event.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
