//! Metrics and observability utilities
//!
//! Metric names share the `nizam_` prefix. Recording goes through the
//! `metrics` facade; without an installed recorder the calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Nizam metrics
pub const METRICS_PREFIX: &str = "nizam";

/// Register all metric descriptions
pub fn register_metrics() {
    // Provisioning
    describe_counter!(
        format!("{}_provisioning_total", METRICS_PREFIX),
        Unit::Count,
        "Tenant provisioning runs by outcome"
    );

    describe_histogram!(
        format!("{}_provisioning_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Tenant provisioning latency in seconds"
    );

    describe_counter!(
        format!("{}_compensation_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Rollback actions that failed and need manual cleanup"
    );

    // Schema
    describe_counter!(
        format!("{}_migrations_applied_total", METRICS_PREFIX),
        Unit::Count,
        "Schema migration steps by set and status"
    );

    // Connection router
    describe_counter!(
        format!("{}_router_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Tenant resolutions served from the handle cache"
    );

    describe_counter!(
        format!("{}_router_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Tenant resolutions that had to initialize or wait for a handle"
    );

    describe_histogram!(
        format!("{}_router_init_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Tenant handle initialization latency in seconds"
    );

    describe_counter!(
        format!("{}_router_evictions_total", METRICS_PREFIX),
        Unit::Count,
        "Tenant handles closed and removed from the cache"
    );

    describe_gauge!(
        format!("{}_router_cached_tenants", METRICS_PREFIX),
        Unit::Count,
        "Tenant handles currently cached"
    );

    // SKU allocation
    describe_counter!(
        format!("{}_sku_allocations_total", METRICS_PREFIX),
        Unit::Count,
        "SKU allocations by status"
    );

    describe_counter!(
        format!("{}_sku_conflicts_total", METRICS_PREFIX),
        Unit::Count,
        "SKU inserts retried after a uniqueness conflict"
    );

    tracing::info!("Metrics registered");
}

/// Times one provisioning run
pub struct ProvisioningMetrics {
    start: Instant,
}

impl ProvisioningMetrics {
    /// Start timing
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Record the run with its outcome label
    pub fn finish(self, outcome: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_provisioning_total", METRICS_PREFIX),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            format!("{}_provisioning_duration_seconds", METRICS_PREFIX),
            "outcome" => outcome
        )
        .record(duration);
    }
}

/// Count rollback actions that failed
pub fn record_compensation_failures(count: usize) {
    counter!(format!("{}_compensation_failures_total", METRICS_PREFIX)).increment(count as u64);
}

/// Record one migration step
pub fn record_migration(set: &'static str, success: bool) {
    let status = if success { "applied" } else { "failed" };

    counter!(
        format!("{}_migrations_applied_total", METRICS_PREFIX),
        "set" => set,
        "status" => status
    )
    .increment(1);
}

/// Record a router cache lookup
pub fn record_router_cache(hit: bool) {
    if hit {
        counter!(format!("{}_router_cache_hits_total", METRICS_PREFIX)).increment(1);
    } else {
        counter!(format!("{}_router_cache_misses_total", METRICS_PREFIX)).increment(1);
    }
}

/// Record a finished handle initialization
pub fn record_router_init(duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    histogram!(
        format!("{}_router_init_duration_seconds", METRICS_PREFIX),
        "status" => status
    )
    .record(duration_secs);
}

/// Record handles removed from the cache
pub fn record_router_evictions(reason: &'static str, count: usize) {
    counter!(
        format!("{}_router_evictions_total", METRICS_PREFIX),
        "reason" => reason
    )
    .increment(count as u64);
}

/// Publish the number of cached handles
pub fn set_router_cached(count: usize) {
    gauge!(format!("{}_router_cached_tenants", METRICS_PREFIX)).set(count as f64);
}

/// Record one SKU allocation and the conflicts it retried through
pub fn record_sku_allocation(conflicts: u32, success: bool) {
    let status = if success { "success" } else { "exhausted" };

    counter!(
        format!("{}_sku_allocations_total", METRICS_PREFIX),
        "status" => status
    )
    .increment(1);

    if conflicts > 0 {
        counter!(format!("{}_sku_conflicts_total", METRICS_PREFIX)).increment(conflicts as u64);
    }
}
