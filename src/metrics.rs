//! Prometheus metrics for the execution core
//!
//! - Items processed per execution phase
//! - Errors reported per operator
//! - Operator pool hit/miss counts

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref PHASE_ITEMS: IntCounterVec = IntCounterVec::new(
        Opts::new("photonq_phase_items_total", "Items processed per execution phase"),
        &["phase"]
    ).unwrap();

    pub static ref OPERATOR_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("photonq_operator_errors_total", "Errors reported by operators"),
        &["operator"]
    ).unwrap();

    pub static ref POOL_GETS: IntCounterVec = IntCounterVec::new(
        Opts::new("photonq_pool_gets_total", "Operator pool requests"),
        &["pool", "result"]
    ).unwrap();
}

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(PHASE_ITEMS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(OPERATOR_ERRORS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(POOL_GETS.clone())).ok();
}

/// Export all metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_after_init() {
        init_metrics();
        init_metrics();
        PHASE_ITEMS.with_label_values(&["test_phase"]).inc_by(3);
        let text = gather_metrics();
        assert!(text.contains("photonq_phase_items_total"));
        assert!(text.contains("test_phase"));
    }
}
