//! Global metrics registry and collector definitions.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry for all weir metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Pipeline Subsystem
    // ============================================================================

    /// Packets seen by the accept hooks.
    /// Labels: direction = "ingress" | "egress",
    ///         disposition = "allowed" | "dropped" | "captured" | "bypassed"
    pub static ref PACKETS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("packets_total", "Total packets handled by the accept hooks")
            .namespace("weir")
            .subsystem("pipeline"),
        &["direction", "disposition"]
    ).expect("failed to create pipeline_packets_total metric");

    /// Capture records lost because the ring channel was full.
    pub static ref CAPTURE_DROPS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("capture_drops_total", "Capture records dropped because the ring channel was full")
            .namespace("weir")
            .subsystem("pipeline")
    ).expect("failed to create pipeline_capture_drops_total metric");

    // ============================================================================
    // Filter Lifecycle Subsystem
    // ============================================================================

    /// Currently attached filter instances.
    pub static ref INSTANCES_ACTIVE: IntGauge = IntGauge::with_opts(
        Opts::new("instances_active", "Currently attached filter instances")
            .namespace("weir")
            .subsystem("filter")
    ).expect("failed to create filter_instances_active metric");

    /// Lifecycle transitions performed.
    /// Labels: transition = "attach" | "restart" | "pause" | "detach"
    pub static ref LIFECYCLE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lifecycle_transitions_total", "Completed lifecycle transitions by kind")
            .namespace("weir")
            .subsystem("filter"),
        &["transition"]
    ).expect("failed to create filter_lifecycle_transitions_total metric");

    // ============================================================================
    // Ring Channel Subsystem
    // ============================================================================

    /// Ring write attempts. Labels: status = "ok" | "full"
    pub static ref RING_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("writes_total", "Write attempts on the ring channel")
            .namespace("weir")
            .subsystem("ring"),
        &["status"]
    ).expect("failed to create ring_writes_total metric");

    /// Bytes successfully published on the ring channel.
    pub static ref RING_BYTES_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("bytes_total", "Bytes published on the ring channel")
            .namespace("weir")
            .subsystem("ring")
    ).expect("failed to create ring_bytes_total metric");

    // ============================================================================
    // Control Channel Subsystem
    // ============================================================================

    /// Control requests dispatched.
    /// Labels: opcode = "ruleset_update" | "stats_query" | "ring_drain" | "unknown",
    ///         status = "ok" | "error"
    pub static ref CONTROL_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("requests_total", "Control requests dispatched by opcode and status")
            .namespace("weir")
            .subsystem("control"),
        &["opcode", "status"]
    ).expect("failed to create control_requests_total metric");

    /// Current rule-set version as reported by the engine.
    pub static ref RULESET_VERSION: IntGauge = IntGauge::with_opts(
        Opts::new("ruleset_version", "Rule-set version last loaded through the control channel")
            .namespace("weir")
            .subsystem("rules")
    ).expect("failed to create rules_ruleset_version metric");
}

macro_rules! register {
    ($metric:expr) => {{
        REGISTRY.register(Box::new($metric.clone()))?;
    }};
}

/// Initialize the metrics registry by registering all collectors.
///
/// # Errors
///
/// Returns [`prometheus::Error`] if a metric with the same name is already
/// registered.
pub fn init_registry() -> Result<(), prometheus::Error> {
    register!(PACKETS_TOTAL);
    register!(CAPTURE_DROPS_TOTAL);
    register!(INSTANCES_ACTIVE);
    register!(LIFECYCLE_TRANSITIONS_TOTAL);
    register!(RING_WRITES_TOTAL);
    register!(RING_BYTES_TOTAL);
    register!(CONTROL_REQUESTS_TOTAL);
    register!(RULESET_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_registry_is_idempotent_per_process() {
        // A second init in the same process reports AlreadyReg; both
        // outcomes leave the registry serving all collectors.
        let _ = init_registry();
        let _ = init_registry();
        assert!(!REGISTRY.gather().is_empty());
    }

    #[test]
    fn disposition_labels_accepted() {
        PACKETS_TOTAL.with_label_values(&["ingress", "allowed"]).inc();
        PACKETS_TOTAL.with_label_values(&["egress", "dropped"]).inc();
        assert!(PACKETS_TOTAL.with_label_values(&["ingress", "allowed"]).get() >= 1);
    }
}
