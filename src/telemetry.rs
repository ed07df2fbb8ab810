//! Metric names and recording helpers
//!
//! All metrics go through the `metrics` facade; without an installed
//! recorder they are no-ops.

use telemetry_metrics::{counter, gauge};

/// Breaker phase changes, labelled `dependency`, `from`, `to`
pub const CIRCUIT_TRANSITIONS: &str = "depguard_circuit_transitions_total";
/// Resolver outcomes, labelled `source`
pub const RESOLUTIONS: &str = "depguard_resolutions_total";
/// Auth cache lookups, labelled `outcome` (`hit` / `miss` / `error`)
pub const AUTH_CACHE_LOOKUPS: &str = "depguard_auth_cache_lookups_total";
/// Validation outcomes, labelled `outcome`
pub const AUTH_VALIDATIONS: &str = "depguard_auth_validations_total";
/// Overall health: 2 healthy, 1 degraded, 0 unhealthy
pub const HEALTH_STATUS: &str = "depguard_health_status";

pub(crate) fn record_transition(dependency: &str, from: &'static str, to: &'static str) {
    counter!(CIRCUIT_TRANSITIONS, "dependency" => dependency.to_string(), "from" => from, "to" => to)
        .increment(1);
}

pub(crate) fn record_resolution(source: &'static str) {
    counter!(RESOLUTIONS, "source" => source).increment(1);
}

pub(crate) fn record_auth_cache(outcome: &'static str) {
    counter!(AUTH_CACHE_LOOKUPS, "outcome" => outcome).increment(1);
}

pub(crate) fn record_validation(outcome: &'static str) {
    counter!(AUTH_VALIDATIONS, "outcome" => outcome).increment(1);
}

pub(crate) fn set_health_status(value: f64) {
    gauge!(HEALTH_STATUS).set(value);
}

/// Install the Prometheus recorder and return the render handle
#[cfg(feature = "metrics")]
pub fn install_prometheus()
-> crate::Result<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::Error::Internal(format!("failed to install metrics recorder: {e}")))
}
