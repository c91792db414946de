use std::sync::atomic::AtomicU64;

use ports::secondary::metrics_port::PolicyMetrics;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::constants::POLICY_MAP_PRESSURE_WARN_THRESHOLD;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: u32,
}

/// Prometheus registry for the policy engine, implementing the
/// [`PolicyMetrics`] port.
pub struct AgentMetrics {
    registry: Registry,
    map_pressure: Family<EndpointLabels, Gauge<f64, AtomicU64>>,
    desired_entries: Family<EndpointLabels, Gauge>,
    sync_discrepancies: Family<EndpointLabels, Counter>,
    map_sync_errors: Family<EndpointLabels, Counter>,
    reverts: Family<EndpointLabels, Counter>,
}

impl AgentMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("epsentinel");

        let map_pressure = Family::<EndpointLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "policy_map_pressure",
            "Fill ratio of the endpoint policy map",
            map_pressure.clone(),
        );

        let desired_entries = Family::<EndpointLabels, Gauge>::default();
        registry.register(
            "policy_desired_entries",
            "Number of entries in the desired policy state",
            desired_entries.clone(),
        );

        let sync_discrepancies = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "policy_map_sync_discrepancies",
            "Discrepancies found by dump-based policy map reconciliation",
            sync_discrepancies.clone(),
        );

        let map_sync_errors = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "policy_map_sync_errors",
            "Failed kernel policy map operations",
            map_sync_errors.clone(),
        );

        let reverts = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "policy_batch_reverts",
            "Policy change batches undone after cancellation or failure",
            reverts.clone(),
        );

        Self {
            registry,
            map_pressure,
            desired_entries,
            sync_discrepancies,
            map_sync_errors,
            reverts,
        }
    }

    /// Encode all metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let mut out = String::new();
        // Encoding into a String cannot fail.
        let _ = encode(&mut out, &self.registry);
        out
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn labels(endpoint: u16) -> EndpointLabels {
        EndpointLabels {
            endpoint: u32::from(endpoint),
        }
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyMetrics for AgentMetrics {
    fn set_map_pressure(&self, endpoint: u16, pressure: f64) {
        if pressure > POLICY_MAP_PRESSURE_WARN_THRESHOLD {
            tracing::warn!(endpoint, pressure, "policy map nearing capacity");
        }
        self.map_pressure
            .get_or_create(&Self::labels(endpoint))
            .set(pressure);
    }

    fn set_desired_entries(&self, endpoint: u16, count: u64) {
        self.desired_entries
            .get_or_create(&Self::labels(endpoint))
            .set(count as i64);
    }

    fn record_sync_discrepancies(&self, endpoint: u16, count: u64) {
        self.sync_discrepancies
            .get_or_create(&Self::labels(endpoint))
            .inc_by(count);
    }

    fn record_map_sync_error(&self, endpoint: u16) {
        self.map_sync_errors
            .get_or_create(&Self::labels(endpoint))
            .inc();
    }

    fn record_revert(&self, endpoint: u16) {
        self.reverts.get_or_create(&Self::labels(endpoint)).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_recorded_and_encoded() {
        let metrics = AgentMetrics::new();
        metrics.set_map_pressure(7, 0.25);
        metrics.set_desired_entries(7, 42);
        metrics.record_sync_discrepancies(7, 3);
        metrics.record_map_sync_error(7);
        metrics.record_revert(7);

        let text = metrics.encode_text();
        assert!(text.contains("epsentinel_policy_map_pressure"));
        assert!(text.contains("epsentinel_policy_desired_entries"));
        assert!(text.contains("epsentinel_policy_map_sync_discrepancies_total"));
        assert!(text.contains("endpoint=\"7\""));
    }

    #[test]
    fn pressure_gauge_keeps_latest_value() {
        let metrics = AgentMetrics::new();
        metrics.set_map_pressure(1, 0.10);
        metrics.set_map_pressure(1, 0.90);
        let text = metrics.encode_text();
        assert!(text.contains("0.9"));
    }
}
