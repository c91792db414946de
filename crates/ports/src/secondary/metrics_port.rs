// Metrics port for the endpoint policy engine.
//
// All methods take `&self` because the underlying implementation uses
// atomic operations (interior mutability via `prometheus-client`).
//
// Default implementations are no-ops so test mocks only implement what
// the test observes.

/// Prometheus-style metrics recorded by the policy engine and reconciler.
pub trait PolicyMetrics: Send + Sync {
    /// Set the policy map pressure gauge: realized entries over capacity.
    fn set_map_pressure(&self, _endpoint: u16, _pressure: f64) {}

    /// Set the number of entries in the desired policy state.
    fn set_desired_entries(&self, _endpoint: u16, _count: u64) {}

    /// Record discrepancies found by a dump-based reconciliation; these
    /// indicate external tampering or an engine bug.
    fn record_sync_discrepancies(&self, _endpoint: u16, _count: u64) {}

    /// Record a failed kernel map operation during sync.
    fn record_map_sync_error(&self, _endpoint: u16) {}

    /// Record a reverted policy batch.
    fn record_revert(&self, _endpoint: u16) {}
}
