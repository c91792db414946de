use std::time::Duration;

// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/epsentinel/config.yaml";

/// Directory the loader pins per-endpoint policy maps under.
pub const DEFAULT_POLICY_MAP_PIN_DIR: &str = "/sys/fs/bpf/epsentinel";

// ── Network defaults ───────────────────────────────────────────────

pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Range proxy ports are allocated from.
pub const DEFAULT_PROXY_PORT_MIN: u16 = 10000;
pub const DEFAULT_PROXY_PORT_MAX: u16 = 20000;

// ── Timeouts and intervals ─────────────────────────────────────────

/// Interval of the periodic dump-based policy map reconciliation.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Upper bound on one endpoint regeneration, dominated by the wait for
/// proxy redirect ACKs.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(330);

// ── Thresholds ─────────────────────────────────────────────────────

/// Policy map fill ratio above which a warning is logged.
pub const POLICY_MAP_PRESSURE_WARN_THRESHOLD: f64 = 0.80;
