use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid policy key: {0}")]
    InvalidKey(String),

    #[error("invalid proxy ID structure: {0}")]
    InvalidProxyId(String),

    #[error("proxy port for listener '{listener}' not yet allocated")]
    ProxyUnresolved { listener: String },

    #[error("kernel policy map error: {0}")]
    MapError(String),

    #[error("policy map sync failed: {errors} of {total} operations")]
    SyncFailed { errors: usize, total: usize },

    #[error("stale policy computation: version {version} is not newer than {current}")]
    StaleVersion { version: u64, current: u64 },

    #[error("operation canceled")]
    Canceled,
}

impl DomainError {
    /// Returns `true` for cancellation, which is propagated but never
    /// logged as an error.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
