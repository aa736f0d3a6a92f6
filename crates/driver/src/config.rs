//! Driver-wide configuration.
//!
//! Library code never reads the environment itself — only the settings
//! struct exists here. A binary embedding the driver loads `.env` and maps
//! env vars onto `DriverSettings` the way `plexmcp-api`'s `main.rs` calls
//! `dotenvy::dotenv().ok()` before constructing its own `Config`; see
//! `demos/basic` for that edge.

use std::time::Duration;

use ydb_shared::RetryParameters;

/// Tunables for `Driver::connect`. Defaults follow spec.md section 4.3/4.6.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// How often discovery refreshes the endpoint table.
    pub discovery_period: Duration,
    /// How long a pessimized endpoint stays out of rotation.
    pub pessimization_delay: Duration,
    /// Minimum number of sessions the pool tries to keep warm.
    pub min_pool_size: usize,
    /// Hard cap on sessions the pool will create.
    pub max_pool_size: usize,
    /// Interval between `keepAlive` sweeps over all pooled sessions.
    pub session_keepalive_period: Duration,
    /// Sessions idle longer than this may be dropped during a keepalive
    /// sweep once the pool is above `min_pool_size` (SPEC_FULL.md section B).
    pub session_idle_timeout: Duration,
    /// Default policy `with_retries` uses when the caller doesn't supply
    /// its own `RetryParameters`.
    pub default_retry: RetryParameters,
    /// Timeout applied to every unary RPC via `Transport::with_timeout`.
    pub operation_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            discovery_period: Duration::from_secs(60),
            pessimization_delay: Duration::from_secs(60),
            min_pool_size: 5,
            max_pool_size: 20,
            session_keepalive_period: Duration::from_secs(5 * 60),
            session_idle_timeout: Duration::from_secs(30 * 60),
            default_retry: RetryParameters::default(),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl DriverSettings {
    pub fn with_pool_limits(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }

    pub fn with_session_keepalive_period(mut self, period: Duration) -> Self {
        self.session_keepalive_period = period;
        self
    }
}
