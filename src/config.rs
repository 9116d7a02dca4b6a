//! Server tunables (spec §6).
//!
//! Construct-once configuration for a [`crate::net::server::Server`]. There
//! is no hot-reload: tunables are read once at thread spawn time, matching
//! the fixed-slot-table design of the connection and RTBR subsystems.

/// Epoch guard-band, in "quick clock" ticks (spec default 2^20).
pub const DEFAULT_RTBR_DELAY_TICKS: u64 = 1 << 20;

/// Hard-poll throttle, in milliseconds (spec default 10).
pub const DEFAULT_RTBR_HARD_POLL_PERIOD_MS: u64 = 10;

/// Default bump arena chunk size (spec default 16 MiB).
pub const DEFAULT_BUMP_SIZE: usize = 16 * 1024 * 1024;

/// Default per-pool reservation (spec default 4 GiB).
pub const DEFAULT_POOL_SIZE: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Tunables {
    /// Number of I/O threads. Hard-capped at [`Tunables::MAX_THREADS`].
    pub num_threads: usize,
    /// Maximum total connections (fixed slot table size).
    pub max_total_connections: usize,
    /// Maximum *active* (non-idle) connections. Must be `<= max_total_connections`.
    pub max_active_connections: usize,
    /// Default request timeout; `0` disables the timeout scan.
    pub request_timeout_ms: u64,
    /// Maximum response body size accepted from a worker.
    pub max_response_size: usize,
    /// Bump arena chunk size.
    pub bump_size: usize,
    /// Per-pool virtual memory reservation.
    pub pool_size: u64,
    /// Cap on the off-pool heap path for oversized responses.
    pub total_large_allocation_limit: usize,
    /// RTBR epoch guard-band, in quick-clock ticks.
    pub rtbr_delay_ticks: u64,
    /// RTBR hard-poll throttle, in milliseconds.
    pub rtbr_hard_poll_period_ms: u64,
}

impl Tunables {
    /// Implementation-chosen hard cap on `num_threads`: one I/O thread
    /// consumes one byte of the request id's `iotd_idx` field, which spec §3
    /// allots 8 bits to -- but we cap far below 256 since each thread also
    /// owns a dedicated epoll instance and connection slot array.
    pub const MAX_THREADS: usize = 64;

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.num_threads == 0 || self.num_threads > Self::MAX_THREADS {
            return Err(crate::error::CoreError::Config(format!(
                "num_threads must be in 1..={}, got {}",
                Self::MAX_THREADS,
                self.num_threads
            )));
        }
        if self.max_active_connections > self.max_total_connections {
            return Err(crate::error::CoreError::Config(
                "max_active_connections must be <= max_total_connections".into(),
            ));
        }
        if self.max_total_connections == 0 {
            return Err(crate::error::CoreError::Config(
                "max_total_connections must be > 0".into(),
            ));
        }
        if !self.bump_size.is_power_of_two() {
            return Err(crate::error::CoreError::Config(
                "bump_size must be a power of two".into(),
            ));
        }
        Ok(())
    }

    /// Loads overrides from environment variables, falling back to
    /// [`Default`] for anything unset. Mirrors the teacher's plain
    /// construct-from-env style rather than a hierarchical config manager --
    /// this crate has no use for hot-reload or encrypted parameters.
    pub fn from_env() -> Self {
        let mut tunables = Self::default();
        if let Ok(v) = std::env::var("EMBERHTTP_NUM_THREADS") {
            if let Ok(n) = v.parse() {
                tunables.num_threads = n;
            }
        }
        if let Ok(v) = std::env::var("EMBERHTTP_REQUEST_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                tunables.request_timeout_ms = n;
            }
        }
        tunables
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            num_threads: num_cpus_or_one(),
            max_total_connections: 65_536,
            max_active_connections: 32_768,
            request_timeout_ms: 30_000,
            max_response_size: 16 * 1024 * 1024,
            bump_size: DEFAULT_BUMP_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            total_large_allocation_limit: 256 * 1024 * 1024,
            rtbr_delay_ticks: DEFAULT_RTBR_DELAY_TICKS,
            rtbr_hard_poll_period_ms: DEFAULT_RTBR_HARD_POLL_PERIOD_MS,
        }
    }
}

fn num_cpus_or_one() -> usize {
    num_cpus::get().max(1).min(Tunables::MAX_THREADS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tunables_are_valid() {
        Tunables::default().validate().unwrap();
    }

    #[test]
    fn active_over_total_is_rejected() {
        let mut t = Tunables::default();
        t.max_active_connections = t.max_total_connections + 1;
        assert!(t.validate().is_err());
    }

    #[test]
    fn non_power_of_two_bump_size_is_rejected() {
        let mut t = Tunables::default();
        t.bump_size = 100;
        assert!(t.validate().is_err());
    }
}
