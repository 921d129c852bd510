//! Session tunables.
//!
//! Only three knobs are exposed to hosts: how often the state-vector
//! handshake is re-run, how long edits are coalesced before a snapshot
//! write, and how long a released Session lingers before real teardown.

use std::time::Duration;

/// Smallest accepted resync interval. Anything tighter turns the periodic
/// handshake into channel spam.
pub const MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(3);

/// Sync session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Period of the background state-vector handshake (default: 30s)
    pub resync_interval: Duration,
    /// Quiet period before a snapshot write (default: 1000ms)
    pub save_debounce: Duration,
    /// Deferred-destroy window after the last lease is released (default: 50ms)
    pub grace_period: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            save_debounce: Duration::from_millis(1000),
            grace_period: Duration::from_millis(50),
        }
    }
}

impl SyncConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            resync_interval: MIN_RESYNC_INTERVAL,
            save_debounce: Duration::from_millis(100),
            grace_period: Duration::from_millis(50),
        }
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Reject configurations the Session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_interval < MIN_RESYNC_INTERVAL {
            return Err(ConfigError::ResyncIntervalTooShort(self.resync_interval));
        }
        if self.save_debounce.is_zero() {
            return Err(ConfigError::ZeroDuration("save_debounce"));
        }
        if self.grace_period.is_zero() {
            return Err(ConfigError::ZeroDuration("grace_period"));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ResyncIntervalTooShort(Duration),
    ZeroDuration(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResyncIntervalTooShort(d) => write!(
                f,
                "Resync interval {}ms is below the {}ms minimum",
                d.as_millis(),
                MIN_RESYNC_INTERVAL.as_millis()
            ),
            Self::ZeroDuration(name) => write!(f, "{name} must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
