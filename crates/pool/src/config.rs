//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handoff::HandoffStrategy;

/// How many connections `Pool::new` schedules up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PrefillMode {
    /// Create connections only on demand.
    None,
    /// Create `min_size` connections.
    #[default]
    ToMin,
    /// Create `max_size` connections.
    ToMax,
}

impl PrefillMode {
    /// Number of connections to schedule for the given bounds.
    #[must_use]
    pub fn target(self, min_size: usize, max_size: usize) -> usize {
        match self {
            Self::None => 0,
            Self::ToMin => min_size,
            Self::ToMax => max_size,
        }
    }
}

/// Configuration for a connection pool.
///
/// A zero duration disables the corresponding sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Name used in logs, events and errors
    pub name: String,
    /// Handoff algorithm
    pub strategy: HandoffStrategy,
    /// Connections created at construction
    pub prefill: PrefillMode,
    /// Connections the pool keeps even when idle
    pub min_size: usize,
    /// Hard cap on live connections, including creations in flight
    pub max_size: usize,
    /// Default bound on `acquire`
    pub acquisition_timeout: Duration,
    /// Period of the validation sweep
    pub validation_interval: Duration,
    /// Hold time after which a checked-out connection is reported as leaked
    pub leak_timeout: Duration,
    /// Period of the leak sweep, `None` to use `leak_timeout`
    pub leak_sweep_interval: Option<Duration>,
    /// Idle time after which a connection above `min_size` is closed
    pub reap_idle_timeout: Duration,
    /// Period of the reap sweep, `None` to use `reap_idle_timeout`
    pub reap_sweep_interval: Option<Duration>,
    /// Serve each thread from the connections it returned most recently
    pub thread_affinity: bool,
    /// Worker threads of the housekeeping runtime
    pub housekeeping_threads: usize,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            strategy: HandoffStrategy::default(),
            prefill: PrefillMode::default(),
            min_size: 1,
            max_size: 10,
            acquisition_timeout: Duration::from_secs(30),
            validation_interval: Duration::from_secs(30),
            leak_timeout: Duration::ZERO,
            leak_sweep_interval: None,
            reap_idle_timeout: Duration::from_secs(600),
            reap_sweep_interval: None,
            thread_affinity: true,
            housekeeping_threads: 2,
            event_buffer: 1024,
        }
    }
}

impl PoolConfig {
    /// Default configuration with the given pool name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the handoff strategy.
    pub fn with_strategy(mut self, strategy: HandoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the pre-fill policy.
    pub fn with_prefill(mut self, prefill: PrefillMode) -> Self {
        self.prefill = prefill;
        self
    }

    /// Set `min_size` and `max_size`.
    pub fn with_size(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    /// Set the default acquisition timeout.
    pub fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Set the validation sweep period.
    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Set the leak threshold.
    pub fn with_leak_timeout(mut self, timeout: Duration) -> Self {
        self.leak_timeout = timeout;
        self
    }

    /// Set the leak sweep period independently of the threshold.
    pub fn with_leak_sweep_interval(mut self, interval: Duration) -> Self {
        self.leak_sweep_interval = Some(interval);
        self
    }

    /// Set the idle reap threshold.
    pub fn with_reap_idle_timeout(mut self, timeout: Duration) -> Self {
        self.reap_idle_timeout = timeout;
        self
    }

    /// Set the reap sweep period independently of the threshold.
    pub fn with_reap_sweep_interval(mut self, interval: Duration) -> Self {
        self.reap_sweep_interval = Some(interval);
        self
    }

    /// Enable or disable the per-thread fast path.
    pub fn with_thread_affinity(mut self, enabled: bool) -> Self {
        self.thread_affinity = enabled;
        self
    }

    /// Set the housekeeping worker count.
    pub fn with_housekeeping_threads(mut self, threads: usize) -> Self {
        self.housekeeping_threads = threads;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Effective leak sweep period; zero when leak detection is off.
    #[must_use]
    pub fn leak_sweep_period(&self) -> Duration {
        if self.leak_timeout.is_zero() {
            return Duration::ZERO;
        }
        self.leak_sweep_interval.unwrap_or(self.leak_timeout)
    }

    /// Effective reap sweep period; zero when reaping is off.
    #[must_use]
    pub fn reap_sweep_period(&self) -> Duration {
        if self.reap_idle_timeout.is_zero() {
            return Duration::ZERO;
        }
        self.reap_sweep_interval.unwrap_or(self.reap_idle_timeout)
    }

    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("name must not be empty"));
        }
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquisition_timeout.is_zero() {
            return Err(Error::configuration(
                "acquisition_timeout must be greater than zero",
            ));
        }
        if self.housekeeping_threads == 0 {
            return Err(Error::configuration(
                "housekeeping_threads must be greater than zero",
            ));
        }
        Ok(())
    }
}
