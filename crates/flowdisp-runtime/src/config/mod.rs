//! Dispatcher configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (runtime)
//! 3. User's fdp_config.rs (compile-time, via `FDP_CONFIG_RS`)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use flowdisp_runtime::config::DispatchConfig;
//!
//! let config = DispatchConfig::from_env()
//!     .max_threads(4)
//!     .direct_dispatch(false);
//! ```

pub mod defaults;

use flowdisp_core::constants::MAX_WORKSTREAMS;
use flowdisp_core::env::{env_get, env_get_bool};
use flowdisp_core::proto::Affinity;

/// Dispatcher configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Run handlers inline on the producer's CPU when affinity allows
    pub direct_dispatch: bool,
    /// Cap on workstreams; values <= 1 mean the primary CPU only
    pub max_threads: usize,
    /// Pin each worker thread to the CPU it serves
    pub bind_threads: bool,
    /// Queue limit used when a protocol registers with limit 0
    pub default_queue_limit: usize,
    /// Largest queue limit a protocol may ask for
    pub max_queue_limit: usize,
    /// Hold the registry lock in shared mode across every dispatch
    pub registry_lock: bool,
    /// Affinity for flow-classified units that do not carry their own
    pub default_affinity: Affinity,
    /// Enable debug logging of worker lifecycle and placement decisions
    pub debug_logging: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DispatchConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `FDP_DIRECT_DISPATCH` - Allow inline handler execution (0/1)
    /// - `FDP_MAX_THREADS` - Cap on workstreams
    /// - `FDP_BIND_THREADS` - Pin workers to their CPU (0/1)
    /// - `FDP_DEFAULT_QLIMIT` - Default per-protocol queue limit
    /// - `FDP_MAX_QLIMIT` - Largest allowed queue limit
    /// - `FDP_REGISTRY_LOCK` - Enable the shared registry lock (0/1)
    /// - `FDP_DEFAULT_AFFINITY` - weak or strong
    /// - `FDP_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            direct_dispatch: env_get_bool("FDP_DIRECT_DISPATCH", base.direct_dispatch),
            max_threads: env_get("FDP_MAX_THREADS", base.max_threads),
            bind_threads: env_get_bool("FDP_BIND_THREADS", base.bind_threads),
            default_queue_limit: env_get("FDP_DEFAULT_QLIMIT", base.default_queue_limit),
            max_queue_limit: env_get("FDP_MAX_QLIMIT", base.max_queue_limit),
            registry_lock: env_get_bool("FDP_REGISTRY_LOCK", base.registry_lock),
            default_affinity: env_get("FDP_DEFAULT_AFFINITY", base.default_affinity),
            debug_logging: env_get_bool("FDP_DEBUG", base.debug_logging),
        }
    }

    /// Create config from compile-time defaults only (no env override).
    /// Useful for tests that must not see the caller's environment.
    pub fn new() -> Self {
        Self {
            direct_dispatch: defaults::DIRECT_DISPATCH,
            max_threads: defaults::MAX_THREADS,
            bind_threads: defaults::BIND_THREADS,
            default_queue_limit: defaults::DEFAULT_QLIMIT,
            max_queue_limit: defaults::MAX_QLIMIT,
            registry_lock: defaults::REGISTRY_LOCK,
            default_affinity: if defaults::DEFAULT_AFFINITY_STRONG {
                Affinity::Strong
            } else {
                Affinity::Weak
            },
            debug_logging: defaults::DEBUG_LOGGING || cfg!(feature = "debug-logging"),
        }
    }

    // Builder methods

    pub fn direct_dispatch(mut self, enable: bool) -> Self {
        self.direct_dispatch = enable;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn bind_threads(mut self, enable: bool) -> Self {
        self.bind_threads = enable;
        self
    }

    pub fn default_queue_limit(mut self, limit: usize) -> Self {
        self.default_queue_limit = limit;
        self
    }

    pub fn max_queue_limit(mut self, limit: usize) -> Self {
        self.max_queue_limit = limit;
        self
    }

    pub fn registry_lock(mut self, enable: bool) -> Self {
        self.registry_lock = enable;
        self
    }

    pub fn default_affinity(mut self, affinity: Affinity) -> Self {
        self.default_affinity = affinity;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Number of workstreams allowed, never less than one
    pub fn worker_cap(&self) -> usize {
        self.max_threads.clamp(1, MAX_WORKSTREAMS)
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_limit == 0 {
            return Err(ConfigError::InvalidValue("max_queue_limit must be > 0"));
        }
        if self.default_queue_limit == 0 {
            return Err(ConfigError::InvalidValue("default_queue_limit must be > 0"));
        }
        if self.default_queue_limit > self.max_queue_limit {
            return Err(ConfigError::InvalidValue(
                "default_queue_limit must be <= max_queue_limit",
            ));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("flowdisp configuration:");
        eprintln!("  direct_dispatch:      {}", self.direct_dispatch);
        eprintln!("  max_threads:          {}", self.max_threads);
        eprintln!("  bind_threads:         {}", self.bind_threads);
        eprintln!("  default_queue_limit:  {}", self.default_queue_limit);
        eprintln!("  max_queue_limit:      {}", self.max_queue_limit);
        eprintln!("  registry_lock:        {}", self.registry_lock);
        eprintln!("  default_affinity:     {}", self.default_affinity);
        eprintln!("  debug_logging:        {}", self.debug_logging);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for flowdisp_core::DispatchError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => flowdisp_core::DispatchError::InvalidConfig(msg),
        }
    }
}
