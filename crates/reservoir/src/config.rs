//! Pool configuration.
//!
//! A `PoolConfig` is an immutable snapshot taken at pool construction. It
//! can be built in code with the `with_*` methods or loaded from TOML:
//!
//! ```toml
//! name = "orders"
//! initial_size = 2
//! max_active = 20
//! max_wait_ms = 5000
//! test_on_borrow = true
//! validation_query = "SELECT 1"
//! interceptors = ["reset-on-return", "slow-log(threshold_ms=250)"]
//!
//! [connect]
//! url = "postgres://db.local/orders"
//! username = "app"
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::ConnectParams;
use crate::interceptor::InterceptorSpec;

/// Default `max_active` when the configured value is unusable.
const DEFAULT_MAX_ACTIVE: usize = 100;

/// Default abandon timeout, also used when abandonment is enabled with 0.
const DEFAULT_REMOVE_ABANDONED_TIMEOUT_SEC: u64 = 60;

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, used in logs and by the management facade.
    pub name: String,

    /// Connections opened eagerly at construction (default: 10).
    pub initial_size: usize,
    /// Idle floor kept by the sweeper (default: 10).
    pub min_idle: usize,
    /// Idle ceiling; surplus connections are closed on return (default: 100).
    pub max_idle: usize,
    /// Hard cap on open connections, idle plus busy (default: 100).
    pub max_active: usize,

    /// Borrow wait in milliseconds. `0` fails fast, negative waits forever
    /// (default: 30000).
    pub max_wait_ms: i64,
    /// Maximum connection age in milliseconds, `0` disables (default: 0).
    pub max_age_ms: u64,
    /// Idle time after which the sweeper may evict (default: 60000).
    pub min_evictable_idle_time_ms: u64,
    /// Sweeper period, `0` disables the sweeper (default: 5000).
    pub time_between_eviction_runs_ms: u64,
    /// Minimum spacing between borrow-time validations of one connection
    /// (default: 3000).
    pub validation_interval_ms: u64,
    /// Busy time after which a connection counts as abandoned (default: 60).
    pub remove_abandoned_timeout_sec: u64,
    /// Busy time after which a connection is logged as suspect, `0`
    /// disables (default: 0).
    pub suspect_timeout_sec: u64,

    /// Query passed to the backend probe.
    pub validation_query: Option<String>,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_on_connect: bool,
    pub test_while_idle: bool,

    pub remove_abandoned: bool,
    /// Capture the borrower's stack so reclaimed connections can be traced.
    pub log_abandoned: bool,
    /// Only reclaim when at least this percentage of `max_active` is busy
    /// (default: 0, always).
    pub abandon_when_percentage_full: u8,

    /// Interceptors attached to every connection, in order.
    pub interceptors: Vec<InterceptorSpec>,

    /// Statement run once on every new connection.
    pub init_sql: Option<String>,
    /// Parameters for the connection factory.
    pub connect: ConnectParams,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "reservoir".to_string(),
            initial_size: 10,
            min_idle: 10,
            max_idle: 100,
            max_active: DEFAULT_MAX_ACTIVE,
            max_wait_ms: 30_000,
            max_age_ms: 0,
            min_evictable_idle_time_ms: 60_000,
            time_between_eviction_runs_ms: 5_000,
            validation_interval_ms: 3_000,
            remove_abandoned_timeout_sec: DEFAULT_REMOVE_ABANDONED_TIMEOUT_SEC,
            suspect_timeout_sec: 0,
            validation_query: None,
            test_on_borrow: false,
            test_on_return: false,
            test_on_connect: false,
            test_while_idle: false,
            remove_abandoned: false,
            log_abandoned: false,
            abandon_when_percentage_full: 0,
            interceptors: Vec::new(),
            init_sql: None,
            connect: ConnectParams::default(),
        }
    }
}

impl PoolConfig {
    /// Create a config with the given name and sizing, other fields default.
    pub fn new(name: impl Into<String>, max_active: usize) -> Self {
        Self {
            name: name.into(),
            max_active,
            max_idle: max_active,
            initial_size: 0,
            min_idle: 0,
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PoolConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(&self.redacted())?)
    }

    /// Copy safe to hand to monitoring: the password is masked.
    pub fn redacted(&self) -> Self {
        Self {
            connect: self.connect.redacted(),
            ..self.clone()
        }
    }

    /// Clamp inconsistent sizing so the pool invariants can hold.
    ///
    /// Every adjustment is logged at `warn`.
    pub fn normalized(mut self) -> Self {
        if self.max_active < 1 {
            warn!(pool = %self.name, max_active = self.max_active, "max_active must be at least 1, using default");
            self.max_active = DEFAULT_MAX_ACTIVE;
        }
        if self.initial_size > self.max_active {
            warn!(pool = %self.name, initial_size = self.initial_size, max_active = self.max_active, "initial_size larger than max_active");
            self.initial_size = self.max_active;
        }
        if self.max_idle > self.max_active {
            warn!(pool = %self.name, max_idle = self.max_idle, max_active = self.max_active, "max_idle larger than max_active");
            self.max_idle = self.max_active;
        }
        if self.min_idle > self.max_active {
            warn!(pool = %self.name, min_idle = self.min_idle, max_active = self.max_active, "min_idle larger than max_active");
            self.min_idle = self.max_active;
        }
        if self.max_idle < self.min_idle {
            warn!(pool = %self.name, max_idle = self.max_idle, min_idle = self.min_idle, "max_idle smaller than min_idle");
            self.max_idle = self.min_idle;
        }
        if self.remove_abandoned && self.remove_abandoned_timeout_sec == 0 {
            warn!(pool = %self.name, "remove_abandoned_timeout_sec is 0, using default");
            self.remove_abandoned_timeout_sec = DEFAULT_REMOVE_ABANDONED_TIMEOUT_SEC;
        }
        if self.abandon_when_percentage_full > 100 {
            warn!(pool = %self.name, value = self.abandon_when_percentage_full, "abandon_when_percentage_full above 100");
            self.abandon_when_percentage_full = 100;
        }
        self
    }

    /// Borrow wait. `None` means wait indefinitely.
    pub fn max_wait(&self) -> Option<Duration> {
        u64::try_from(self.max_wait_ms).ok().map(Duration::from_millis)
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_ms > 0).then(|| Duration::from_millis(self.max_age_ms))
    }

    pub fn min_evictable_idle_time(&self) -> Duration {
        Duration::from_millis(self.min_evictable_idle_time_ms)
    }

    pub fn time_between_eviction_runs(&self) -> Duration {
        Duration::from_millis(self.time_between_eviction_runs_ms)
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_millis(self.validation_interval_ms)
    }

    pub fn remove_abandoned_timeout(&self) -> Duration {
        Duration::from_secs(self.remove_abandoned_timeout_sec)
    }

    pub fn suspect_timeout(&self) -> Option<Duration> {
        (self.suspect_timeout_sec > 0).then(|| Duration::from_secs(self.suspect_timeout_sec))
    }

    /// Whether the background sweeper has any work to do.
    pub fn is_sweeper_enabled(&self) -> bool {
        self.time_between_eviction_runs_ms > 0
            && ((self.remove_abandoned && self.remove_abandoned_timeout_sec > 0)
                || self.suspect_timeout_sec > 0
                || self.test_while_idle
                || self.min_evictable_idle_time_ms > 0)
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self { name: name.into(), ..self }
    }

    pub fn with_sizing(self, initial_size: usize, min_idle: usize, max_idle: usize, max_active: usize) -> Self {
        Self {
            initial_size,
            min_idle,
            max_idle,
            max_active,
            ..self
        }
    }

    pub fn with_max_wait_ms(self, max_wait_ms: i64) -> Self {
        Self { max_wait_ms, ..self }
    }

    pub fn with_max_age_ms(self, max_age_ms: u64) -> Self {
        Self { max_age_ms, ..self }
    }

    pub fn with_eviction(self, time_between_runs_ms: u64, min_evictable_idle_time_ms: u64) -> Self {
        Self {
            time_between_eviction_runs_ms: time_between_runs_ms,
            min_evictable_idle_time_ms,
            ..self
        }
    }

    pub fn with_validation_query(self, query: impl Into<String>) -> Self {
        Self {
            validation_query: Some(query.into()),
            ..self
        }
    }

    pub fn with_validation_interval_ms(self, validation_interval_ms: u64) -> Self {
        Self {
            validation_interval_ms,
            ..self
        }
    }

    pub fn with_test_on_borrow(self, test_on_borrow: bool) -> Self {
        Self { test_on_borrow, ..self }
    }

    pub fn with_test_on_return(self, test_on_return: bool) -> Self {
        Self { test_on_return, ..self }
    }

    pub fn with_test_on_connect(self, test_on_connect: bool) -> Self {
        Self { test_on_connect, ..self }
    }

    pub fn with_test_while_idle(self, test_while_idle: bool) -> Self {
        Self { test_while_idle, ..self }
    }

    pub fn with_remove_abandoned(self, timeout_sec: u64, log_abandoned: bool) -> Self {
        Self {
            remove_abandoned: true,
            remove_abandoned_timeout_sec: timeout_sec,
            log_abandoned,
            ..self
        }
    }

    pub fn with_abandon_when_percentage_full(self, percentage: u8) -> Self {
        Self {
            abandon_when_percentage_full: percentage,
            ..self
        }
    }

    pub fn with_suspect_timeout_sec(self, suspect_timeout_sec: u64) -> Self {
        Self {
            suspect_timeout_sec,
            ..self
        }
    }

    /// Append interceptors parsed from a `;`-separated list such as
    /// `"reset-on-return;slow-log(threshold_ms=250)"`.
    pub fn with_interceptors(mut self, list: &str) -> Result<Self, crate::PoolError> {
        self.interceptors.extend(InterceptorSpec::parse_list(list)?);
        Ok(self)
    }

    pub fn with_init_sql(self, statement: impl Into<String>) -> Self {
        Self {
            init_sql: Some(statement.into()),
            ..self
        }
    }

    pub fn with_connect(self, connect: ConnectParams) -> Self {
        Self { connect, ..self }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("name", &self.name)
            .field("initial_size", &self.initial_size)
            .field("min_idle", &self.min_idle)
            .field("max_idle", &self.max_idle)
            .field("max_active", &self.max_active)
            .field("max_wait_ms", &self.max_wait_ms)
            .field("max_age_ms", &self.max_age_ms)
            .field("min_evictable_idle_time_ms", &self.min_evictable_idle_time_ms)
            .field("time_between_eviction_runs_ms", &self.time_between_eviction_runs_ms)
            .field("validation_interval_ms", &self.validation_interval_ms)
            .field("remove_abandoned", &self.remove_abandoned)
            .field("remove_abandoned_timeout_sec", &self.remove_abandoned_timeout_sec)
            .field("interceptors", &self.interceptors)
            .field("connect", &self.connect)
            .finish_non_exhaustive()
    }
}
