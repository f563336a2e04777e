//! Connection validation policy.
//!
//! Four independently enabled trigger points. Borrow-time probes are
//! rate-limited per connection by `validation_interval`; the others always
//! probe when enabled.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::{self, Physical, PooledConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    Borrow,
    Return,
    Idle,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Connect => "connect",
            Trigger::Borrow => "borrow",
            Trigger::Return => "return",
            Trigger::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    query: Option<String>,
    interval: Duration,
    on_connect: bool,
    on_borrow: bool,
    on_return: bool,
    while_idle: bool,
}

impl Validator {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            query: config.validation_query.clone(),
            interval: config.validation_interval(),
            on_connect: config.test_on_connect,
            on_borrow: config.test_on_borrow,
            on_return: config.test_on_return,
            while_idle: config.test_while_idle,
        }
    }

    pub fn is_enabled(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Connect => self.on_connect,
            Trigger::Borrow => self.on_borrow,
            Trigger::Return => self.on_return,
            Trigger::Idle => self.while_idle,
        }
    }

    /// Whether a probe is due. A never-validated connection is always due.
    pub fn is_due(&self, trigger: Trigger, last_validated_at: Option<Instant>, now: Instant) -> bool {
        if !self.is_enabled(trigger) {
            return false;
        }
        match (trigger, last_validated_at) {
            (Trigger::Borrow, Some(at)) => now.saturating_duration_since(at) >= self.interval,
            _ => true,
        }
    }

    /// Probe `conn` if due at `trigger`. Returns `false` only when a probe
    /// ran and failed.
    pub(crate) async fn check(&self, conn: &mut PooledConnection, trigger: Trigger) -> bool {
        if !self.is_due(trigger, conn.last_validated_at, Instant::now()) {
            return true;
        }
        self.validate(conn, trigger).await
    }

    /// Validate a physical handle that stays in the idle list meanwhile. The
    /// caller records the outcome.
    pub(crate) async fn check_in_place(&self, connection_id: u64, physical: &Mutex<Physical>, trigger: Trigger) -> bool {
        let healthy = connection::ping_physical(physical, self.query.as_deref()).await;
        if !healthy {
            debug!(connection_id, trigger = trigger.as_str(), "connection failed validation");
        }
        healthy
    }

    /// Probe `conn` unconditionally.
    pub(crate) async fn validate(&self, conn: &mut PooledConnection, trigger: Trigger) -> bool {
        let healthy = conn.probe(self.query.as_deref()).await;
        if healthy {
            conn.last_validated_at = Some(Instant::now());
        } else {
            debug!(connection_id = conn.id, trigger = trigger.as_str(), "connection failed validation");
        }
        healthy
    }
}
