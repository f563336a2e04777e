//! Pooled connection: one physical handle plus pool metadata.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::ConnectionBackend;
use crate::error::{PoolError, PoolResult};
use crate::interceptor::{InterceptorChain, Operation, Outcome};

/// Proof that the caller currently owns a borrowed connection.
///
/// Lease ids are never reused, so the pool can tell a live lease from one
/// that was already returned or reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Lease {
    pool_id: u64,
    id: u64,
}

impl Lease {
    pub(crate) fn new(pool_id: u64, id: u64) -> Self {
        Self { pool_id, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool_id, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Busy,
    Validating,
    Closed,
}

/// Where and when a connection was borrowed. Only captured when
/// `log_abandoned` is set.
#[derive(Debug, Clone)]
pub struct BorrowerTrace {
    pub thread: Option<String>,
    pub borrowed_at: SystemTime,
    pub backtrace: String,
}

impl BorrowerTrace {
    pub(crate) fn capture() -> Self {
        Self {
            thread: std::thread::current().name().map(str::to_string),
            borrowed_at: SystemTime::now(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

/// Read-only snapshot of a pooled connection's metadata.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_borrowed_at: Option<Instant>,
    pub last_returned_at: Instant,
    pub last_validated_at: Option<Instant>,
    pub use_count: u64,
}

impl ConnectionInfo {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnectionState::Busy,
            created_at: now,
            last_borrowed_at: Some(now),
            last_returned_at: now,
            last_validated_at: None,
            use_count: 0,
        }
    }
}

/// The physical side of a connection: backend and interceptor chain.
///
/// Lives behind its own lock so caller I/O never holds the pool-wide lock.
#[derive(Debug)]
pub(crate) struct Physical {
    backend: Box<dyn ConnectionBackend>,
    chain: InterceptorChain,
    closed: bool,
}

/// A connection owned by the pool.
///
/// At any time it sits in exactly one of: the idle list, the busy map, or
/// the hands of a pool operation that has it counted as pending.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    pub(crate) id: u64,
    pub(crate) state: ConnectionState,
    pub(crate) created_at: Instant,
    pub(crate) last_borrowed_at: Option<Instant>,
    pub(crate) last_returned_at: Instant,
    pub(crate) last_validated_at: Option<Instant>,
    pub(crate) use_count: u64,
    pub(crate) trace: Option<BorrowerTrace>,
    pub(crate) suspect_logged: bool,
    physical: Arc<Mutex<Physical>>,
}

impl PooledConnection {
    pub(crate) fn new(id: u64, backend: Box<dyn ConnectionBackend>, chain: InterceptorChain) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnectionState::Validating,
            created_at: now,
            last_borrowed_at: None,
            last_returned_at: now,
            last_validated_at: None,
            use_count: 0,
            trace: None,
            suspect_logged: false,
            physical: Arc::new(Mutex::new(Physical {
                backend,
                chain,
                closed: false,
            })),
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            last_borrowed_at: self.last_borrowed_at,
            last_returned_at: self.last_returned_at,
            last_validated_at: self.last_validated_at,
            use_count: self.use_count,
        }
    }

    pub(crate) fn physical(&self) -> Arc<Mutex<Physical>> {
        Arc::clone(&self.physical)
    }

    pub(crate) fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_returned_at)
    }

    pub(crate) fn busy_time(&self, now: Instant) -> Duration {
        self.last_borrowed_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }

    pub(crate) fn is_expired(&self, max_age: Option<Duration>, now: Instant) -> bool {
        max_age.is_some_and(|max| now.saturating_duration_since(self.created_at) > max)
    }

    /// Transition into the busy state for a new borrower.
    pub(crate) fn mark_borrowed(&mut self, trace: Option<BorrowerTrace>) {
        self.state = ConnectionState::Busy;
        self.last_borrowed_at = Some(Instant::now());
        self.use_count += 1;
        self.suspect_logged = false;
        self.trace = trace;
    }

    /// Undo [`mark_borrowed`](Self::mark_borrowed) for a hand-off nobody received.
    pub(crate) fn unmark_borrowed(&mut self) {
        self.state = ConnectionState::Validating;
        self.use_count = self.use_count.saturating_sub(1);
        self.trace = None;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.last_returned_at = Instant::now();
        self.trace = None;
    }

    pub(crate) async fn probe(&self, query: Option<&str>) -> bool {
        ping_physical(&self.physical, query).await
    }

    pub(crate) async fn execute(&self, statement: &str) -> Result<(), String> {
        self.physical.lock().await.backend.execute(statement)
    }

    /// Run the chain's pre-return hooks.
    pub(crate) async fn on_return(&self) -> Result<(), (String, String)> {
        let info = self.info();
        let mut physical = self.physical.lock().await;
        let Physical { backend, chain, .. } = &mut *physical;
        chain.on_return(&info, backend.as_mut())
    }

    /// Physically close the handle. Later proxied operations fail fast.
    pub(crate) async fn close(&mut self) {
        self.state = ConnectionState::Closed;
        let info = self.info();
        let mut physical = self.physical.lock().await;
        if !physical.closed {
            physical.chain.on_close(&info);
            physical.backend.close();
            physical.closed = true;
        }
    }
}

/// Liveness probe on a physical handle. A closed handle is never healthy.
pub(crate) async fn ping_physical(physical: &Mutex<Physical>, query: Option<&str>) -> bool {
    let mut physical = physical.lock().await;
    !physical.closed && physical.backend.ping(query)
}

/// Run a proxied operation on a physical handle captured from the busy map.
pub(crate) async fn invoke(
    physical: &Mutex<Physical>,
    info: &ConnectionInfo,
    lease: Lease,
    op: Operation<'_>,
) -> PoolResult<Outcome> {
    let mut physical = physical.lock().await;
    if physical.closed {
        return Err(PoolError::Abandoned(lease.id()));
    }
    let Physical { backend, chain, .. } = &mut *physical;
    chain.invoke(info, op, backend.as_mut())
}
