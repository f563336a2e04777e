//! Connection pool engine.
//!
//! Hands out exclusive leases on physical connections, bounded by
//! `max_active`, and takes them back for reuse.
//!
//! # Architecture
//!
//! ```text
//! borrow()
//!   → idle connection available → max_age / test_on_borrow → lease
//!   → spare capacity            → connect → init_sql → test_on_connect → lease
//!   → pool full                 → FIFO queue until a hand-off, a freed slot
//!                                 or the wait runs out (PoolExhausted)
//! release(lease)
//!   → return hooks → max_age → test_on_return   (failure destroys)
//!     → waiter queued → hand the connection straight over
//!     → otherwise     → idle list (destroyed above max_idle)
//! ```
//!
//! A single `tokio::sync::Mutex` guards the bookkeeping in [`state`]. Every
//! connect, probe and close runs outside it while the connection is counted
//! as pending. That work runs on its own task, so dropping a `borrow`,
//! `release` or sweep future never strands a pending slot.

mod state;

pub use state::PoolLifecycle;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinError;
use tokio::time::Instant;

use crate::backend::ConnectionFactory;
use crate::config::PoolConfig;
use crate::connection::{self, BorrowerTrace, ConnectionInfo, ConnectionState, Lease, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::interceptor::{self, InterceptorChain, InterceptorFactory, Operation, Outcome};
use crate::stats::{PoolStats, SweepReport};
use crate::sweeper::Sweeper;
use crate::validator::{Trigger, Validator};

use state::{DestroyReason, Grant, PoolState};

/// Connect attempts made when new connections keep failing connect-time
/// validation.
const CONNECT_ATTEMPTS: usize = 2;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct PoolInner {
    id: u64,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    interceptors: Vec<Arc<dyn InterceptorFactory>>,
    validator: Validator,
    state: Mutex<PoolState>,
    next_connection: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

/// A bounded pool of connections produced by a [`ConnectionFactory`].
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Builds a [`ConnectionPool`], optionally with custom interceptors.
pub struct PoolBuilder {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    custom: HashMap<String, Arc<dyn InterceptorFactory>>,
}

impl PoolBuilder {
    /// Register an interceptor under `name` so the configuration can
    /// reference it. Takes precedence over a built-in of the same name.
    pub fn interceptor(mut self, name: impl Into<String>, factory: impl InterceptorFactory + 'static) -> Self {
        self.custom.insert(name.into(), Arc::new(factory));
        self
    }

    /// Normalize the configuration, open `initial_size` connections and
    /// start the sweeper when it has work to do.
    pub async fn build(self) -> PoolResult<ConnectionPool> {
        let config = self.config.normalized();
        let interceptors = interceptor::resolve(&config.interceptors, &self.custom)?;

        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                validator: Validator::from_config(&config),
                config,
                factory: self.factory,
                interceptors,
                state: Mutex::new(PoolState::new()),
                next_connection: AtomicU64::new(1),
                sweeper: Mutex::new(None),
            }),
        };

        pool.prefill().await?;

        let config = &pool.inner.config;
        if config.is_sweeper_enabled() {
            let sweeper = Sweeper::spawn(
                Arc::downgrade(&pool.inner),
                config.name.clone(),
                config.time_between_eviction_runs(),
            );
            *pool.inner.sweeper.lock().await = Some(sweeper);
        }

        tracing::info!(
            pool = %config.name,
            pool_id = pool.inner.id,
            initial_size = config.initial_size,
            max_active = config.max_active,
            "connection pool started"
        );
        Ok(pool)
    }
}

enum Step {
    Check(PooledConnection),
    Create,
    Wait(u64, oneshot::Receiver<PoolResult<Grant>>),
}

impl ConnectionPool {
    pub fn builder(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> PoolBuilder {
        PoolBuilder {
            config,
            factory,
            custom: HashMap::new(),
        }
    }

    /// Build a pool with the built-in interceptors only.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> PoolResult<Self> {
        Self::builder(config, factory).build().await
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub fn pool_id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The effective configuration, password masked.
    pub fn config(&self) -> PoolConfig {
        self.inner.config.redacted()
    }

    pub async fn lifecycle(&self) -> PoolLifecycle {
        self.inner.state.lock().await.lifecycle
    }

    // ── Borrow ──────────────────────────────────────────────────────

    /// Borrow a connection, waiting up to the configured `max_wait_ms`.
    pub async fn borrow(&self) -> PoolResult<Lease> {
        self.borrow_timeout(self.inner.config.max_wait()).await
    }

    /// Borrow a connection. `Some(ZERO)` fails immediately when nothing is
    /// available, `None` waits until a connection frees up or the pool
    /// closes.
    pub async fn borrow_timeout(&self, max_wait: Option<Duration>) -> PoolResult<Lease> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = max_wait.and_then(|wait| started.checked_add(wait));
        let mut trace = inner.config.log_abandoned.then(BorrowerTrace::capture);

        loop {
            let step = {
                let mut state = inner.state.lock().await;
                if !state.is_open() {
                    return Err(self.closed_error());
                }
                if let Some(mut conn) = state.idle.pop() {
                    conn.state = ConnectionState::Validating;
                    state.pending += 1;
                    Step::Check(conn)
                } else if state.waiters.is_empty() && state.has_capacity(inner.config.max_active) {
                    state.pending += 1;
                    Step::Create
                } else if max_wait == Some(Duration::ZERO) {
                    state.counters.exhausted += 1;
                    return Err(self.exhausted_error(started));
                } else {
                    let (waiter, rx) = state.enqueue(trace.take());
                    Step::Wait(waiter, rx)
                }
            };

            // From here on a slot is held as pending. The work that settles
            // it runs on its own task so a dropped borrow cannot strand it.
            let settled = match step {
                Step::Check(conn) => {
                    let pool = self.clone();
                    let trace = trace.clone();
                    self.lend_detached(async move { pool.checkout_idle(conn, trace).await })
                        .await?
                }
                Step::Create => self.create_detached(trace.take()).await?,
                Step::Wait(waiter, rx) => {
                    tracing::debug!(pool = %inner.config.name, waiter, "pool full, queued borrower");
                    match self.wait(waiter, rx, deadline, started).await? {
                        Grant::Lease(lease) => Some(lease),
                        Grant::Create(trace) => self.create_detached(trace).await?,
                    }
                }
            };
            if let Some(lease) = settled {
                return Ok(lease);
            }
        }
    }

    async fn create_detached(&self, trace: Option<BorrowerTrace>) -> PoolResult<Option<Lease>> {
        let pool = self.clone();
        self.lend_detached(async move { pool.create_for_borrower(trace).await.map(Some) })
            .await
    }

    /// Run `work` on a separate task and wait for its lease. If the
    /// borrower is gone by the time the lease exists, it is released
    /// straight back to the pool.
    async fn lend_detached<F>(&self, work: F) -> PoolResult<Option<Lease>>
    where
        F: Future<Output = PoolResult<Option<Lease>>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(Ok(Some(lease))) = tx.send(work.await) {
                tracing::debug!(pool = %pool.inner.config.name, lease = lease.id(), "borrower went away, releasing lease");
                if let Err(err) = pool.release(lease).await {
                    tracing::debug!(pool = %pool.inner.config.name, lease = lease.id(), error = %err, "orphaned lease already gone");
                }
            }
        });
        rx.await
            .unwrap_or_else(|_| Err(PoolError::Backend("borrow task ended without a result".to_string())))
    }

    /// Vet an idle connection for lending. `None` means it was destroyed and
    /// the borrower should try again.
    async fn checkout_idle(
        &self,
        mut conn: PooledConnection,
        mut trace: Option<BorrowerTrace>,
    ) -> PoolResult<Option<Lease>> {
        let inner = &self.inner;
        if conn.is_expired(inner.config.max_age(), Instant::now()) {
            self.destroy(conn, DestroyReason::Expired).await;
            return Ok(None);
        }
        if !inner.validator.check(&mut conn, Trigger::Borrow).await {
            self.destroy(conn, DestroyReason::ValidationFailed).await;
            return Ok(None);
        }

        let mut state = inner.state.lock().await;
        if !state.is_open() {
            drop(state);
            self.destroy(conn, DestroyReason::Closing).await;
            return Err(self.closed_error());
        }
        let connection_id = conn.id;
        let lease = state.lend_pending(inner.id, conn, trace.take());
        tracing::debug!(pool = %inner.config.name, lease = lease.id(), connection_id, "reused idle connection");
        Ok(Some(lease))
    }

    /// Open a connection into a slot already reserved for this borrower.
    async fn create_for_borrower(&self, trace: Option<BorrowerTrace>) -> PoolResult<Lease> {
        let inner = &self.inner;
        let conn = match self.open_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                self.release_slots(1).await;
                return Err(err);
            }
        };

        let mut state = inner.state.lock().await;
        state.counters.created += 1;
        if !state.is_open() {
            drop(state);
            self.destroy(conn, DestroyReason::Closing).await;
            return Err(self.closed_error());
        }
        let connection_id = conn.id;
        let lease = state.lend_pending(inner.id, conn, trace);
        tracing::debug!(pool = %inner.config.name, lease = lease.id(), connection_id, "lent new connection");
        Ok(lease)
    }

    /// Create, initialize and validate a new physical connection.
    async fn open_connection(&self) -> PoolResult<PooledConnection> {
        let inner = &self.inner;
        let name = &inner.config.name;

        for attempt in 1..=CONNECT_ATTEMPTS {
            let backend = inner.factory.connect(&inner.config.connect).map_err(|e| {
                tracing::warn!(pool = %name, error = %e, "failed to open connection");
                PoolError::ConnectionFactory(e)
            })?;
            let id = inner.next_connection.fetch_add(1, Ordering::Relaxed);
            let mut conn = PooledConnection::new(id, backend, InterceptorChain::build(&inner.interceptors));

            if let Some(statement) = &inner.config.init_sql {
                if let Err(e) = conn.execute(statement).await {
                    tracing::warn!(pool = %name, connection_id = id, error = %e, "init_sql failed");
                    conn.close().await;
                    return Err(PoolError::ConnectionFactory(format!("init_sql failed: {e}")));
                }
            }

            if inner.validator.check(&mut conn, Trigger::Connect).await {
                tracing::debug!(pool = %name, connection_id = id, "opened connection");
                return Ok(conn);
            }
            tracing::warn!(pool = %name, connection_id = id, attempt, "new connection failed validation");
            conn.close().await;
        }

        Err(PoolError::ValidationFailed(format!(
            "{CONNECT_ATTEMPTS} new connections for pool {name} failed validation"
        )))
    }

    async fn wait(
        &self,
        waiter: u64,
        rx: oneshot::Receiver<PoolResult<Grant>>,
        deadline: Option<Instant>,
        started: Instant,
    ) -> PoolResult<Grant> {
        let mut guard = WaitGuard {
            pool: self.clone(),
            waiter,
            rx: Some(rx),
        };
        let received = match (guard.rx.as_mut(), deadline) {
            (Some(rx), Some(deadline)) => tokio::time::timeout_at(deadline, rx).await.ok(),
            (Some(rx), None) => Some(rx.await),
            (None, _) => None,
        };

        match received {
            Some(result) => {
                guard.rx = None;
                match result {
                    Ok(grant) => grant,
                    Err(_) => Err(self.closed_error()),
                }
            }
            None => {
                // The receiver stays with the guard until the queue entry is
                // gone, so a grant landing meanwhile is never dropped.
                let raced = self.cancel_wait(waiter, guard.rx.as_mut()).await;
                guard.rx = None;
                match raced {
                    Some(grant) => grant,
                    None => {
                        self.inner.state.lock().await.counters.exhausted += 1;
                        tracing::debug!(pool = %self.inner.config.name, waiter, "borrow timed out");
                        Err(self.exhausted_error(started))
                    }
                }
            }
        }
    }

    /// Leave the wait queue. A grant that raced in before the lock was
    /// taken is returned so it is not lost.
    async fn cancel_wait(
        &self,
        waiter: u64,
        rx: Option<&mut oneshot::Receiver<PoolResult<Grant>>>,
    ) -> Option<PoolResult<Grant>> {
        let mut state = self.inner.state.lock().await;
        if state.dequeue(waiter) {
            return None;
        }
        rx.and_then(|rx| rx.try_recv().ok())
    }

    /// Give back a grant whose borrower went away.
    async fn reclaim_grant(&self, grant: Grant) {
        match grant {
            Grant::Lease(lease) => {
                if let Err(err) = self.release(lease).await {
                    tracing::debug!(pool = %self.inner.config.name, lease = lease.id(), error = %err, "orphaned lease already gone");
                }
            }
            Grant::Create(_) => self.release_slots(1).await,
        }
    }

    // ── Release ─────────────────────────────────────────────────────

    /// Return a borrowed connection.
    ///
    /// Failing return hooks or validation destroy the connection; the
    /// return itself still succeeds.
    pub async fn release(&self, lease: Lease) -> PoolResult<()> {
        let inner = &self.inner;
        let (conn, open) = {
            let mut state = inner.state.lock().await;
            let conn = state.take_busy(inner.id, lease)?;
            (conn, state.is_open())
        };

        // The connection is pending now; finish on a task the caller
        // cannot cancel.
        let pool = self.clone();
        detached(async move { pool.settle_returned(lease, conn, open).await })
            .await
            .map_err(|err| PoolError::Backend(format!("release task failed: {err}")))
    }

    async fn settle_returned(&self, lease: Lease, mut conn: PooledConnection, open: bool) {
        let inner = &self.inner;
        conn.state = ConnectionState::Validating;

        let verdict = if open {
            self.vet_returned(&mut conn).await
        } else {
            Some(DestroyReason::Closing)
        };
        if let Some(reason) = verdict {
            self.destroy(conn, reason).await;
            return;
        }

        let surplus = {
            let mut state = inner.state.lock().await;
            let open = state.is_open();
            state
                .place(inner.id, conn, inner.config.max_idle)
                .map(|conn| (conn, if open { DestroyReason::Surplus } else { DestroyReason::Closing }))
        };
        if let Some((conn, reason)) = surplus {
            self.destroy(conn, reason).await;
        }

        tracing::debug!(pool = %inner.config.name, lease = lease.id(), "released connection");
    }

    async fn vet_returned(&self, conn: &mut PooledConnection) -> Option<DestroyReason> {
        let inner = &self.inner;
        if let Err((interceptor, reason)) = conn.on_return().await {
            tracing::warn!(
                pool = %inner.config.name,
                connection_id = conn.id,
                interceptor = %interceptor,
                reason = %reason,
                "return hook failed"
            );
            return Some(DestroyReason::Rejected);
        }
        if conn.is_expired(inner.config.max_age(), Instant::now()) {
            return Some(DestroyReason::Expired);
        }
        if !inner.validator.check(conn, Trigger::Return).await {
            return Some(DestroyReason::ValidationFailed);
        }
        None
    }

    // ── Proxied operations ──────────────────────────────────────────

    /// Send bytes through the leased connection's interceptor chain.
    pub async fn send(&self, lease: Lease, data: &[u8]) -> PoolResult<usize> {
        match self.proxy(lease, Operation::Send(data)).await? {
            Outcome::Sent(n) => Ok(n),
            Outcome::Received(_) => Err(PoolError::Backend("interceptor returned a recv result for send".to_string())),
        }
    }

    /// Receive up to `max_bytes` from the leased connection.
    pub async fn recv(&self, lease: Lease, max_bytes: usize) -> PoolResult<Vec<u8>> {
        match self.proxy(lease, Operation::Recv { max_bytes }).await? {
            Outcome::Received(data) => Ok(data),
            Outcome::Sent(_) => Err(PoolError::Backend("interceptor returned a send result for recv".to_string())),
        }
    }

    /// Metadata of a leased connection.
    pub async fn info(&self, lease: Lease) -> PoolResult<ConnectionInfo> {
        let state = self.inner.state.lock().await;
        state.busy(self.inner.id, lease).map(PooledConnection::info)
    }

    async fn proxy(&self, lease: Lease, op: Operation<'_>) -> PoolResult<Outcome> {
        let (physical, info) = {
            let state = self.inner.state.lock().await;
            let conn = state.busy(self.inner.id, lease)?;
            (conn.physical(), conn.info())
        };
        let result = connection::invoke(&physical, &info, lease, op).await;
        if let Err(err) = &result {
            tracing::debug!(
                pool = %self.inner.config.name,
                lease = lease.id(),
                operation = op.kind(),
                error = %err,
                "proxied operation failed"
            );
        }
        result
    }

    // ── Close ───────────────────────────────────────────────────────

    /// Close the pool. Waiters fail with `PoolClosed`, idle connections are
    /// destroyed now and busy ones when they are returned. Idempotent.
    pub async fn close(&self) {
        let pool = self.clone();
        if let Err(err) = detached(async move { pool.shutdown().await }).await {
            tracing::warn!(pool = %self.inner.config.name, error = %err, "pool shutdown task failed");
        }
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        let idle = {
            let mut state = inner.state.lock().await;
            if !state.is_open() {
                return;
            }
            state.lifecycle = PoolLifecycle::Closing;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(Err(PoolError::PoolClosed(inner.config.name.clone())));
            }
            state.take_idle()
        };

        if let Some(sweeper) = inner.sweeper.lock().await.take() {
            sweeper.stop();
        }

        tracing::info!(pool = %inner.config.name, idle = idle.len(), "closing connection pool");
        for conn in idle {
            self.destroy(conn, DestroyReason::Closing).await;
        }

        let mut state = inner.state.lock().await;
        self.finish_close(&mut state);
    }

    // ── Sweeps ──────────────────────────────────────────────────────

    /// One full sweeper pass: idle validation, idle eviction and top-up,
    /// then abandonment and suspect checks.
    pub async fn sweep(&self) -> SweepReport {
        let config = &self.inner.config;
        let mut report = SweepReport::default();
        if config.test_while_idle {
            report = report.merge(self.test_idle().await);
        }
        report = report.merge(self.check_idle().await);
        if config.remove_abandoned || config.suspect_timeout().is_some() {
            report = report.merge(self.check_abandoned().await);
        }
        report
    }

    /// Probe every idle connection now and destroy the ones that fail.
    ///
    /// Connections stay in the idle list while they are checked, so
    /// borrowers can still take them; a borrower that does simply waits on
    /// the connection's own lock until the check is done.
    pub async fn test_idle(&self) -> SweepReport {
        let pool = self.clone();
        detached(async move { pool.validate_idle_in_place().await }).await.unwrap_or_default()
    }

    async fn validate_idle_in_place(&self) -> SweepReport {
        let inner = &self.inner;
        let targets = {
            let state = inner.state.lock().await;
            if !state.is_open() {
                return SweepReport::default();
            }
            state.idle_handles()
        };

        let mut report = SweepReport::default();
        for (connection_id, physical) in targets {
            report.validated += 1;
            let healthy = inner.validator.check_in_place(connection_id, &physical, Trigger::Idle).await;
            let failed = inner
                .state
                .lock()
                .await
                .settle_idle_check(connection_id, healthy, Instant::now());
            if let Some(conn) = failed {
                report.invalid += 1;
                self.destroy(conn, DestroyReason::ValidationFailed).await;
            }
        }
        report
    }

    /// Evict stale, expired and surplus idle connections, then top the
    /// idle list back up to `min_idle`.
    pub async fn check_idle(&self) -> SweepReport {
        let pool = self.clone();
        detached(async move { pool.evict_idle().await }).await.unwrap_or_default()
    }

    async fn evict_idle(&self) -> SweepReport {
        let inner = &self.inner;
        let config = &inner.config;
        let victims = {
            let mut state = inner.state.lock().await;
            if !state.is_open() {
                return SweepReport::default();
            }
            state.select_evictions(
                Instant::now(),
                config.min_evictable_idle_time(),
                config.max_age(),
                config.min_idle,
                config.max_idle,
            )
        };

        let mut report = SweepReport {
            evicted: victims.len(),
            ..SweepReport::default()
        };
        for (conn, reason) in victims {
            self.destroy(conn, reason).await;
        }
        report.replenished = self.replenish().await;
        report
    }

    async fn replenish(&self) -> usize {
        let inner = &self.inner;
        let wanted = inner
            .state
            .lock()
            .await
            .reserve_top_up(inner.config.min_idle, inner.config.max_active);

        let mut opened = 0;
        for attempt in 0..wanted {
            let conn = match self.open_connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(pool = %inner.config.name, error = %err, "failed to replenish idle connections");
                    self.release_slots(wanted - attempt).await;
                    break;
                }
            };
            opened += 1;
            let surplus = {
                let mut state = inner.state.lock().await;
                state.counters.created += 1;
                let open = state.is_open();
                state
                    .place(inner.id, conn, inner.config.max_idle)
                    .map(|conn| (conn, if open { DestroyReason::Surplus } else { DestroyReason::Closing }))
            };
            if let Some((conn, reason)) = surplus {
                self.destroy(conn, reason).await;
            }
        }
        opened
    }

    /// Reclaim connections held past `remove_abandoned_timeout_sec` and log
    /// the ones past `suspect_timeout_sec`.
    pub async fn check_abandoned(&self) -> SweepReport {
        let pool = self.clone();
        detached(async move { pool.reclaim_abandoned().await }).await.unwrap_or_default()
    }

    async fn reclaim_abandoned(&self) -> SweepReport {
        let inner = &self.inner;
        let config = &inner.config;
        let now = Instant::now();
        let (reclaimed, suspects) = {
            let mut state = inner.state.lock().await;
            if !state.is_open() {
                return SweepReport::default();
            }
            let reclaimed = if config.remove_abandoned {
                state.select_abandoned(
                    now,
                    config.remove_abandoned_timeout(),
                    config.abandon_when_percentage_full,
                    config.max_active,
                )
            } else {
                Vec::new()
            };
            let suspects = match config.suspect_timeout() {
                Some(threshold) => state.select_suspects(now, threshold),
                None => Vec::new(),
            };
            (reclaimed, suspects)
        };

        for suspect in &suspects {
            let thread = suspect.trace.as_ref().and_then(|t| t.thread.as_deref()).unwrap_or("unknown");
            tracing::warn!(
                pool = %config.name,
                lease = suspect.lease,
                connection_id = suspect.connection_id,
                busy_ms = suspect.busy_for.as_millis() as u64,
                borrowed_by = thread,
                "connection held longer than suspect timeout"
            );
        }

        let report = SweepReport {
            abandoned: reclaimed.len(),
            suspect: suspects.len(),
            ..SweepReport::default()
        };
        for (lease, conn) in reclaimed {
            let busy_ms = conn.busy_time(now).as_millis() as u64;
            match (&conn.trace, config.log_abandoned) {
                (Some(trace), true) => tracing::warn!(
                    pool = %config.name,
                    lease,
                    connection_id = conn.id,
                    busy_ms,
                    borrowed_by = trace.thread.as_deref().unwrap_or("unknown"),
                    backtrace = %trace.backtrace,
                    "reclaimed abandoned connection"
                ),
                _ => tracing::warn!(
                    pool = %config.name,
                    lease,
                    connection_id = conn.id,
                    busy_ms,
                    "reclaimed abandoned connection"
                ),
            }
            self.destroy(conn, DestroyReason::Abandoned).await;
        }
        report
    }

    // ── Stats ───────────────────────────────────────────────────────

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            name: self.inner.config.name.clone(),
            active: state.busy.len(),
            idle: state.idle.len(),
            pending: state.pending,
            waiting: state.waiters.len(),
            size: state.size(),
            max_active: self.inner.config.max_active,
            ..PoolStats::default()
        }
        .apply(&state.counters)
    }

    /// Log pool statistics at `tracing::info` level.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        tracing::info!(
            pool = %stats.name,
            active = stats.active,
            idle = stats.idle,
            pending = stats.pending,
            waiting = stats.waiting,
            size = stats.size,
            max_active = stats.max_active,
            created = stats.created,
            destroyed = stats.destroyed,
            borrowed = stats.borrowed,
            wait_count = stats.wait_count,
            exhausted = stats.exhausted,
            validation_failures = stats.validation_failures,
            abandoned = stats.abandoned,
            evicted = stats.evicted,
            "pool statistics"
        );
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Close a pending connection and free its slot.
    async fn destroy(&self, mut conn: PooledConnection, reason: DestroyReason) {
        tracing::debug!(
            pool = %self.inner.config.name,
            connection_id = conn.id,
            reason = reason.as_str(),
            "destroying connection"
        );
        conn.close().await;
        let mut state = self.inner.state.lock().await;
        state.destroyed(reason, self.inner.config.max_active);
        self.finish_close(&mut state);
    }

    async fn release_slots(&self, count: usize) {
        let mut state = self.inner.state.lock().await;
        for _ in 0..count {
            state.release_slot(self.inner.config.max_active);
        }
        self.finish_close(&mut state);
    }

    fn finish_close(&self, state: &mut PoolState) {
        if state.finish_close() {
            tracing::info!(pool = %self.inner.config.name, "connection pool closed");
        }
    }

    /// Open `initial_size` connections; any failure closes the pool.
    async fn prefill(&self) -> PoolResult<()> {
        let inner = &self.inner;
        let initial = inner.config.initial_size;
        inner.state.lock().await.pending += initial;

        for opened in 0..initial {
            match self.open_connection().await {
                Ok(mut conn) => {
                    let mut state = inner.state.lock().await;
                    state.counters.created += 1;
                    state.pending -= 1;
                    conn.mark_idle();
                    state.idle.push(conn);
                }
                Err(err) => {
                    tracing::error!(pool = %inner.config.name, opened, error = %err, "failed to open initial connections");
                    self.release_slots(initial - opened).await;
                    self.close().await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed(self.inner.config.name.clone())
    }

    fn exhausted_error(&self, started: Instant) -> PoolError {
        PoolError::PoolExhausted {
            pool: self.inner.config.name.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Await `work` on its own task. Dropping the returned future leaves the
/// task running, so connections it holds as pending are always settled.
/// Panics resume on the caller.
async fn detached<F>(work: F) -> Result<F::Output, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(work).await.map_err(|err| {
        if err.is_panic() {
            std::panic::resume_unwind(err.into_panic());
        }
        err
    })
}

/// Returns a grant to the pool when a queued borrow is dropped mid-wait.
struct WaitGuard {
    pool: ConnectionPool,
    waiter: u64,
    rx: Option<oneshot::Receiver<PoolResult<Grant>>>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let waiter = self.waiter;
        runtime.spawn(async move {
            if let Some(Ok(grant)) = pool.cancel_wait(waiter, Some(&mut rx)).await {
                pool.reclaim_grant(grant).await;
            }
        });
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("interceptors", &self.inner.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
