//! Lock-protected pool bookkeeping.
//!
//! Everything here runs while the pool mutex is held and never awaits.
//! Slow work (connect, probe, close) happens outside the lock on
//! connections that are counted in `pending`, so that
//! `busy + idle + pending` is the number of slots in use and never exceeds
//! `max_active`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

use crate::connection::{BorrowerTrace, ConnectionState, Lease, Physical, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::stats::Counters;

/// Reclaimed leases remembered for reporting `Abandoned`. Borrowers that
/// leaked a connection usually never come back, so older entries are
/// forgotten and later report `AlreadyReturned`.
pub(crate) const RECLAIMED_CAPACITY: usize = 1024;

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolLifecycle {
    Open,
    /// Rejecting borrows; busy connections are destroyed as they come back.
    Closing,
    Closed,
}

/// What a queued borrower receives when it is woken.
#[derive(Debug)]
pub(crate) enum Grant {
    /// A connection already moved into the busy map for this borrower.
    Lease(Lease),
    /// A reserved slot: the borrower opens its own connection.
    Create(Option<BorrowerTrace>),
}

#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) trace: Option<BorrowerTrace>,
    pub(crate) tx: oneshot::Sender<PoolResult<Grant>>,
}

/// Why a connection is being destroyed. Drives the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DestroyReason {
    ValidationFailed,
    Expired,
    Evicted,
    Surplus,
    Abandoned,
    Rejected,
    Closing,
}

impl DestroyReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            DestroyReason::ValidationFailed => "validation failed",
            DestroyReason::Expired => "max age exceeded",
            DestroyReason::Evicted => "idle too long",
            DestroyReason::Surplus => "idle ceiling reached",
            DestroyReason::Abandoned => "abandoned",
            DestroyReason::Rejected => "return hook failed",
            DestroyReason::Closing => "pool closing",
        }
    }
}

/// A busy connection that crossed the suspect threshold.
#[derive(Debug)]
pub(crate) struct Suspect {
    pub(crate) lease: u64,
    pub(crate) connection_id: u64,
    pub(crate) busy_for: Duration,
    pub(crate) trace: Option<BorrowerTrace>,
}

#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) lifecycle: PoolLifecycle,
    /// Least recently used at index 0, most recently returned at the end.
    pub(crate) idle: Vec<PooledConnection>,
    /// Borrowed connections keyed by lease id.
    pub(crate) busy: HashMap<u64, PooledConnection>,
    pub(crate) pending: usize,
    pub(crate) waiters: VecDeque<Waiter>,
    /// Leases reclaimed by the abandonment check and not yet returned,
    /// oldest first, capped at [`RECLAIMED_CAPACITY`].
    pub(crate) reclaimed: VecDeque<u64>,
    pub(crate) next_lease: u64,
    pub(crate) next_waiter: u64,
    pub(crate) counters: Counters,
}

impl PoolState {
    pub(crate) fn new() -> Self {
        Self {
            lifecycle: PoolLifecycle::Open,
            idle: Vec::new(),
            busy: HashMap::new(),
            pending: 0,
            waiters: VecDeque::new(),
            reclaimed: VecDeque::new(),
            next_lease: 1,
            next_waiter: 1,
            counters: Counters::default(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lifecycle == PoolLifecycle::Open
    }

    /// Slots in use: busy, idle and in-flight.
    pub(crate) fn size(&self) -> usize {
        self.busy.len() + self.idle.len() + self.pending
    }

    pub(crate) fn has_capacity(&self, max_active: usize) -> bool {
        self.size() < max_active
    }

    /// Queue a borrower. Returns its waiter id and the receiving end.
    pub(crate) fn enqueue(
        &mut self,
        trace: Option<BorrowerTrace>,
    ) -> (u64, oneshot::Receiver<PoolResult<Grant>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.counters.wait_count += 1;
        self.waiters.push_back(Waiter { id, trace, tx });
        (id, rx)
    }

    /// Remove a waiter that gave up. Returns `false` when it was already
    /// woken, in which case its grant sits in the receiver.
    pub(crate) fn dequeue(&mut self, waiter: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == waiter) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Move a connection into the busy map under a fresh lease.
    pub(crate) fn lend(
        &mut self,
        pool_id: u64,
        mut conn: PooledConnection,
        trace: Option<BorrowerTrace>,
    ) -> Lease {
        let lease = Lease::new(pool_id, self.next_lease);
        self.next_lease += 1;
        conn.mark_borrowed(trace);
        self.busy.insert(lease.id(), conn);
        self.counters.borrowed += 1;
        lease
    }

    /// Lend a connection that was counted as pending.
    pub(crate) fn lend_pending(
        &mut self,
        pool_id: u64,
        conn: PooledConnection,
        trace: Option<BorrowerTrace>,
    ) -> Lease {
        self.pending = self.pending.saturating_sub(1);
        self.lend(pool_id, conn, trace)
    }

    fn unlend(&mut self, lease: Lease) -> Option<PooledConnection> {
        let mut conn = self.busy.remove(&lease.id())?;
        conn.unmark_borrowed();
        self.counters.borrowed = self.counters.borrowed.saturating_sub(1);
        Some(conn)
    }

    /// Give a pending connection to the first live waiter, oldest first.
    /// Hands the connection back when nobody is waiting.
    pub(crate) fn hand_off(
        &mut self,
        pool_id: u64,
        mut conn: PooledConnection,
    ) -> Result<(), PooledConnection> {
        while let Some(mut waiter) = self.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            let lease = self.lend_pending(pool_id, conn, waiter.trace.take());
            match waiter.tx.send(Ok(Grant::Lease(lease))) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    self.pending += 1;
                    conn = match self.unlend(lease) {
                        Some(conn) => conn,
                        None => return Ok(()),
                    };
                }
            }
        }
        Err(conn)
    }

    /// Settle a pending connection that survived its checks: hand it to a
    /// waiter, else park it idle. Returns it when it must be destroyed
    /// instead, because the pool is closing or the idle ceiling is reached.
    pub(crate) fn place(
        &mut self,
        pool_id: u64,
        conn: PooledConnection,
        max_idle: usize,
    ) -> Option<PooledConnection> {
        if !self.is_open() {
            return Some(conn);
        }
        let mut conn = match self.hand_off(pool_id, conn) {
            Ok(()) => return None,
            Err(conn) => conn,
        };
        if self.idle.len() >= max_idle {
            return Some(conn);
        }
        conn.mark_idle();
        self.idle.push(conn);
        self.pending = self.pending.saturating_sub(1);
        None
    }

    /// Physical handles of the idle connections, oldest first, for probing
    /// in place.
    pub(crate) fn idle_handles(&self) -> Vec<(u64, Arc<Mutex<Physical>>)> {
        self.idle.iter().map(|conn| (conn.id, conn.physical())).collect()
    }

    /// Record the outcome of an in-place idle check. A connection a
    /// borrower claimed meanwhile is left alone. A failed one is pulled out
    /// as pending and returned for destruction.
    pub(crate) fn settle_idle_check(
        &mut self,
        connection_id: u64,
        healthy: bool,
        now: Instant,
    ) -> Option<PooledConnection> {
        let pos = self.idle.iter().position(|conn| conn.id == connection_id)?;
        if healthy {
            self.idle[pos].last_validated_at = Some(now);
            return None;
        }
        let mut conn = self.idle.remove(pos);
        conn.state = ConnectionState::Validating;
        self.pending += 1;
        Some(conn)
    }

    /// Take every idle connection out, oldest first, counted as pending.
    pub(crate) fn take_idle(&mut self) -> Vec<PooledConnection> {
        let batch: Vec<PooledConnection> = self
            .idle
            .drain(..)
            .map(|mut conn| {
                conn.state = ConnectionState::Validating;
                conn
            })
            .collect();
        self.pending += batch.len();
        batch
    }

    /// Account for a destroyed pending connection and let the freed slot
    /// go to the head waiter.
    pub(crate) fn destroyed(&mut self, reason: DestroyReason, max_active: usize) {
        self.pending = self.pending.saturating_sub(1);
        self.counters.destroyed += 1;
        match reason {
            DestroyReason::ValidationFailed => self.counters.validation_failures += 1,
            DestroyReason::Evicted | DestroyReason::Expired | DestroyReason::Surplus => {
                self.counters.evicted += 1
            }
            _ => {}
        }
        self.grant_capacity(max_active);
    }

    /// Release a reserved slot whose connection never materialized.
    pub(crate) fn release_slot(&mut self, max_active: usize) {
        self.pending = self.pending.saturating_sub(1);
        self.grant_capacity(max_active);
    }

    /// Hand free slots to waiters as creation grants.
    pub(crate) fn grant_capacity(&mut self, max_active: usize) {
        if !self.is_open() {
            return;
        }
        while self.has_capacity(max_active) {
            let Some(mut waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(Ok(Grant::Create(waiter.trace.take()))).is_ok() {
                self.pending += 1;
            }
        }
    }

    /// Finish a close once every slot has drained. Returns `true` on the
    /// transition.
    pub(crate) fn finish_close(&mut self) -> bool {
        if self.lifecycle == PoolLifecycle::Closing && self.size() == 0 {
            self.lifecycle = PoolLifecycle::Closed;
            return true;
        }
        false
    }

    /// Error for a lease that is not in the busy map.
    pub(crate) fn lease_error(&self, pool_id: u64, lease: Lease) -> PoolError {
        if lease.pool_id() != pool_id {
            PoolError::UnknownConnection(lease.id())
        } else if self.reclaimed.contains(&lease.id()) {
            PoolError::Abandoned(lease.id())
        } else if lease.id() < self.next_lease {
            PoolError::AlreadyReturned(lease.id())
        } else {
            PoolError::UnknownConnection(lease.id())
        }
    }

    /// Look up a live lease.
    pub(crate) fn busy(&self, pool_id: u64, lease: Lease) -> PoolResult<&PooledConnection> {
        match self.busy.get(&lease.id()) {
            Some(conn) if lease.pool_id() == pool_id => Ok(conn),
            _ => Err(self.lease_error(pool_id, lease)),
        }
    }

    /// Remove a live lease from the busy map for return. A reclaimed lease
    /// reports `Abandoned` once and is then forgotten.
    pub(crate) fn take_busy(&mut self, pool_id: u64, lease: Lease) -> PoolResult<PooledConnection> {
        if lease.pool_id() == pool_id {
            if let Some(conn) = self.busy.remove(&lease.id()) {
                self.pending += 1;
                self.counters.returned += 1;
                return Ok(conn);
            }
        }
        let err = self.lease_error(pool_id, lease);
        if matches!(err, PoolError::Abandoned(_)) {
            self.reclaimed.retain(|id| *id != lease.id());
        }
        Err(err)
    }

    /// Pull out idle connections the sweeper should close, least recently
    /// used first.
    ///
    /// Expired connections and anything above `max_idle` always go. Idle
    /// time eviction stops at the `min_idle` floor.
    pub(crate) fn select_evictions(
        &mut self,
        now: Instant,
        min_evictable: Duration,
        max_age: Option<Duration>,
        min_idle: usize,
        max_idle: usize,
    ) -> Vec<(PooledConnection, DestroyReason)> {
        let mut victims = Vec::new();
        let mut i = 0;
        while i < self.idle.len() {
            let conn = &self.idle[i];
            let reason = if conn.is_expired(max_age, now) {
                Some(DestroyReason::Expired)
            } else if self.idle.len() > max_idle {
                Some(DestroyReason::Surplus)
            } else if self.idle.len() > min_idle && conn.idle_time(now) > min_evictable {
                Some(DestroyReason::Evicted)
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    let mut conn = self.idle.remove(i);
                    conn.state = ConnectionState::Validating;
                    victims.push((conn, reason));
                }
                None => i += 1,
            }
        }
        self.pending += victims.len();
        victims
    }

    /// Reserve slots to bring the idle list back up to `min_idle`.
    pub(crate) fn reserve_top_up(&mut self, min_idle: usize, max_active: usize) -> usize {
        if !self.is_open() || !self.waiters.is_empty() {
            return 0;
        }
        let missing = min_idle.saturating_sub(self.idle.len());
        let room = max_active.saturating_sub(self.size());
        let wanted = missing.min(room);
        self.pending += wanted;
        wanted
    }

    /// Pull out busy connections held past `timeout`. Their leases are
    /// remembered so the borrower later gets `Abandoned`.
    pub(crate) fn select_abandoned(
        &mut self,
        now: Instant,
        timeout: Duration,
        percentage_full: u8,
        max_active: usize,
    ) -> Vec<(u64, PooledConnection)> {
        if self.busy.len() * 100 < usize::from(percentage_full) * max_active {
            return Vec::new();
        }
        let mut expired: Vec<u64> = self
            .busy
            .iter()
            .filter(|(_, conn)| conn.busy_time(now) > timeout)
            .map(|(lease, _)| *lease)
            .collect();
        expired.sort_unstable();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for lease in expired {
            if let Some(conn) = self.busy.remove(&lease) {
                self.remember_reclaimed(lease);
                self.counters.abandoned += 1;
                self.pending += 1;
                reclaimed.push((lease, conn));
            }
        }
        reclaimed
    }

    fn remember_reclaimed(&mut self, lease: u64) {
        if self.reclaimed.len() == RECLAIMED_CAPACITY {
            self.reclaimed.pop_front();
        }
        self.reclaimed.push_back(lease);
    }

    /// Busy connections past the suspect threshold not yet reported.
    pub(crate) fn select_suspects(&mut self, now: Instant, threshold: Duration) -> Vec<Suspect> {
        let mut suspects: Vec<Suspect> = self
            .busy
            .iter_mut()
            .filter(|(_, conn)| !conn.suspect_logged && conn.busy_time(now) > threshold)
            .map(|(lease, conn)| {
                conn.suspect_logged = true;
                Suspect {
                    lease: *lease,
                    connection_id: conn.id,
                    busy_for: conn.busy_time(now),
                    trace: conn.trace.clone(),
                }
            })
            .collect();
        suspects.sort_unstable_by_key(|s| s.lease);
        suspects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConnectionBackend;
    use crate::interceptor::InterceptorChain;

    const POOL: u64 = 1;

    #[derive(Debug)]
    struct NullBackend;

    impl ConnectionBackend for NullBackend {
        fn send(&mut self, data: &[u8]) -> Result<usize, String> {
            Ok(data.len())
        }

        fn recv(&mut self, _max_bytes: usize) -> Result<Vec<u8>, String> {
            Ok(Vec::new())
        }

        fn ping(&mut self, _query: Option<&str>) -> bool {
            true
        }

        fn execute(&mut self, _statement: &str) -> Result<(), String> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn conn(id: u64) -> PooledConnection {
        PooledConnection::new(id, Box::new(NullBackend), InterceptorChain::default())
    }

    /// A state with `n` idle connections, ids 1..=n, oldest first.
    fn with_idle(n: u64) -> PoolState {
        let mut state = PoolState::new();
        for id in 1..=n {
            let mut c = conn(id);
            c.mark_idle();
            state.idle.push(c);
        }
        state
    }

    fn idle_ids(state: &PoolState) -> Vec<u64> {
        state.idle.iter().map(|c| c.id).collect()
    }

    // ── Lending ─────────────────────────────────────────────────────

    #[test]
    fn lend_assigns_increasing_leases() {
        let mut state = PoolState::new();
        let a = state.lend(POOL, conn(1), None);
        let b = state.lend(POOL, conn(2), None);
        assert!(b.id() > a.id());
        assert_eq!(state.busy.len(), 2);
        assert_eq!(state.counters.borrowed, 2);
        assert_eq!(state.busy[&a.id()].state, ConnectionState::Busy);
    }

    #[test]
    fn returned_lease_reports_already_returned() {
        let mut state = PoolState::new();
        let lease = state.lend(POOL, conn(1), None);
        assert!(state.take_busy(POOL, lease).is_ok());
        assert_eq!(state.pending, 1);
        assert_eq!(state.take_busy(POOL, lease).unwrap_err(), PoolError::AlreadyReturned(lease.id()));
    }

    #[test]
    fn foreign_lease_is_unknown() {
        let mut state = PoolState::new();
        let lease = state.lend(POOL, conn(1), None);
        let foreign = Lease::new(POOL + 1, lease.id());
        assert_eq!(state.busy(POOL, foreign).unwrap_err(), PoolError::UnknownConnection(lease.id()));
        let future = Lease::new(POOL, 999);
        assert_eq!(state.busy(POOL, future).unwrap_err(), PoolError::UnknownConnection(999));
    }

    // ── Hand-off ────────────────────────────────────────────────────

    #[test]
    fn hand_off_serves_oldest_waiter() {
        let mut state = PoolState::new();
        let (_, mut first) = state.enqueue(None);
        let (_, mut second) = state.enqueue(None);
        state.pending = 1;

        assert!(state.hand_off(POOL, conn(5)).is_ok());
        assert_eq!(state.pending, 0);

        match first.try_recv() {
            Ok(Ok(Grant::Lease(lease))) => assert_eq!(state.busy[&lease.id()].id, 5),
            other => panic!("expected lease, got {other:?}"),
        }
        assert!(second.try_recv().is_err());
        assert_eq!(state.waiters.len(), 1);
    }

    #[test]
    fn hand_off_skips_departed_waiters() {
        let mut state = PoolState::new();
        let (_, gone) = state.enqueue(None);
        drop(gone);
        let (_, mut live) = state.enqueue(None);
        state.pending = 1;

        assert!(state.hand_off(POOL, conn(5)).is_ok());
        assert!(matches!(live.try_recv(), Ok(Ok(Grant::Lease(_)))));
        assert_eq!(state.counters.borrowed, 1);
    }

    #[test]
    fn place_without_waiters_goes_idle() {
        let mut state = PoolState::new();
        state.pending = 1;
        assert!(state.place(POOL, conn(1), 4).is_none());
        assert_eq!(idle_ids(&state), vec![1]);
        assert_eq!(state.pending, 0);
    }

    #[test]
    fn place_rejects_above_max_idle() {
        let mut state = with_idle(2);
        state.pending = 1;
        let surplus = state.place(POOL, conn(3), 2);
        assert_eq!(surplus.map(|c| c.id), Some(3));
        assert_eq!(state.pending, 1);
    }

    #[test]
    fn place_rejects_while_closing() {
        let mut state = PoolState::new();
        state.lifecycle = PoolLifecycle::Closing;
        state.pending = 1;
        assert!(state.place(POOL, conn(1), 4).is_some());
    }

    #[test]
    fn freed_slot_goes_to_head_waiter() {
        let mut state = PoolState::new();
        state.pending = 1;
        let (_, mut rx) = state.enqueue(None);

        state.destroyed(DestroyReason::ValidationFailed, 1);

        assert!(matches!(rx.try_recv(), Ok(Ok(Grant::Create(_)))));
        assert_eq!(state.pending, 1, "slot is reserved for the woken waiter");
        assert_eq!(state.counters.validation_failures, 1);
        assert!(state.waiters.is_empty());
    }

    #[test]
    fn healthy_idle_check_stamps_validation() {
        let mut state = with_idle(2);
        let now = Instant::now();
        assert!(state.settle_idle_check(1, true, now).is_none());
        assert_eq!(state.idle[0].last_validated_at, Some(now));
        assert_eq!(idle_ids(&state), vec![1, 2]);
        assert_eq!(state.pending, 0);
    }

    #[test]
    fn failed_idle_check_pulls_connection_out() {
        let mut state = with_idle(3);
        let failed = state.settle_idle_check(2, false, Instant::now());
        assert_eq!(failed.map(|c| c.id), Some(2));
        assert_eq!(idle_ids(&state), vec![1, 3]);
        assert_eq!(state.pending, 1);
    }

    #[test]
    fn idle_check_ignores_borrowed_connection() {
        let mut state = with_idle(1);
        let handles = state.idle_handles();
        assert_eq!(handles.len(), 1);

        let claimed = state.idle.pop().unwrap();
        state.lend(POOL, claimed, None);

        assert!(state.settle_idle_check(1, false, Instant::now()).is_none());
        assert_eq!(state.busy.len(), 1);
        assert_eq!(state.pending, 0);
    }

    // ── Sweeps ──────────────────────────────────────────────────────

    #[test]
    fn eviction_respects_min_idle_floor() {
        let mut state = with_idle(5);
        let later = Instant::now() + Duration::from_secs(120);

        let victims = state.select_evictions(later, Duration::from_secs(60), None, 2, 10);

        let evicted: Vec<u64> = victims.iter().map(|(c, _)| c.id).collect();
        assert_eq!(evicted, vec![1, 2, 3], "least recently used go first");
        assert_eq!(idle_ids(&state), vec![4, 5]);
        assert_eq!(state.pending, 3);
        assert!(victims.iter().all(|(_, r)| *r == DestroyReason::Evicted));
    }

    #[test]
    fn eviction_skips_recently_used() {
        let mut state = with_idle(3);
        let victims = state.select_evictions(Instant::now(), Duration::from_secs(60), None, 0, 10);
        assert!(victims.is_empty());
        assert_eq!(state.idle.len(), 3);
    }

    #[test]
    fn eviction_trims_to_max_idle() {
        let mut state = with_idle(4);
        let victims = state.select_evictions(Instant::now(), Duration::from_secs(60), None, 0, 2);
        assert_eq!(victims.len(), 2);
        assert!(victims.iter().all(|(_, r)| *r == DestroyReason::Surplus));
        assert_eq!(idle_ids(&state), vec![3, 4]);
    }

    #[test]
    fn expired_connections_ignore_floor() {
        let mut state = with_idle(2);
        let later = Instant::now() + Duration::from_secs(10);
        let victims = state.select_evictions(later, Duration::from_secs(60), Some(Duration::from_secs(5)), 2, 10);
        assert_eq!(victims.len(), 2);
        assert!(victims.iter().all(|(_, r)| *r == DestroyReason::Expired));
    }

    #[test]
    fn top_up_limited_by_max_active() {
        let mut state = with_idle(1);
        state.lend(POOL, conn(7), None);
        assert_eq!(state.reserve_top_up(5, 4), 2);
        assert_eq!(state.pending, 2);
        assert_eq!(state.size(), 4);
    }

    #[test]
    fn abandoned_only_past_timeout() {
        let mut state = PoolState::new();
        let lease = state.lend(POOL, conn(1), None);
        let now = Instant::now();

        assert!(state.select_abandoned(now, Duration::from_secs(1), 0, 10).is_empty());

        let later = now + Duration::from_secs(2);
        let reclaimed = state.select_abandoned(later, Duration::from_secs(1), 0, 10);
        assert_eq!(reclaimed.len(), 1);
        assert!(state.busy.is_empty());
        assert_eq!(state.counters.abandoned, 1);

        assert_eq!(state.busy(POOL, lease).unwrap_err(), PoolError::Abandoned(lease.id()));
        assert_eq!(state.take_busy(POOL, lease).unwrap_err(), PoolError::Abandoned(lease.id()));
        assert_eq!(state.take_busy(POOL, lease).unwrap_err(), PoolError::AlreadyReturned(lease.id()));
    }

    #[test]
    fn abandoned_gated_by_percentage_full() {
        let mut state = PoolState::new();
        state.lend(POOL, conn(1), None);
        let later = Instant::now() + Duration::from_secs(5);

        // 1 of 4 busy is 25%, below the 50% gate.
        assert!(state.select_abandoned(later, Duration::from_secs(1), 50, 4).is_empty());
        state.lend(POOL, conn(2), None);
        assert_eq!(state.select_abandoned(later, Duration::from_secs(1), 50, 4).len(), 2);
    }

    #[test]
    fn reclaimed_leases_are_bounded() {
        let mut state = PoolState::new();
        let first = state.lend(POOL, conn(1), None);
        let later = Instant::now() + Duration::from_secs(5);
        state.select_abandoned(later, Duration::from_secs(1), 0, 1);

        for id in 2..=(RECLAIMED_CAPACITY as u64 + 1) {
            state.lend(POOL, conn(id), None);
            state.select_abandoned(later, Duration::from_secs(1), 0, 1);
        }

        assert_eq!(state.reclaimed.len(), RECLAIMED_CAPACITY);
        assert_eq!(state.counters.abandoned, RECLAIMED_CAPACITY as u64 + 1);
        assert_eq!(state.busy(POOL, first).unwrap_err(), PoolError::AlreadyReturned(first.id()));
    }

    #[test]
    fn suspects_reported_once_per_borrow() {
        let mut state = PoolState::new();
        state.lend(POOL, conn(1), None);
        let later = Instant::now() + Duration::from_secs(5);

        assert_eq!(state.select_suspects(later, Duration::from_secs(1)).len(), 1);
        assert!(state.select_suspects(later, Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn close_finishes_when_drained() {
        let mut state = PoolState::new();
        state.lifecycle = PoolLifecycle::Closing;
        state.pending = 1;
        assert!(!state.finish_close());
        state.destroyed(DestroyReason::Closing, 4);
        assert!(state.finish_close());
        assert_eq!(state.lifecycle, PoolLifecycle::Closed);
    }
}
