//! Integration tests for the connection pool.
//!
//! These drive the public API only: a counting in-memory factory stands in
//! for the database, and every test builds its own pool.
//!
//! ```text
//! test ──borrow/release──▶ ConnectionPool ──connect──▶ CountingFactory
//!                               ▲
//!                               └── background sweeper (where enabled)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use reservoir::{ConnectParams, ConnectionBackend, ConnectionFactory, ConnectionPool, Lease, PoolConfig, PoolError};

// ── Counting factory ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    closes: AtomicU64,
    pings: AtomicU64,
    unhealthy: AtomicBool,
}

#[derive(Debug)]
struct CountingBackend {
    counters: Arc<Counters>,
}

impl ConnectionBackend for CountingBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        Ok(data.len())
    }

    fn recv(&mut self, _max_bytes: usize) -> Result<Vec<u8>, String> {
        Ok(Vec::new())
    }

    fn ping(&mut self, _query: Option<&str>) -> bool {
        self.counters.pings.fetch_add(1, Ordering::Relaxed);
        !self.counters.unhealthy.load(Ordering::Relaxed)
    }

    fn execute(&mut self, _statement: &str) -> Result<(), String> {
        Ok(())
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct CountingFactory {
    counters: Arc<Counters>,
}

impl CountingFactory {
    fn connects(&self) -> u64 {
        self.counters.connects.load(Ordering::Relaxed)
    }

    fn closes(&self) -> u64 {
        self.counters.closes.load(Ordering::Relaxed)
    }

    fn pings(&self) -> u64 {
        self.counters.pings.load(Ordering::Relaxed)
    }
}

impl ConnectionFactory for CountingFactory {
    fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn ConnectionBackend>, String> {
        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(CountingBackend {
            counters: Arc::clone(&self.counters),
        }))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Route pool logs to the test harness. Run with `RUST_LOG=reservoir=debug`
/// to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pool with the background sweeper disabled.
async fn start(config: PoolConfig) -> (ConnectionPool, Arc<CountingFactory>) {
    let factory = Arc::new(CountingFactory::default());
    let pool = ConnectionPool::new(config.with_eviction(0, 60_000), factory.clone())
        .await
        .unwrap();
    (pool, factory)
}

async fn connection_id(pool: &ConnectionPool, lease: Lease) -> u64 {
    pool.info(lease).await.unwrap().id
}

async fn wait_for_waiters(pool: &ConnectionPool, count: usize) {
    while pool.stats().await.waiting < count {
        tokio::task::yield_now().await;
    }
}

// ── Exhaustion and hand-off ──────────────────────────────────────────

#[tokio::test]
async fn full_pool_without_wait_is_exhausted() {
    let (pool, factory) = start(PoolConfig::new("exhaust", 1).with_max_wait_ms(0)).await;
    let held = pool.borrow().await.unwrap();

    match pool.borrow().await {
        Err(PoolError::PoolExhausted { pool: name, .. }) => assert_eq!(name, "exhaust"),
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    assert_eq!(factory.connects(), 1);

    pool.release(held).await.unwrap();
    assert!(pool.borrow().await.is_ok());
}

#[tokio::test]
async fn blocked_borrower_gets_the_returned_connection() {
    let (pool, factory) = start(PoolConfig::new("handoff", 2).with_max_wait_ms(5_000)).await;
    let first = pool.borrow().await.unwrap();
    let second = pool.borrow().await.unwrap();
    let second_id = connection_id(&pool, second).await;

    let third = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await })
    };
    wait_for_waiters(&pool, 1).await;

    pool.release(second).await.unwrap();
    let lease = third.await.unwrap().unwrap();

    assert_eq!(connection_id(&pool, lease).await, second_id);
    assert_eq!(factory.connects(), 2);
    let stats = pool.stats().await;
    assert_eq!(stats.active, 2);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.wait_count, 1);

    pool.release(first).await.unwrap();
    pool.release(lease).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_arrival_order() {
    let (pool, _factory) = start(PoolConfig::new("fifo", 1).with_max_wait_ms(-1)).await;
    let held = pool.borrow().await.unwrap();
    let served = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for position in 0..3 {
        let waiter_pool = pool.clone();
        let served = Arc::clone(&served);
        waiters.push(tokio::spawn(async move {
            let lease = waiter_pool.borrow().await.unwrap();
            served.lock().unwrap().push(position);
            waiter_pool.release(lease).await.unwrap();
        }));
        wait_for_waiters(&pool, position + 1).await;
    }

    pool.release(held).await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*served.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(pool.stats().await.active, 0);
}

// ── Validation ───────────────────────────────────────────────────────

#[tokio::test]
async fn borrow_validation_is_throttled_by_interval() {
    let config = PoolConfig::new("throttle", 1)
        .with_test_on_borrow(true)
        .with_validation_interval_ms(30_000);
    let (pool, factory) = start(config).await;

    for _ in 0..5 {
        let lease = pool.borrow().await.unwrap();
        pool.release(lease).await.unwrap();
    }
    assert_eq!(factory.pings(), 1);
}

#[tokio::test]
async fn dead_idle_connections_are_replaced_on_borrow() {
    let config = PoolConfig::new("replace", 2)
        .with_sizing(2, 0, 2, 2)
        .with_test_on_borrow(true)
        .with_validation_interval_ms(0);
    let (pool, factory) = start(config).await;
    factory.counters.unhealthy.store(true, Ordering::Relaxed);

    // Both idle connections fail the probe; the borrower gets a fresh one.
    let lease = pool.borrow().await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.validation_failures, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.idle, 0);
    assert_eq!(factory.connects(), 3);
    assert_eq!(factory.closes(), 2);
    pool.release(lease).await.unwrap();
}

// ── Background sweeper ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sweeper_reclaims_abandoned_connection() {
    init_tracing();
    let factory = Arc::new(CountingFactory::default());
    let config = PoolConfig::new("abandon", 1)
        .with_max_wait_ms(0)
        .with_eviction(500, 60_000)
        .with_remove_abandoned(1, true);
    let pool = ConnectionPool::new(config, factory.clone()).await.unwrap();

    let leaked = pool.borrow().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let stats = pool.stats().await;
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(factory.closes(), 1);
    assert_eq!(pool.release(leaked).await, Err(PoolError::Abandoned(leaked.id())));

    let lease = pool.borrow().await.unwrap();
    pool.release(lease).await.unwrap();
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn sweep_keeps_min_idle_floor() {
    let config = PoolConfig::new("floor", 4).with_sizing(4, 2, 4, 4);
    let factory = Arc::new(CountingFactory::default());
    let pool = ConnectionPool::new(config.with_eviction(0, 1_000), factory.clone())
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(5)).await;
    let report = pool.sweep().await;

    assert_eq!(report.evicted, 2);
    let stats = pool.stats().await;
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.evicted, 2);
    assert_eq!(factory.closes(), 2);
}

// ── Shutdown ─────────────────────────────────────────────────────────

#[tokio::test]
async fn close_fails_every_waiter_and_closes_every_connection() {
    let (pool, factory) = start(PoolConfig::new("shutdown", 2).with_max_wait_ms(-1)).await;
    let first = pool.borrow().await.unwrap();
    let second = pool.borrow().await.unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await })
        })
        .collect();
    wait_for_waiters(&pool, 3).await;

    pool.close().await;
    for waiter in waiters {
        assert!(waiter.await.unwrap().unwrap_err().is_closed());
    }
    assert!(pool.borrow().await.unwrap_err().is_closed());

    pool.release(first).await.unwrap();
    pool.release(second).await.unwrap();
    assert_eq!(factory.closes(), factory.connects());

    let stats = pool.stats().await;
    assert_eq!(stats.size, 0);
    assert_eq!(stats.open(), 0);
}

// ── Concurrency ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_borrowers_never_exceed_max_active() {
    init_tracing();
    const MAX_ACTIVE: usize = 4;
    const WORKERS: usize = 16;
    const ROUNDS: usize = 50;

    let (pool, factory) = start(PoolConfig::new("stress", MAX_ACTIVE).with_max_wait_ms(-1)).await;

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let lease = pool.borrow().await.unwrap();
                    pool.send(lease, b"ping").await.unwrap();
                    let stats = pool.stats().await;
                    assert!(stats.size <= MAX_ACTIVE, "size {} above max_active", stats.size);
                    tokio::task::yield_now().await;
                    pool.release(lease).await.unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.await.unwrap();
    }

    let stats = pool.stats().await;
    let total = (WORKERS * ROUNDS) as u64;
    assert_eq!(stats.borrowed, total);
    assert_eq!(stats.returned, total);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 0);
    assert!(factory.connects() <= MAX_ACTIVE as u64);
}
