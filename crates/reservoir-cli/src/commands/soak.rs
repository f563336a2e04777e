//! `reservoir soak`: drive a pool with concurrent borrowers against the
//! simulated backend and report what happened.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reservoir::{ConnectionPool, Lease, PoolConfig, PoolError, PoolResult};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::sim::SimFactory;

#[derive(Debug, Clone, Copy)]
pub struct SoakOptions {
    pub workers: usize,
    pub duration: Duration,
    pub failure_rate: f64,
    pub hold: Duration,
}

/// Per-worker outcome counts.
#[derive(Debug, Default)]
struct Tally {
    borrows: u64,
    errors: BTreeMap<&'static str, u64>,
}

impl Tally {
    fn record(&mut self, err: &PoolError) {
        *self.errors.entry(err.kind()).or_insert(0) += 1;
    }

    fn merge(&mut self, other: Tally) {
        self.borrows += other.borrows;
        for (kind, count) in other.errors {
            *self.errors.entry(kind).or_insert(0) += count;
        }
    }
}

pub async fn soak(path: &Path, opts: SoakOptions) -> Result<()> {
    let config = PoolConfig::from_file(path)
        .with_context(|| format!("failed to load pool config from {}", path.display()))?;
    let summary = run(config, opts).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run(config: PoolConfig, opts: SoakOptions) -> Result<serde_json::Value> {
    let factory = Arc::new(SimFactory::new(opts.failure_rate));
    let pool = ConnectionPool::new(config, factory.clone())
        .await
        .context("failed to start pool")?;

    info!(
        pool = pool.name(),
        workers = opts.workers,
        duration_ms = opts.duration.as_millis() as u64,
        failure_rate = opts.failure_rate,
        "soak started"
    );

    let deadline = Instant::now() + opts.duration;
    let handles: Vec<_> = (0..opts.workers)
        .map(|_| tokio::spawn(worker(pool.clone(), deadline, opts.hold)))
        .collect();

    let mut tally = Tally::default();
    for handle in handles {
        tally.merge(handle.await.context("soak worker panicked")?);
    }

    pool.log_stats().await;
    let stats = pool.stats().await;
    pool.close().await;

    if !tally.errors.is_empty() {
        warn!(pool = %stats.name, errors = ?tally.errors, "soak finished with errors");
    }

    Ok(serde_json::json!({
        "workers": opts.workers,
        "duration_ms": opts.duration.as_millis() as u64,
        "borrows": tally.borrows,
        "errors": tally.errors,
        "connects": factory.connects(),
        "stats": stats,
    }))
}

async fn worker(pool: ConnectionPool, deadline: Instant, hold: Duration) -> Tally {
    let mut tally = Tally::default();
    while Instant::now() < deadline {
        let lease = match pool.borrow().await {
            Ok(lease) => lease,
            Err(err) => {
                tally.record(&err);
                tokio::task::yield_now().await;
                continue;
            }
        };
        tally.borrows += 1;

        if let Err(err) = round_trip(&pool, lease).await {
            tally.record(&err);
        }
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        if let Err(err) = pool.release(lease).await {
            tally.record(&err);
        }
    }
    tally
}

async fn round_trip(pool: &ConnectionPool, lease: Lease) -> PoolResult<()> {
    let payload = format!("lease {lease}");
    let sent = pool.send(lease, payload.as_bytes()).await?;
    let echoed = pool.recv(lease, sent).await?;
    if echoed != payload.as_bytes() {
        return Err(PoolError::Backend(format!("echo mismatch on lease {lease}")));
    }
    Ok(())
}
