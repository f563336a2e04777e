//! Background sweeper.
//!
//! One task per pool wakes every `time_between_eviction_runs` and runs
//! [`ConnectionPool::sweep`]. It only holds a weak reference, so a pool
//! that is dropped without `close()` still lets the task exit on its next
//! tick.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pool::{ConnectionPool, PoolInner};

/// Handle to a running sweeper task.
#[derive(Debug)]
pub(crate) struct Sweeper {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    pub(crate) fn spawn(pool: Weak<PoolInner>, name: String, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(pool = %name, period_ms = period.as_millis() as u64, "pool sweeper started");
        let handle = tokio::spawn(run_sweep_loop(pool, name, period, shutdown_rx));
        Self { handle, shutdown_tx }
    }

    /// Ask the task to exit. A sweep already in progress runs to completion
    /// so that no connection is left counted as pending.
    pub(crate) fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        drop(self.handle);
    }
}

async fn run_sweep_loop(
    pool: Weak<PoolInner>,
    name: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                let Some(inner) = pool.upgrade() else {
                    debug!(pool = %name, "pool dropped, sweeper exiting");
                    break;
                };
                let report = ConnectionPool::from_inner(inner).sweep().await;
                if report.changed() {
                    info!(
                        pool = %name,
                        validated = report.validated,
                        invalid = report.invalid,
                        evicted = report.evicted,
                        replenished = report.replenished,
                        abandoned = report.abandoned,
                        suspect = report.suspect,
                        "sweep finished"
                    );
                }
            }
            _ = shutdown.changed() => {
                debug!(pool = %name, "sweeper shutting down");
                break;
            }
        }
    }
}
