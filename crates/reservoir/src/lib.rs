//! reservoir: a bounded, validating connection pool engine.
//!
//! Callers borrow exclusive [`Lease`]s on physical connections created by a
//! pluggable [`ConnectionFactory`] and return them for reuse:
//! - **pool**: borrow/return with FIFO waiting, hand-off and close
//! - **validator**: liveness probes on connect, borrow, return and idle
//! - **interceptor**: per-connection hook chains around proxied I/O
//! - **sweeper**: background idle eviction, top-up and abandonment checks
//! - **config**: `PoolConfig` loaded from TOML or built in code
//!
//! ```text
//! ConnectionPool ──borrow──▶ Lease ──send/recv──▶ InterceptorChain ──▶ ConnectionBackend
//!       ▲                                                                    ▲
//!       └──────── release ◀────────────── Sweeper (evict / reclaim) ─────────┘
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod interceptor;
pub mod pool;
pub mod stats;
pub mod validator;

mod sweeper;

pub use backend::{ConnectParams, ConnectionBackend, ConnectionFactory};
pub use config::PoolConfig;
pub use connection::{BorrowerTrace, ConnectionInfo, ConnectionState, Lease};
pub use error::{PoolError, PoolResult};
pub use interceptor::{
    Intercept, Interceptor, InterceptorChain, InterceptorFactory, InterceptorSpec, MaxPayload, Operation, Outcome,
    ResetOnReturn, SlowLog,
};
pub use pool::{ConnectionPool, PoolBuilder, PoolLifecycle};
pub use stats::{PoolStats, SweepReport};
pub use validator::{Trigger, Validator};
