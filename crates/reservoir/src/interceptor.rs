//! Interceptor chain: per-connection observers around proxied operations.
//!
//! ```text
//! send(lease, bytes)
//!   → before():  i0 → i1 → i2     (configured order; may veto or substitute)
//!   → backend.send()              (skipped when a hook short-circuited)
//!   → after():   i2 → i1 → i0     (reverse order, only hooks that ran)
//! ```
//!
//! Chains are built from [`InterceptorFactory`]s resolved once when the pool
//! is constructed. Every connection gets its own instances, so an
//! interceptor may keep per-connection state. Interceptors only ever see
//! the backend through a temporary `&mut` borrow.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::ConnectionBackend;
use crate::connection::ConnectionInfo;
use crate::error::{PoolError, PoolResult};

/// A proxied operation on a borrowed connection.
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    Send(&'a [u8]),
    Recv { max_bytes: usize },
}

impl Operation<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Send(_) => "send",
            Operation::Recv { .. } => "recv",
        }
    }
}

/// Result of a proxied operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent(usize),
    Received(Vec<u8>),
}

/// Decision returned by a `before` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercept {
    Proceed,
    /// Fail the operation with this reason.
    Veto(String),
    /// Skip the backend and use this result instead.
    Substitute(Outcome),
}

/// Hooks invoked around every proxied operation of one connection.
pub trait Interceptor: Send + fmt::Debug {
    fn name(&self) -> &str;

    fn before(&mut self, _conn: &ConnectionInfo, _op: &Operation<'_>) -> Intercept {
        Intercept::Proceed
    }

    fn after(
        &mut self,
        _conn: &ConnectionInfo,
        _op: &Operation<'_>,
        _result: &mut PoolResult<Outcome>,
        _elapsed: Duration,
    ) {
    }

    /// Called before the connection goes back to the pool. An error
    /// destroys the connection instead of recycling it.
    fn on_return(&mut self, _conn: &ConnectionInfo, _backend: &mut dyn ConnectionBackend) -> Result<(), String> {
        Ok(())
    }

    fn on_close(&mut self, _conn: &ConnectionInfo) {}
}

/// Creates one interceptor instance per pooled connection.
pub trait InterceptorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Interceptor>;
}

impl<F> InterceptorFactory for F
where
    F: Fn() -> Box<dyn Interceptor> + Send + Sync,
{
    fn create(&self) -> Box<dyn Interceptor> {
        self()
    }
}

/// Ordered interceptor instances attached to a single connection.
#[derive(Debug, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Box<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub(crate) fn build(factories: &[Arc<dyn InterceptorFactory>]) -> Self {
        Self::new(factories.iter().map(|f| f.create()).collect())
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `op` against `backend` wrapped in the chain.
    pub fn invoke(
        &mut self,
        conn: &ConnectionInfo,
        op: Operation<'_>,
        backend: &mut dyn ConnectionBackend,
    ) -> PoolResult<Outcome> {
        let mut entered = 0;
        let mut short_circuit = None;

        for interceptor in self.interceptors.iter_mut() {
            entered += 1;
            match interceptor.before(conn, &op) {
                Intercept::Proceed => {}
                Intercept::Veto(reason) => {
                    short_circuit = Some(Err(PoolError::Intercepted {
                        interceptor: interceptor.name().to_string(),
                        reason,
                    }));
                    break;
                }
                Intercept::Substitute(outcome) => {
                    short_circuit = Some(Ok(outcome));
                    break;
                }
            }
        }

        let started = Instant::now();
        let mut result = match short_circuit {
            Some(result) => result,
            None => perform(op, backend),
        };
        let elapsed = started.elapsed();

        for interceptor in self.interceptors[..entered].iter_mut().rev() {
            interceptor.after(conn, &op, &mut result, elapsed);
        }
        result
    }

    /// Run pre-return hooks in order, stopping at the first failure.
    pub(crate) fn on_return(
        &mut self,
        conn: &ConnectionInfo,
        backend: &mut dyn ConnectionBackend,
    ) -> Result<(), (String, String)> {
        for interceptor in self.interceptors.iter_mut() {
            interceptor
                .on_return(conn, backend)
                .map_err(|reason| (interceptor.name().to_string(), reason))?;
        }
        Ok(())
    }

    pub(crate) fn on_close(&mut self, conn: &ConnectionInfo) {
        for interceptor in self.interceptors.iter_mut().rev() {
            interceptor.on_close(conn);
        }
    }
}

fn perform(op: Operation<'_>, backend: &mut dyn ConnectionBackend) -> PoolResult<Outcome> {
    match op {
        Operation::Send(data) => backend.send(data).map(Outcome::Sent),
        Operation::Recv { max_bytes } => backend.recv(max_bytes).map(Outcome::Received),
    }
    .map_err(PoolError::Backend)
}

// ── Configuration ───────────────────────────────────────────────────

/// A configured interceptor: `name(key=value,key=value)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterceptorSpec {
    pub name: String,
    pub properties: BTreeMap<String, String>,
}

impl InterceptorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parse a single spec such as `slow-log(threshold_ms=250)`.
    pub fn parse(input: &str) -> PoolResult<Self> {
        let input = input.trim();
        let (name, args) = match input.split_once('(') {
            Some((name, rest)) => {
                let args = rest
                    .strip_suffix(')')
                    .ok_or_else(|| PoolError::Config(format!("unterminated interceptor arguments: {input}")))?;
                (name.trim(), Some(args))
            }
            None => (input, None),
        };

        if name.is_empty() {
            return Err(PoolError::Config(format!("missing interceptor name: {input:?}")));
        }

        let mut spec = InterceptorSpec::new(name);
        for pair in args.into_iter().flat_map(|a| a.split(',')) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("interceptor property without value: {pair}")))?;
            spec.properties.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(spec)
    }

    /// Parse a `;`-separated list, skipping empty entries.
    pub fn parse_list(input: &str) -> PoolResult<Vec<Self>> {
        input
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    fn numeric_property(&self, key: &str) -> PoolResult<u64> {
        let raw = self
            .property(key)
            .ok_or_else(|| PoolError::Config(format!("interceptor {} requires property {key}", self.name)))?;
        raw.parse()
            .map_err(|_| PoolError::Config(format!("interceptor {}: {key} is not a number: {raw}", self.name)))
    }
}

impl fmt::Display for InterceptorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.properties.is_empty() {
            let args: Vec<String> = self.properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "({})", args.join(","))?;
        }
        Ok(())
    }
}

impl TryFrom<String> for InterceptorSpec {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InterceptorSpec> for String {
    fn from(spec: InterceptorSpec) -> Self {
        spec.to_string()
    }
}

/// Resolve configured specs into factories, consulting `custom` before the
/// built-in set.
pub(crate) fn resolve(
    specs: &[InterceptorSpec],
    custom: &HashMap<String, Arc<dyn InterceptorFactory>>,
) -> PoolResult<Vec<Arc<dyn InterceptorFactory>>> {
    specs
        .iter()
        .map(|spec| match custom.get(&spec.name) {
            Some(factory) => Ok(Arc::clone(factory)),
            None => builtin(spec),
        })
        .collect()
}

fn builtin(spec: &InterceptorSpec) -> PoolResult<Arc<dyn InterceptorFactory>> {
    match spec.name.as_str() {
        ResetOnReturn::NAME => Ok(Arc::new(|| Box::new(ResetOnReturn) as Box<dyn Interceptor>)),
        SlowLog::NAME => {
            let threshold = Duration::from_millis(spec.numeric_property("threshold_ms")?);
            Ok(Arc::new(move || Box::new(SlowLog::new(threshold)) as Box<dyn Interceptor>))
        }
        MaxPayload::NAME => {
            let limit = spec.numeric_property("bytes")? as usize;
            Ok(Arc::new(move || Box::new(MaxPayload::new(limit)) as Box<dyn Interceptor>))
        }
        other => Err(PoolError::Config(format!("unknown interceptor: {other}"))),
    }
}

// ── Built-in interceptors ───────────────────────────────────────────

/// Resets backend session state before the connection is recycled.
#[derive(Debug, Default)]
pub struct ResetOnReturn;

impl ResetOnReturn {
    pub const NAME: &'static str = "reset-on-return";
}

impl Interceptor for ResetOnReturn {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_return(&mut self, _conn: &ConnectionInfo, backend: &mut dyn ConnectionBackend) -> Result<(), String> {
        backend.reset()
    }
}

/// Logs operations slower than a threshold.
#[derive(Debug)]
pub struct SlowLog {
    threshold: Duration,
    slow_count: u64,
}

impl SlowLog {
    pub const NAME: &'static str = "slow-log";

    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            slow_count: 0,
        }
    }

    /// Slow operations seen on this connection.
    pub fn slow_count(&self) -> u64 {
        self.slow_count
    }
}

impl Interceptor for SlowLog {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn after(
        &mut self,
        conn: &ConnectionInfo,
        op: &Operation<'_>,
        result: &mut PoolResult<Outcome>,
        elapsed: Duration,
    ) {
        if elapsed >= self.threshold {
            self.slow_count += 1;
            warn!(
                connection_id = conn.id,
                operation = op.kind(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.threshold.as_millis() as u64,
                failed = result.is_err(),
                "slow connection operation"
            );
        }
    }
}

/// Vetoes sends larger than a byte limit.
#[derive(Debug)]
pub struct MaxPayload {
    limit: usize,
}

impl MaxPayload {
    pub const NAME: &'static str = "max-payload";

    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl Interceptor for MaxPayload {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn before(&mut self, _conn: &ConnectionInfo, op: &Operation<'_>) -> Intercept {
        match op {
            Operation::Send(data) if data.len() > self.limit => {
                Intercept::Veto(format!("payload of {} bytes exceeds {}", data.len(), self.limit))
            }
            _ => Intercept::Proceed,
        }
    }
}
