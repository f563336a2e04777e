//! Physical connection abstraction.
//!
//! The pool never speaks a wire protocol. It only needs to open, probe,
//! reset and close a connection, and to pass opaque bytes through on the
//! caller's behalf. Drivers implement [`ConnectionBackend`] and
//! [`ConnectionFactory`]; tests inject mocks.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Trait abstracting one physical connection.
pub trait ConnectionBackend: Send + fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send(&mut self, data: &[u8]) -> Result<usize, String>;
    /// Receive up to `max_bytes` from the connection.
    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String>;
    /// Liveness probe. `query` is the configured validation query, if any;
    /// backends without a query language may ignore it.
    fn ping(&mut self, query: Option<&str>) -> bool;
    /// Run a statement whose result is discarded. Used for `init_sql`.
    fn execute(&mut self, statement: &str) -> Result<(), String>;
    /// Reset session state before the connection is reused.
    fn reset(&mut self) -> Result<(), String> {
        Ok(())
    }
    /// Close the underlying transport.
    fn close(&mut self);
}

/// Factory for creating new connections, injected at pool construction.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection.
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn ConnectionBackend>, String>;
}

/// Parameters handed to the [`ConnectionFactory`] on every connect.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectParams {
    /// Driver-specific target, passed through untouched.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra driver properties.
    pub properties: BTreeMap<String, String>,
}

impl ConnectParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..self
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Copy with the password replaced by a fixed marker.
    pub fn redacted(&self) -> Self {
        Self {
            password: self.password.as_ref().map(|_| REDACTED.to_string()),
            ..self.clone()
        }
    }
}

pub(crate) const REDACTED: &str = "********";

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("properties", &self.properties)
            .finish()
    }
}
