//! In-process simulated backend used by `reservoir soak`.
//!
//! Sends are buffered and echoed back by `recv`. Liveness probes fail at a
//! configurable rate so validation and replacement paths get exercised.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use reservoir::{ConnectParams, ConnectionBackend, ConnectionFactory};

#[derive(Debug)]
pub struct SimBackend {
    id: u64,
    failure_rate: f64,
    buffer: Vec<u8>,
    healthy: bool,
}

impl ConnectionBackend for SimBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        if !self.healthy {
            return Err(format!("sim connection {} is broken", self.id));
        }
        self.buffer.extend_from_slice(data);
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String> {
        if !self.healthy {
            return Err(format!("sim connection {} is broken", self.id));
        }
        let n = max_bytes.min(self.buffer.len());
        Ok(self.buffer.drain(..n).collect())
    }

    fn ping(&mut self, _query: Option<&str>) -> bool {
        if self.healthy && self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            self.healthy = false;
        }
        self.healthy
    }

    fn execute(&mut self, _statement: &str) -> Result<(), String> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), String> {
        self.buffer.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.healthy = false;
    }
}

/// Creates [`SimBackend`]s. Connect calls never fail.
#[derive(Debug)]
pub struct SimFactory {
    failure_rate: f64,
    connects: AtomicU64,
}

impl SimFactory {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

impl ConnectionFactory for SimFactory {
    fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn ConnectionBackend>, String> {
        let id = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(SimBackend {
            id,
            failure_rate: self.failure_rate,
            buffer: Vec::new(),
            healthy: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_echoes_sent_bytes() {
        let factory = SimFactory::new(0.0);
        let mut backend = factory.connect(&ConnectParams::default()).unwrap();
        backend.send(b"hello").unwrap();
        assert_eq!(backend.recv(3).unwrap(), b"hel".to_vec());
        assert_eq!(backend.recv(10).unwrap(), b"lo".to_vec());
        assert_eq!(factory.connects(), 1);
    }

    #[test]
    fn certain_failure_breaks_connection() {
        let factory = SimFactory::new(1.0);
        let mut backend = factory.connect(&ConnectParams::default()).unwrap();
        assert!(!backend.ping(None));
        assert!(backend.send(b"x").is_err());
    }

    #[test]
    fn closed_connection_fails_probe() {
        let factory = SimFactory::new(0.0);
        let mut backend = factory.connect(&ConnectParams::default()).unwrap();
        assert!(backend.ping(Some("SELECT 1")));
        backend.close();
        assert!(!backend.ping(None));
    }
}
