//! Per-server health checking
//!
//! A probe is a TCP connect attempt bounded by `timeout`, issued every
//! `period` on a loop drawn round-robin from the server group's event loop
//! group. Transitions use hysteresis: DOWN->UP after `up` consecutive
//! successes, UP->DOWN after `down` consecutive failures. Probe outcomes
//! only ever mutate server state; they are never surfaced as errors.

use super::server::Server;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Health check parameters. The four fields are always set as a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub timeout: Duration,
    pub period: Duration,
    pub up: u32,
    pub down: u32,
}

impl HealthCheckConfig {
    pub fn new(timeout_ms: u64, period_ms: u64, up: u32, down: u32) -> Result<Self> {
        if timeout_ms == 0 || period_ms == 0 || up == 0 || down == 0 {
            return Err(Error::invalid_argument(
                "health check timeout/period/up/down must all be positive",
            ));
        }
        Ok(HealthCheckConfig {
            timeout: Duration::from_millis(timeout_ms),
            period: Duration::from_millis(period_ms),
            up,
            down,
        })
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            timeout: Duration::from_millis(1000),
            period: Duration::from_millis(5000),
            up: 2,
            down: 3,
        }
    }
}

/// Shared handle: the group swaps the whole config atomically, probers pick
/// the new values up on their next tick.
pub type HealthConfigHandle = Arc<RwLock<Arc<HealthCheckConfig>>>;

pub fn config_handle(config: HealthCheckConfig) -> HealthConfigHandle {
    Arc::new(RwLock::new(Arc::new(config)))
}

/// Hysteresis state machine. New servers start DOWN until the first `up`
/// streak completes.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub up: bool,
    pub consecutive_success: u32,
    pub consecutive_failure: u32,
}

impl HealthState {
    pub fn new() -> Self {
        HealthState {
            up: false,
            consecutive_success: 0,
            consecutive_failure: 0,
        }
    }

    /// Record a successful probe. Returns true when this flips DOWN->UP.
    pub fn on_success(&mut self, up_threshold: u32) -> bool {
        self.consecutive_success += 1;
        self.consecutive_failure = 0;
        if !self.up && self.consecutive_success >= up_threshold {
            self.up = true;
            return true;
        }
        false
    }

    /// Record a failed probe. Returns true when this flips UP->DOWN.
    pub fn on_failure(&mut self, down_threshold: u32) -> bool {
        self.consecutive_failure += 1;
        self.consecutive_success = 0;
        if self.up && self.consecutive_failure >= down_threshold {
            self.up = false;
            return true;
        }
        false
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Background prober for one server. Each server gets its own task, so a
/// slow probe never delays the others.
pub struct HealthChecker {
    server: Arc<Server>,
    config: HealthConfigHandle,
    cancel: CancellationToken,
}

impl HealthChecker {
    pub fn new(
        server: Arc<Server>,
        config: HealthConfigHandle,
        cancel: CancellationToken,
    ) -> Self {
        HealthChecker {
            server,
            config,
            cancel,
        }
    }

    pub async fn run(self) {
        let cancel = self.cancel.clone();
        loop {
            let config = self.config.read().clone();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.period) => {}
            }

            let ok = matches!(
                tokio::time::timeout(config.timeout, TcpStream::connect(self.server.address()))
                    .await,
                Ok(Ok(_))
            );

            if let Some(now_up) = self.server.record_probe(ok, &config) {
                if now_up {
                    info!("server {} ({}) is UP", self.server.name(), self.server.address());
                } else {
                    warn!(
                        "server {} ({}) is DOWN",
                        self.server.name(),
                        self.server.address()
                    );
                }
            }
        }
    }
}
