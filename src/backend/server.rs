//! Backend server record

use super::healthcheck::{HealthCheckConfig, HealthState};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// One weighted backend, owned by exactly one server group.
#[derive(Debug)]
pub struct Server {
    name: String,
    address: SocketAddr,
    weight: AtomicU32,
    health: Mutex<HealthState>,
    // Cached health flag so the selection path never takes the state lock.
    up: AtomicBool,
    active_sessions: AtomicU64,
    bytes_from_remote: AtomicU64,
    bytes_to_remote: AtomicU64,
    check_cancel: Mutex<CancellationToken>,
}

impl Server {
    pub fn new(name: &str, address: SocketAddr, weight: u32) -> Self {
        Server {
            name: name.to_string(),
            address,
            weight: AtomicU32::new(weight),
            health: Mutex::new(HealthState::new()),
            up: AtomicBool::new(false),
            active_sessions: AtomicU64::new(0),
            bytes_from_remote: AtomicU64::new(0),
            bytes_to_remote: AtomicU64::new(0),
            check_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Apply one probe outcome. Returns the new health flag when the probe
    /// caused a transition, None otherwise.
    pub fn record_probe(&self, success: bool, config: &HealthCheckConfig) -> Option<bool> {
        let mut health = self.health.lock();
        let transitioned = if success {
            health.on_success(config.up)
        } else {
            health.on_failure(config.down)
        };
        let up = health.up;
        drop(health);
        self.up.store(up, Ordering::Relaxed);
        transitioned.then_some(up)
    }

    pub fn health_snapshot(&self) -> HealthState {
        self.health.lock().clone()
    }

    /// Stop this server's prober. In-flight sessions keep running; the
    /// server is only excluded from future selection.
    pub fn stop_check(&self) {
        self.check_cancel.lock().cancel();
    }

    /// Retire the current prober and hand out a token for its successor.
    /// Used when probe timers migrate off a removed event loop.
    pub fn renew_check(&self) -> CancellationToken {
        let mut current = self.check_cancel.lock();
        current.cancel();
        let fresh = CancellationToken::new();
        *current = fresh.clone();
        fresh
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn add_bytes_from_remote(&self, bytes: u64) {
        self.bytes_from_remote.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_to_remote(&self, bytes: u64) {
        self.bytes_to_remote.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_from_remote(&self) -> u64 {
        self.bytes_from_remote.load(Ordering::Relaxed)
    }

    pub fn bytes_to_remote(&self) -> u64 {
        self.bytes_to_remote.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_server_starts_down() {
        let server = Server::new("s1", "127.0.0.1:8080".parse().unwrap(), 10);
        assert!(!server.is_up());
        assert_eq!(server.weight(), 10);
    }

    #[test]
    fn test_probe_transitions_update_cached_flag() {
        let server = Server::new("s1", "127.0.0.1:8080".parse().unwrap(), 10);
        let config = HealthCheckConfig::new(1000, 5000, 2, 3).unwrap();

        assert_eq!(server.record_probe(true, &config), None);
        assert_eq!(server.record_probe(true, &config), Some(true));
        assert!(server.is_up());

        assert_eq!(server.record_probe(false, &config), None);
        assert_eq!(server.record_probe(false, &config), None);
        assert_eq!(server.record_probe(false, &config), Some(false));
        assert!(!server.is_up());
    }

    #[test]
    fn test_session_accounting() {
        let server = Server::new("s1", "127.0.0.1:8080".parse().unwrap(), 10);
        server.session_opened();
        server.session_opened();
        server.session_closed();
        assert_eq!(server.active_sessions(), 1);

        server.add_bytes_from_remote(100);
        server.add_bytes_to_remote(250);
        assert_eq!(server.bytes_from_remote(), 100);
        assert_eq!(server.bytes_to_remote(), 250);
    }
}
