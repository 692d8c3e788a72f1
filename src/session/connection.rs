//! Live connection record

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One half of a relay: a single TCP connection with byte accounting.
///
/// Counters are written on the owning loop's thread next to the transfer
/// itself; administrative readers use atomic loads.
pub struct Connection {
    id: Uuid,
    local: SocketAddr,
    remote: SocketAddr,
    loop_label: String,
    listener: Option<String>,
    server: Option<String>,
    bytes_from_remote: AtomicU64,
    bytes_to_remote: AtomicU64,
    open: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(
        local: SocketAddr,
        remote: SocketAddr,
        loop_label: &str,
        listener: Option<&str>,
        server: Option<&str>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Connection {
            id: Uuid::new_v4(),
            local,
            remote,
            loop_label: loop_label.to_string(),
            listener: listener.map(str::to_string),
            server: server.map(str::to_string),
            bytes_from_remote: AtomicU64::new(0),
            bytes_to_remote: AtomicU64::new(0),
            open: AtomicBool::new(true),
            cancel,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn loop_label(&self) -> &str {
        &self.loop_label
    }

    pub fn listener(&self) -> Option<&str> {
        self.listener.as_deref()
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Canonical `localAddr:port/remoteAddr:port` form used by selectors.
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.local, self.remote)
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

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    /// Cancel any in-flight work tied to this connection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            local: self.local.to_string(),
            remote: self.remote.to_string(),
            event_loop: self.loop_label.clone(),
            listener: self.listener.clone(),
            server: self.server.clone(),
            bytes_from_remote: self.bytes_from_remote(),
            bytes_to_remote: self.bytes_to_remote(),
            open: self.is_open(),
        }
    }
}

/// Read-only projection for administrative queries.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub local: String,
    pub remote: String,
    #[serde(rename = "eventLoop")]
    pub event_loop: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(rename = "bytesFromRemote")]
    pub bytes_from_remote: u64,
    #[serde(rename = "bytesToRemote")]
    pub bytes_to_remote: u64,
    pub open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form() {
        let conn = Connection::new(
            "10.0.0.1:80".parse().unwrap(),
            "192.0.2.9:51234".parse().unwrap(),
            "elg0/el0",
            Some("lb0"),
            None,
            CancellationToken::new(),
        );
        assert_eq!(conn.canonical(), "10.0.0.1:80/192.0.2.9:51234");
    }

    #[test]
    fn test_counters_are_monotonic() {
        let conn = Connection::new(
            "10.0.0.1:80".parse().unwrap(),
            "192.0.2.9:51234".parse().unwrap(),
            "elg0/el0",
            None,
            None,
            CancellationToken::new(),
        );
        conn.add_bytes_from_remote(10);
        conn.add_bytes_from_remote(5);
        conn.add_bytes_to_remote(7);
        assert_eq!(conn.bytes_from_remote(), 15);
        assert_eq!(conn.bytes_to_remote(), 7);
    }
}
