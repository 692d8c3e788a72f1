//! Connection registry - live connection/session indices
//!
//! The registry is the canonical owner of connection and session records,
//! keyed by opaque identifiers; sessions and connections refer to each other
//! through the registry, never by back-pointer, so teardown is always
//! registry-driven. Listing is administrative and low-frequency; it scans
//! rather than maintaining per-scope indices.

use crate::session::{Connection, Session};
use crate::{Error, Result};
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Administrative scope for listing and forced removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// All entries (shutdown paths).
    All,
    /// One event loop, identified by its `group/loop` label.
    Loop(String),
    /// One listener by name.
    Listener(String),
    /// One backend server by name.
    Server(String),
}

impl Scope {
    fn matches_connection(&self, conn: &Connection) -> bool {
        match self {
            Scope::All => true,
            Scope::Loop(label) => conn.loop_label() == label,
            Scope::Listener(name) => conn.listener() == Some(name.as_str()),
            Scope::Server(name) => conn.server() == Some(name.as_str()),
        }
    }

    fn matches_session(&self, session: &Session) -> bool {
        match self {
            Scope::All => true,
            Scope::Listener(name) => session.listener() == name,
            _ => {
                self.matches_connection(session.front()) || self.matches_connection(session.back())
            }
        }
    }
}

/// Non-owning-index registry over live connections and sessions.
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<Connection>>,
    sessions: DashMap<Uuid, Arc<Session>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    pub fn register_connection(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    pub fn register_session(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    /// Data-path deregistration on teardown. Tolerates entries that an
    /// administrative removal already took out.
    pub fn deregister_session(&self, session: &Session) {
        self.sessions.remove(&session.id());
        self.connections.remove(&session.front().id());
        self.connections.remove(&session.back().id());
    }

    pub fn deregister_connection(&self, id: Uuid) {
        self.connections.remove(&id);
    }

    pub fn list_connections(&self, scope: &Scope) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| scope.matches_connection(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn list_sessions(&self, scope: &Scope) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|e| scope.matches_session(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove one connection matching the canonical `local/remote` selector.
    /// Fails NotFound when nothing matches, including a repeat removal.
    pub fn remove_connection_exact(&self, selector: &str, scope: &Scope) -> Result<usize> {
        let target = self
            .list_connections(scope)
            .into_iter()
            .find(|c| c.canonical() == selector)
            .ok_or_else(|| Error::not_found(format!("connection {}", selector)))?;
        self.force_remove_connection(&target);
        Ok(1)
    }

    /// Remove one session matching the canonical front->back selector.
    pub fn remove_session_exact(&self, selector: &str, scope: &Scope) -> Result<usize> {
        let target = self
            .list_sessions(scope)
            .into_iter()
            .find(|s| s.canonical() == selector)
            .ok_or_else(|| Error::not_found(format!("session {}", selector)))?;
        self.force_remove_session(&target);
        Ok(1)
    }

    /// Remove every connection in scope whose canonical form matches the
    /// pattern. Zero matches is a valid result, not an error.
    pub fn remove_connections_matching(&self, pattern: &str, scope: &Scope) -> Result<usize> {
        let re = Regex::new(pattern)?;
        let targets: Vec<Arc<Connection>> = self
            .list_connections(scope)
            .into_iter()
            .filter(|c| re.is_match(&c.canonical()))
            .collect();
        let count = targets.len();
        for conn in targets {
            self.force_remove_connection(&conn);
        }
        Ok(count)
    }

    pub fn remove_sessions_matching(&self, pattern: &str, scope: &Scope) -> Result<usize> {
        let re = Regex::new(pattern)?;
        let targets: Vec<Arc<Session>> = self
            .list_sessions(scope)
            .into_iter()
            .filter(|s| re.is_match(&s.canonical()))
            .collect();
        let count = targets.len();
        for session in targets {
            self.force_remove_session(&session);
        }
        Ok(count)
    }

    /// Close everything owned by one event loop. Used before the loop's
    /// reactor is destroyed.
    pub fn close_loop(&self, label: &str) -> usize {
        let scope = Scope::Loop(label.to_string());
        let targets = self.list_connections(&scope);
        let count = targets.len();
        for conn in targets {
            self.force_remove_connection(&conn);
        }
        count
    }

    /// Close everything created through one listener.
    pub fn close_listener(&self, name: &str) -> usize {
        let scope = Scope::Listener(name.to_string());
        let targets = self.list_connections(&scope);
        let count = targets.len();
        for conn in targets {
            self.force_remove_connection(&conn);
        }
        count
    }

    /// Close every connection and session; shutdown path.
    pub fn close_all(&self) -> usize {
        let targets = self.list_connections(&Scope::All);
        let count = targets.len();
        for conn in targets {
            self.force_remove_connection(&conn);
        }
        for session in self.list_sessions(&Scope::All) {
            self.force_remove_session(&session);
        }
        count
    }

    /// Cancel the connection and synchronously drop it, its session, and
    /// the session's other connection from the indices. The relay observes
    /// the cancellation on its owning loop and finishes teardown there.
    fn force_remove_connection(&self, conn: &Arc<Connection>) {
        conn.cancel();
        self.connections.remove(&conn.id());

        let owners: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| {
                e.value().front().id() == conn.id() || e.value().back().id() == conn.id()
            })
            .map(|e| e.value().clone())
            .collect();
        for session in owners {
            self.force_remove_session(&session);
        }
        debug!("connection {} removed from registry", conn.canonical());
    }

    fn force_remove_session(&self, session: &Arc<Session>) {
        session.cancel();
        self.sessions.remove(&session.id());
        self.connections.remove(&session.front().id());
        self.connections.remove(&session.back().id());
        debug!("session {} removed from registry", session.canonical());
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn conn(
        local: &str,
        remote: &str,
        loop_label: &str,
        listener: Option<&str>,
        server: Option<&str>,
    ) -> Arc<Connection> {
        Connection::new(
            local.parse().unwrap(),
            remote.parse().unwrap(),
            loop_label,
            listener,
            server,
            CancellationToken::new(),
        )
    }

    fn session_pair(registry: &ConnectionRegistry, client_port: u16) -> Arc<Session> {
        let cancel = CancellationToken::new();
        let front = Connection::new(
            "10.0.0.1:80".parse().unwrap(),
            format!("192.0.2.9:{}", client_port).parse().unwrap(),
            "elg0/el0",
            Some("lb0"),
            None,
            cancel.clone(),
        );
        let back = Connection::new(
            format!("10.0.0.1:{}", 30000 + client_port).parse().unwrap(),
            "10.0.1.5:8080".parse().unwrap(),
            "elg0/el0",
            Some("lb0"),
            Some("s1"),
            cancel.clone(),
        );
        registry.register_connection(front.clone());
        registry.register_connection(back.clone());
        let session = Session::new(front, back, "lb0", Some("s1"), cancel);
        registry.register_session(session.clone());
        session
    }

    #[test]
    fn test_list_by_scope() {
        let registry = ConnectionRegistry::new();
        registry.register_connection(conn(
            "10.0.0.1:80",
            "192.0.2.9:1000",
            "elg0/el0",
            Some("lb0"),
            None,
        ));
        registry.register_connection(conn(
            "10.0.0.1:80",
            "192.0.2.9:1001",
            "elg0/el1",
            Some("lb0"),
            Some("s1"),
        ));

        assert_eq!(
            registry
                .list_connections(&Scope::Loop("elg0/el0".to_string()))
                .len(),
            1
        );
        assert_eq!(
            registry
                .list_connections(&Scope::Listener("lb0".to_string()))
                .len(),
            2
        );
        assert_eq!(
            registry
                .list_connections(&Scope::Server("s1".to_string()))
                .len(),
            1
        );
        assert_eq!(
            registry
                .list_connections(&Scope::Server("s2".to_string()))
                .len(),
            0
        );
    }

    #[test]
    fn test_remove_exact_then_repeat_is_not_found() {
        let registry = ConnectionRegistry::new();
        let c = conn(
            "10.0.0.1:80",
            "192.0.2.9:1000",
            "elg0/el0",
            Some("lb0"),
            None,
        );
        registry.register_connection(c.clone());
        let scope = Scope::Listener("lb0".to_string());

        // absent identifier fails before anything was removed
        assert!(registry
            .remove_connection_exact("10.0.0.1:80/192.0.2.9:9999", &scope)
            .unwrap_err()
            .is_not_found());

        let removed = registry
            .remove_connection_exact(&c.canonical(), &scope)
            .unwrap();
        assert_eq!(removed, 1);

        // second removal of the same identifier also fails
        assert!(registry
            .remove_connection_exact(&c.canonical(), &scope)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_remove_matching_counts() {
        let registry = ConnectionRegistry::new();
        for port in [1000, 1001, 2000] {
            registry.register_connection(conn(
                "10.0.0.1:80",
                &format!("192.0.2.9:{}", port),
                "elg0/el0",
                Some("lb0"),
                None,
            ));
        }
        let scope = Scope::Listener("lb0".to_string());

        let none = registry
            .remove_connections_matching(r"192\.0\.2\.9:3\d+", &scope)
            .unwrap();
        assert_eq!(none, 0);
        assert_eq!(registry.connection_count(), 3);

        let removed = registry
            .remove_connections_matching(r"192\.0\.2\.9:1\d+", &scope)
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_bad_pattern_is_invalid_argument() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .remove_connections_matching("[", &Scope::All)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_removing_connection_removes_its_session() {
        let registry = ConnectionRegistry::new();
        let session = session_pair(&registry, 1000);
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.session_count(), 1);

        registry
            .remove_connection_exact(
                &session.front().canonical(),
                &Scope::Listener("lb0".to_string()),
            )
            .unwrap();

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.session_count(), 0);
        assert!(session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_remove_session_exact() {
        let registry = ConnectionRegistry::new();
        let session = session_pair(&registry, 1000);
        let scope = Scope::Listener("lb0".to_string());

        assert_eq!(
            registry
                .remove_session_exact(&session.canonical(), &scope)
                .unwrap(),
            1
        );
        assert!(registry
            .remove_session_exact(&session.canonical(), &scope)
            .unwrap_err()
            .is_not_found());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_close_loop_scopes_to_owner() {
        let registry = ConnectionRegistry::new();
        registry.register_connection(conn(
            "10.0.0.1:80",
            "192.0.2.9:1000",
            "elg0/el0",
            Some("lb0"),
            None,
        ));
        registry.register_connection(conn(
            "10.0.0.1:80",
            "192.0.2.9:1001",
            "elg0/el1",
            Some("lb0"),
            None,
        ));

        assert_eq!(registry.close_loop("elg0/el0"), 1);
        assert_eq!(registry.connection_count(), 1);
    }
}
