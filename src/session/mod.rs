//! Sessions: paired frontend/backend connections and their relay

pub mod connection;
pub mod relay;

pub use connection::{Connection, ConnectionInfo};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A frontend/backend connection pair. The session exists exactly while
/// both connections are open; closing either side tears down both.
pub struct Session {
    id: Uuid,
    front: Arc<Connection>,
    back: Arc<Connection>,
    listener: String,
    server: Option<String>,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl Session {
    /// Both connections are expected to share `cancel`, so cancelling any
    /// of the three handles tears the whole unit down.
    pub fn new(
        front: Arc<Connection>,
        back: Arc<Connection>,
        listener: &str,
        server: Option<&str>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Session {
            id: Uuid::new_v4(),
            front,
            back,
            listener: listener.to_string(),
            server: server.map(str::to_string),
            created_at: Utc::now(),
            cancel,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn front(&self) -> &Arc<Connection> {
        &self.front
    }

    pub fn back(&self) -> &Arc<Connection> {
        &self.back
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Canonical `front_local/front_remote->back_local/back_remote` form.
    pub fn canonical(&self) -> String {
        format!("{}->{}", self.front.canonical(), self.back.canonical())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            front: self.front.info(),
            back: self.back.info(),
            listener: self.listener.clone(),
            server: self.server.clone(),
            created_at: self.created_at,
        }
    }
}

/// Read-only projection for administrative queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub front: ConnectionInfo,
    pub back: ConnectionInfo,
    pub listener: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_canonical_form() {
        let cancel = CancellationToken::new();
        let front = Connection::new(
            "10.0.0.1:80".parse().unwrap(),
            "192.0.2.9:51234".parse().unwrap(),
            "elg0/el0",
            Some("lb0"),
            None,
            cancel.clone(),
        );
        let back = Connection::new(
            "10.0.0.1:33000".parse().unwrap(),
            "10.0.1.5:8080".parse().unwrap(),
            "elg0/el0",
            Some("lb0"),
            Some("s1"),
            cancel.clone(),
        );
        let session = Session::new(front, back, "lb0", Some("s1"), cancel);
        assert_eq!(
            session.canonical(),
            "10.0.0.1:80/192.0.2.9:51234->10.0.0.1:33000/10.0.1.5:8080"
        );
    }
}
