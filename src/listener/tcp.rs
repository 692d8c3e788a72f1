//! Plain TCP load balancing listener

use super::{ListenerCore, ListenerInfo, ListenerKind, ProxyListener, Target};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Terminates TCP and balances every admitted connection across the
/// backend aggregate.
pub struct TcpLb {
    core: ListenerCore,
    protocol: String,
    cert_keys: RwLock<Vec<String>>,
}

impl TcpLb {
    pub fn new(core: ListenerCore, protocol: String, cert_keys: Vec<String>) -> Arc<Self> {
        Arc::new(TcpLb {
            core,
            protocol,
            cert_keys: RwLock::new(cert_keys),
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn cert_keys(&self) -> Vec<String> {
        self.cert_keys.read().clone()
    }
}

#[async_trait]
impl ProxyListener for TcpLb {
    fn core(&self) -> &ListenerCore {
        &self.core
    }

    fn kind(&self) -> ListenerKind {
        ListenerKind::Tcp
    }

    fn info(&self) -> ListenerInfo {
        let mut info = self.core.common_info(ListenerKind::Tcp);
        info.cert_keys = Some(self.cert_keys());
        info
    }

    async fn on_accept(&self, _stream: &mut TcpStream, _peer: SocketAddr) -> Result<Target> {
        Ok(Target::Balanced)
    }

    async fn on_backend_ready(
        &self,
        _stream: &mut TcpStream,
        _backend_local: SocketAddr,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_backend_error(&self, _stream: &mut TcpStream, _err: &crate::Error) {
        // Nothing to tell a plain TCP client; the close is the signal.
    }
}
