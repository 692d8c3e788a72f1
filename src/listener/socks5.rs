//! SOCKS5 listener variant
//!
//! Adds the protocol negotiation pre-stage in front of the common
//! admission/selection/relay path. The CONNECT destination is the relay
//! target; unless allow-non-backend is set, it must match an UP member of
//! the backend aggregate.

use super::{ListenerCore, ListenerInfo, ListenerKind, ProxyListener, Target};
use crate::common::net::Address;
use crate::common::socks::{
    Command, Greeting, MethodSelection, Reply, Request, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH,
    REP_CONNECTION_NOT_ALLOWED, REP_CONNECTION_REFUSED, REP_GENERAL_FAILURE,
    REP_COMMAND_NOT_SUPPORTED, REP_HOST_UNREACHABLE,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS5 server backed by a server-groups aggregate.
pub struct Socks5Server {
    core: ListenerCore,
    allow_non_backend: AtomicBool,
}

impl Socks5Server {
    pub fn new(core: ListenerCore, allow_non_backend: bool) -> Arc<Self> {
        Arc::new(Socks5Server {
            core,
            allow_non_backend: AtomicBool::new(allow_non_backend),
        })
    }

    pub fn allow_non_backend(&self) -> bool {
        self.allow_non_backend.load(Ordering::Relaxed)
    }

    /// Map the requested destination onto a relay target, answering the
    /// refusal on the stream before failing.
    async fn resolve_destination(
        &self,
        stream: &mut TcpStream,
        address: Address,
        port: u16,
    ) -> Result<Target> {
        let destination = match address.to_socket_addr(port) {
            Some(addr) => addr,
            None => {
                // Name resolution belongs to an external collaborator, so a
                // domain destination can never be relayed here.
                let reply = if self.allow_non_backend() {
                    REP_HOST_UNREACHABLE
                } else {
                    REP_CONNECTION_NOT_ALLOWED
                };
                Reply::failure(reply).write_to(stream).await?;
                return Err(Error::rejected(format!(
                    "domain destination {}",
                    address.to_string_with_port(port)
                )));
            }
        };

        if let Some((group, server)) = self.core.backend().lookup_server(destination) {
            if server.is_up() {
                return Ok(Target::Server(server));
            }
            Reply::failure(REP_HOST_UNREACHABLE).write_to(stream).await?;
            return Err(Error::no_healthy_server(format!(
                "server {} in group {}",
                server.name(),
                group.name()
            )));
        }

        if self.allow_non_backend() {
            return Ok(Target::Direct(destination));
        }

        Reply::failure(REP_CONNECTION_NOT_ALLOWED)
            .write_to(stream)
            .await?;
        Err(Error::rejected(format!(
            "destination {} is not a backend member",
            destination
        )))
    }
}

#[async_trait]
impl ProxyListener for Socks5Server {
    fn core(&self) -> &ListenerCore {
        &self.core
    }

    fn kind(&self) -> ListenerKind {
        ListenerKind::Socks5
    }

    fn info(&self) -> ListenerInfo {
        let mut info = self.core.common_info(ListenerKind::Socks5);
        info.allow_non_backend = Some(self.allow_non_backend());
        info
    }

    async fn on_accept(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<Target> {
        let greeting = Greeting::read_from(stream).await?;
        if !greeting.no_auth {
            MethodSelection::new(AUTH_NO_ACCEPTABLE)
                .write_to(stream)
                .await?;
            return Err(Error::protocol("no acceptable authentication method"));
        }
        MethodSelection::new(AUTH_NO_AUTH).write_to(stream).await?;

        let request = Request::read_from(stream).await?;
        match request.command {
            Command::Connect => {}
            other => {
                Reply::failure(REP_COMMAND_NOT_SUPPORTED)
                    .write_to(stream)
                    .await?;
                return Err(Error::protocol(format!("unsupported command {:?}", other)));
            }
        }

        debug!(
            "{}: SOCKS5 CONNECT {} -> {}",
            self.core.name(),
            peer,
            request.address.to_string_with_port(request.port)
        );
        self.resolve_destination(stream, request.address, request.port)
            .await
    }

    async fn on_backend_ready(
        &self,
        stream: &mut TcpStream,
        backend_local: SocketAddr,
    ) -> Result<()> {
        Reply::success(Address::from(backend_local.ip()), backend_local.port())
            .write_to(stream)
            .await
    }

    async fn on_backend_error(&self, stream: &mut TcpStream, err: &Error) {
        let reply = match err {
            Error::NoHealthyServer(_) => REP_HOST_UNREACHABLE,
            Error::Rejected(_) => REP_CONNECTION_NOT_ALLOWED,
            Error::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
            Error::Timeout(_) => REP_HOST_UNREACHABLE,
            _ => REP_GENERAL_FAILURE,
        };
        let _ = Reply::failure(reply).write_to(stream).await;
    }

    fn set_allow_non_backend(&self, allow: bool) -> Result<()> {
        self.allow_non_backend.store(allow, Ordering::Relaxed);
        Ok(())
    }
}
