//! Proxy listeners
//!
//! Both variants share one pipeline: accept on an acceptor loop, admission
//! check, hand the socket to a worker loop, run the variant's handshake
//! pre-stage, resolve a backend, connect non-blockingly while the frontend
//! stays paused, then relay. The variants differ only in the `on_accept`
//! handshake and in how backend readiness/failure is answered.

pub mod socks5;
pub mod tcp;

pub use socks5::Socks5Server;
pub use tcp::TcpLb;

use crate::backend::{Server, ServerGroups};
use crate::common::net::{configure_std_listener, configure_tcp_stream};
use crate::eventloop::EventLoopGroup;
use crate::registry::ConnectionRegistry;
use crate::security::{Protocol, RuleAction, SecurityGroup};
use crate::session::{relay, Connection, Session};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default relay buffer size per direction, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Budget for the non-blocking backend connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Tcp,
    Socks5,
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerKind::Tcp => write!(f, "tcp-lb"),
            ListenerKind::Socks5 => write!(f, "socks5-server"),
        }
    }
}

/// Relay target resolved from the handshake.
pub enum Target {
    /// Balance across the listener's backend aggregate.
    Balanced,
    /// A specific backend member (SOCKS5 destination matched a server).
    Server(Arc<Server>),
    /// A non-backend destination (SOCKS5 with allow-non-backend).
    Direct(SocketAddr),
}

/// State shared by every listener variant.
pub struct ListenerCore {
    name: String,
    bind_addr: SocketAddr,
    local_addr: SocketAddr,
    backend: Arc<ServerGroups>,
    security_group: RwLock<Arc<SecurityGroup>>,
    in_buffer_size: AtomicUsize,
    out_buffer_size: AtomicUsize,
    acceptor_group: Arc<EventLoopGroup>,
    worker_group: Arc<EventLoopGroup>,
    registry: Arc<ConnectionRegistry>,
    accepted: AtomicU64,
    cancel: CancellationToken,
    std_listener: Mutex<Option<std::net::TcpListener>>,
    acceptor_label: Mutex<Option<String>>,
}

impl ListenerCore {
    /// Reserve the bind address immediately so an unusable address fails
    /// the create operation instead of the first accept.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        name: &str,
        bind_addr: SocketAddr,
        backend: Arc<ServerGroups>,
        security_group: Arc<SecurityGroup>,
        in_buffer_size: usize,
        out_buffer_size: usize,
        acceptor_group: Arc<EventLoopGroup>,
        worker_group: Arc<EventLoopGroup>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(bind_addr)?;
        configure_std_listener(&std_listener);
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        Ok(ListenerCore {
            name: name.to_string(),
            bind_addr,
            local_addr,
            backend,
            security_group: RwLock::new(security_group),
            in_buffer_size: AtomicUsize::new(in_buffer_size),
            out_buffer_size: AtomicUsize::new(out_buffer_size),
            acceptor_group,
            worker_group,
            registry,
            accepted: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            std_listener: Mutex::new(Some(std_listener)),
            acceptor_label: Mutex::new(None),
        })
    }

    /// The loop currently running the accept task, if any.
    pub fn acceptor_label(&self) -> Option<String> {
        self.acceptor_label.lock().clone()
    }

    /// Re-reserve the bound address so the accept loop can be restarted,
    /// e.g. after its acceptor loop was removed (the old socket died with
    /// that loop's reactor).
    pub(crate) fn rebind(&self) -> Result<()> {
        let std_listener = std::net::TcpListener::bind(self.local_addr)?;
        configure_std_listener(&std_listener);
        std_listener.set_nonblocking(true)?;
        *self.std_listener.lock() = Some(std_listener);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound address (resolves port 0 binds).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn backend(&self) -> &Arc<ServerGroups> {
        &self.backend
    }

    pub fn security_group(&self) -> Arc<SecurityGroup> {
        self.security_group.read().clone()
    }

    pub fn set_security_group(&self, group: Arc<SecurityGroup>) {
        *self.security_group.write() = group;
    }

    pub fn in_buffer_size(&self) -> usize {
        self.in_buffer_size.load(Ordering::Relaxed)
    }

    pub fn out_buffer_size(&self) -> usize {
        self.out_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_buffer_sizes(&self, in_size: usize, out_size: usize) {
        self.in_buffer_size.store(in_size, Ordering::Relaxed);
        self.out_buffer_size.store(out_size, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Stop accepting. Established sessions are closed separately through
    /// the registry by the caller.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn common_info(&self, kind: ListenerKind) -> ListenerInfo {
        ListenerInfo {
            name: self.name.clone(),
            kind: kind.to_string(),
            address: self.bind_addr.to_string(),
            backend: self.backend.name().to_string(),
            security_group: self.security_group().name().to_string(),
            in_buffer_size: self.in_buffer_size(),
            out_buffer_size: self.out_buffer_size(),
            acceptor_loop_group: self.acceptor_group.name().to_string(),
            worker_loop_group: self.worker_group.name().to_string(),
            accepted: self.accepted(),
            cert_keys: None,
            allow_non_backend: None,
        }
    }
}

/// Read-only projection for administrative queries.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub name: String,
    pub kind: String,
    pub address: String,
    pub backend: String,
    #[serde(rename = "securityGroup")]
    pub security_group: String,
    #[serde(rename = "inBufferSize")]
    pub in_buffer_size: usize,
    #[serde(rename = "outBufferSize")]
    pub out_buffer_size: usize,
    #[serde(rename = "acceptorLoopGroup")]
    pub acceptor_loop_group: String,
    #[serde(rename = "workerLoopGroup")]
    pub worker_loop_group: String,
    pub accepted: u64,
    #[serde(rename = "certKeys", skip_serializing_if = "Option::is_none")]
    pub cert_keys: Option<Vec<String>>,
    #[serde(rename = "allowNonBackend", skip_serializing_if = "Option::is_none")]
    pub allow_non_backend: Option<bool>,
}

/// The seam between the shared pipeline and the listener variants.
#[async_trait]
pub trait ProxyListener: Send + Sync {
    fn core(&self) -> &ListenerCore;

    fn kind(&self) -> ListenerKind;

    fn info(&self) -> ListenerInfo;

    /// Admission control for a freshly accepted frontend. Denial is a
    /// policy outcome: the socket is closed without further processing.
    fn on_admission(&self, peer: SocketAddr) -> bool {
        let core = self.core();
        core.security_group()
            .check(peer.ip(), Protocol::Tcp, core.local_addr().port())
            == RuleAction::Allow
    }

    /// Variant handshake pre-stage. The plain TCP variant reads nothing;
    /// the SOCKS5 variant negotiates and resolves the CONNECT destination,
    /// answering its own refusals before returning an error.
    async fn on_accept(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<Target>;

    /// Called on the frontend once the backend connection is established.
    async fn on_backend_ready(&self, stream: &mut TcpStream, backend_local: SocketAddr)
        -> Result<()>;

    /// Called when selection or the backend connect failed after a
    /// successful handshake, before the frontend is closed.
    async fn on_backend_error(&self, stream: &mut TcpStream, err: &Error);

    /// SOCKS5-only toggle; other variants refuse it.
    fn set_allow_non_backend(&self, _allow: bool) -> Result<()> {
        Err(Error::invalid_argument(
            "allow-non-backend only applies to socks5-server",
        ))
    }
}

/// Bind-to-accept glue: spawn the accept loop on one of the listener's
/// acceptor loops.
pub fn start(listener: Arc<dyn ProxyListener>) -> Result<()> {
    let core = listener.core();
    let std_listener = core
        .std_listener
        .lock()
        .take()
        .ok_or_else(|| Error::io_error(format!("listener {} already started", core.name())))?;
    let acceptor = core.acceptor_group.next_loop()?;
    *core.acceptor_label.lock() = Some(acceptor.label().to_string());
    let cancel = core.cancel.clone();

    acceptor.spawn(async move {
        let tcp = match TcpListener::from_std(std_listener) {
            Ok(t) => t,
            Err(e) => {
                error!(
                    "{} {}: registering listener socket failed: {}",
                    listener.kind(),
                    listener.core().name(),
                    e
                );
                return;
            }
        };
        info!(
            "{} {} listening on {}",
            listener.kind(),
            listener.core().name(),
            listener.core().local_addr()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = tcp.accept() => match accepted {
                    Ok((stream, peer)) => dispatch_accept(listener.clone(), stream, peer),
                    Err(e) => {
                        if !cancel.is_cancelled() {
                            error!("{} accept error: {}", listener.core().name(), e);
                        }
                    }
                }
            }
        }
        debug!("{} accept loop stopped", listener.core().name());
    });

    Ok(())
}

/// Restart accepting on a fresh loop after the previous accept task died
/// with its reactor.
pub fn restart(listener: Arc<dyn ProxyListener>) -> Result<()> {
    listener.core().rebind()?;
    start(listener)
}

/// Runs on the acceptor loop: count, admit, then hand the socket to a
/// worker loop for everything that can block.
fn dispatch_accept(listener: Arc<dyn ProxyListener>, stream: TcpStream, peer: SocketAddr) {
    let core = listener.core();
    core.accepted.fetch_add(1, Ordering::Relaxed);
    configure_tcp_stream(&stream);

    if !listener.on_admission(peer) {
        debug!("{}: connection from {} denied", core.name(), peer);
        return;
    }

    let worker = match core.worker_group.next_loop() {
        Ok(w) => w,
        Err(e) => {
            warn!("{}: no worker loop: {}", core.name(), e);
            return;
        }
    };
    let std_stream = match stream.into_std() {
        Ok(s) => s,
        Err(e) => {
            debug!("{}: detaching accepted socket failed: {}", core.name(), e);
            return;
        }
    };

    let loop_label = worker.label().to_string();
    worker.spawn(async move {
        handle_connection(listener, std_stream, peer, loop_label).await;
    });
}

/// Runs on the worker loop that owns the connection from here on.
async fn handle_connection(
    listener: Arc<dyn ProxyListener>,
    std_stream: std::net::TcpStream,
    peer: SocketAddr,
    loop_label: String,
) {
    let core = listener.core();
    let mut stream = match TcpStream::from_std(std_stream) {
        Ok(s) => s,
        Err(e) => {
            debug!("{}: adopting socket from {} failed: {}", core.name(), peer, e);
            return;
        }
    };
    let local = stream.local_addr().unwrap_or_else(|_| core.local_addr());

    let cancel = CancellationToken::new();
    let front_conn = Connection::new(
        local,
        peer,
        &loop_label,
        Some(core.name()),
        None,
        cancel.clone(),
    );
    core.registry.register_connection(front_conn.clone());

    let target = tokio::select! {
        _ = cancel.cancelled() => {
            front_conn.mark_closed();
            core.registry.deregister_connection(front_conn.id());
            return;
        }
        accepted = listener.on_accept(&mut stream, peer) => match accepted {
            Ok(t) => t,
            Err(e) => {
                debug!("{}: handshake with {} failed: {}", core.name(), peer, e);
                front_conn.mark_closed();
                core.registry.deregister_connection(front_conn.id());
                return;
            }
        }
    };

    let (server, backend_addr) = match resolve_target(core, peer, target) {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!("{}: no backend for {}: {}", core.name(), peer, e);
            listener.on_backend_error(&mut stream, &e).await;
            front_conn.mark_closed();
            core.registry.deregister_connection(front_conn.id());
            return;
        }
    };

    // Frontend reads stay paused until the backend connect resolves or the
    // connection is force-removed in the meantime.
    let back_stream = tokio::select! {
        _ = cancel.cancelled() => {
            front_conn.mark_closed();
            core.registry.deregister_connection(front_conn.id());
            return;
        }
        connected = relay::connect_backend(backend_addr, CONNECT_TIMEOUT) => match connected {
            Ok(s) => s,
            Err(e) => {
                debug!(
                    "{}: backend connect {} failed: {}",
                    core.name(),
                    backend_addr,
                    e
                );
                listener.on_backend_error(&mut stream, &e).await;
                front_conn.mark_closed();
                core.registry.deregister_connection(front_conn.id());
                return;
            }
        }
    };

    let back_local = match back_stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!("{}: backend socket unusable: {}", core.name(), e);
            front_conn.mark_closed();
            core.registry.deregister_connection(front_conn.id());
            return;
        }
    };

    if let Err(e) = listener.on_backend_ready(&mut stream, back_local).await {
        debug!("{}: answering {} failed: {}", core.name(), peer, e);
        front_conn.mark_closed();
        core.registry.deregister_connection(front_conn.id());
        return;
    }

    let server_name = server.as_ref().map(|s| s.name().to_string());
    let back_conn = Connection::new(
        back_local,
        backend_addr,
        &loop_label,
        Some(core.name()),
        server_name.as_deref(),
        cancel.clone(),
    );
    core.registry.register_connection(back_conn.clone());

    let session = Session::new(
        front_conn,
        back_conn,
        core.name(),
        server_name.as_deref(),
        cancel,
    );
    core.registry.register_session(session.clone());
    if let Some(server) = &server {
        server.session_opened();
    }
    debug!("{}: session {} established", core.name(), session.canonical());

    relay::run_session(
        core.registry.clone(),
        session,
        stream,
        back_stream,
        server,
        core.in_buffer_size(),
        core.out_buffer_size(),
    )
    .await;
}

fn resolve_target(
    core: &ListenerCore,
    peer: SocketAddr,
    target: Target,
) -> Result<(Option<Arc<Server>>, SocketAddr)> {
    match target {
        Target::Balanced => {
            let server = core.backend.select(peer.ip())?;
            let addr = server.address();
            Ok((Some(server), addr))
        }
        Target::Server(server) => {
            let addr = server.address();
            Ok((Some(server), addr))
        }
        Target::Direct(addr) => Ok((None, addr)),
    }
}
