//! Bidirectional byte relay between a session's two connections

use super::Session;
use crate::backend::Server;
use crate::registry::ConnectionRegistry;
use crate::{Error, Result};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Move bytes from `reader` to `writer` through one bounded buffer.
///
/// The next read only happens after the previous chunk fully drained to the
/// peer, so memory per direction never exceeds `capacity`. Counters are
/// bumped via `on_transfer` right after the bytes are written out.
async fn pump<R, W, F>(
    mut reader: R,
    mut writer: W,
    capacity: usize,
    on_transfer: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; capacity.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        on_transfer(n as u64);
    }
}

/// Teardown that must run exactly once per session, even when the relay
/// task itself is dropped with its event loop.
struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    session: Arc<Session>,
    server: Option<Arc<Server>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.front().mark_closed();
        self.session.back().mark_closed();
        if let Some(server) = &self.server {
            server.session_closed();
        }
        self.registry.deregister_session(&self.session);
        debug!("session {} closed", self.session.canonical());
    }
}

/// Drive a session until either side closes, errors, or the session is
/// force-removed. Teardown (counter updates, registry deregistration)
/// rides a guard so it also happens when the owning loop goes away.
pub async fn run_session(
    registry: Arc<ConnectionRegistry>,
    session: Arc<Session>,
    front: TcpStream,
    back: TcpStream,
    server: Option<Arc<Server>>,
    in_buffer_size: usize,
    out_buffer_size: usize,
) {
    let front_conn = session.front().clone();
    let back_conn = session.back().clone();
    let cancel = session.cancel_token().clone();
    let _guard = SessionGuard {
        registry,
        session: session.clone(),
        server: server.clone(),
    };

    let (front_read, front_write) = front.into_split();
    let (back_read, back_write) = back.into_split();

    let inbound = {
        let front_conn = front_conn.clone();
        let back_conn = back_conn.clone();
        let server = server.clone();
        pump(front_read, back_write, in_buffer_size, move |n| {
            front_conn.add_bytes_from_remote(n);
            back_conn.add_bytes_to_remote(n);
            if let Some(server) = &server {
                server.add_bytes_to_remote(n);
            }
        })
    };
    let outbound = {
        let front_conn = front_conn.clone();
        let back_conn = back_conn.clone();
        let server = server.clone();
        pump(back_read, front_write, out_buffer_size, move |n| {
            back_conn.add_bytes_from_remote(n);
            front_conn.add_bytes_to_remote(n);
            if let Some(server) = &server {
                server.add_bytes_from_remote(n);
            }
        })
    };
    tokio::pin!(inbound);
    tokio::pin!(outbound);

    // Either connection closing (peer close, error, forced removal) ends
    // the session; the finishing pump has already flushed what it buffered.
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("session {} force closed", session.canonical());
        }
        result = &mut inbound => {
            log_pump_end(&session, "frontend", &result);
        }
        result = &mut outbound => {
            log_pump_end(&session, "backend", &result);
        }
    }
}

fn log_pump_end(session: &Session, side: &str, result: &io::Result<u64>) {
    match result {
        Ok(n) => debug!(
            "session {}: {} closed after {} bytes",
            session.canonical(),
            side,
            n
        ),
        Err(e) => debug!("session {}: {} error: {}", session.canonical(), side, e),
    }
}

/// Open the backend connection with a bounded, cancellable connect.
pub async fn connect_backend(
    address: std::net::SocketAddr,
    timeout: std::time::Duration,
) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            crate::common::net::configure_tcp_stream(&stream);
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::timeout(format!("connect to {}", address))),
    }
}
