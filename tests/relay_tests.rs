//! End-to-end relay tests
//!
//! Build a topology through the administrative grammar, run real sockets
//! through the listeners, and check byte accounting and forced teardown
//! behave as advertised.

use passage::command::Response;
use passage::registry::Scope;
use passage::App;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Echo server used as a backend.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Wait until the named server has passed enough probes to come up.
async fn wait_until_up(app: &App, group: &str, server: &str) {
    let server = app
        .get_server_group(group)
        .unwrap()
        .get_server(server)
        .unwrap();
    for _ in 0..100 {
        if server.is_up() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server never became healthy");
}

fn bound_addr(app: &App, name: &str) -> SocketAddr {
    app.get_listener(name, None).unwrap().core().local_addr()
}

async fn build_lb(app: &Arc<App>, backend: SocketAddr) {
    app.execute("add server-group sg0 timeout 500 period 100 up 2 down 3 method wrr")
        .unwrap();
    app.execute(&format!(
        "add server s1 to server-group sg0 address {} weight 10",
        backend
    ))
    .unwrap();
    app.execute("add server-groups sgs0").unwrap();
    app.execute("add server-group sg0 to server-groups sgs0 weight 10")
        .unwrap();
    wait_until_up(app, "sg0", "s1").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_lb_relays_and_accounts_bytes() {
    let app = App::new().unwrap();
    let backend = spawn_echo().await;
    build_lb(&app, backend).await;
    app.execute("add tcp-lb lb0 address 127.0.0.1:0 backend sgs0")
        .unwrap();

    let mut client = TcpStream::connect(bound_addr(&app, "lb0")).await.unwrap();
    let payload = b"ping through the balancer";
    client.write_all(payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, payload);

    // both directions are accounted on both sides of the session
    let sessions = app
        .registry()
        .list_sessions(&Scope::Listener("lb0".to_string()));
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    let n = payload.len() as u64;
    assert_eq!(session.front().bytes_from_remote(), n);
    assert_eq!(session.back().bytes_to_remote(), n);
    assert_eq!(session.back().bytes_from_remote(), n);
    assert_eq!(session.front().bytes_to_remote(), n);

    let server = app
        .get_server_group("sg0")
        .unwrap()
        .get_server("s1")
        .unwrap();
    assert_eq!(server.active_sessions(), 1);
    assert_eq!(server.bytes_to_remote(), n);
    assert_eq!(server.bytes_from_remote(), n);

    // forced teardown: once, then NotFound on repeat
    let selector = session.canonical();
    assert_eq!(
        app.execute(&format!("force-remove session {} in tcp-lb lb0", selector))
            .unwrap(),
        Response::Removed(1)
    );
    assert!(app
        .execute(&format!("force-remove session {} in tcp-lb lb0", selector))
        .unwrap_err()
        .is_not_found());

    // the client observes the close
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
    assert!(rest.is_empty());

    app.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_lb_with_deny_all_closes_immediately() {
    let app = App::new().unwrap();
    let backend = spawn_echo().await;
    build_lb(&app, backend).await;
    app.execute("add security-group lockdown default deny")
        .unwrap();
    app.execute("add tcp-lb lb0 address 127.0.0.1:0 backend sgs0 security-group lockdown")
        .unwrap();

    let mut client = TcpStream::connect(bound_addr(&app, "lb0")).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
        .await
        .expect("denied connection should close, not hang");
    assert!(matches!(read, Ok(0)) || read.is_err());

    // denial is a policy outcome: nothing reaches the registry
    assert_eq!(
        app.registry()
            .list_connections(&Scope::Listener("lb0".to_string()))
            .len(),
        0
    );

    app.shutdown();
}

async fn socks5_connect(client: &mut TcpStream, addr: SocketAddr) -> u8 {
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let std::net::IpAddr::V4(ip) = addr.ip() else {
        panic!("test uses IPv4 destinations");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[3], 0x01);
    reply[1]
}

#[tokio::test(flavor = "multi_thread")]
async fn socks5_relays_to_backend_members() {
    let app = App::new().unwrap();
    let backend = spawn_echo().await;
    build_lb(&app, backend).await;
    app.execute("add socks5-server s5 address 127.0.0.1:0 backend sgs0")
        .unwrap();

    let mut client = TcpStream::connect(bound_addr(&app, "s5")).await.unwrap();
    let rep = socks5_connect(&mut client, backend).await;
    assert_eq!(rep, 0x00);

    client.write_all(b"hello over socks").await.unwrap();
    let mut echoed = [0u8; 16];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello over socks");

    app.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn socks5_refuses_non_backend_destinations() {
    let app = App::new().unwrap();
    let backend = spawn_echo().await;
    build_lb(&app, backend).await;
    app.execute("add socks5-server s5 address 127.0.0.1:0 backend sgs0")
        .unwrap();

    let mut client = TcpStream::connect(bound_addr(&app, "s5")).await.unwrap();
    let rep = socks5_connect(&mut client, "203.0.113.5:9".parse().unwrap()).await;
    // connection not allowed by ruleset
    assert_eq!(rep, 0x02);

    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
    assert!(rest.is_empty());

    app.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn socks5_allow_non_backend_connects_directly() {
    let app = App::new().unwrap();
    let backend = spawn_echo().await;
    let other = spawn_echo().await;
    build_lb(&app, backend).await;
    app.execute("add socks5-server s5 address 127.0.0.1:0 backend sgs0 allow-non-backend")
        .unwrap();

    let mut client = TcpStream::connect(bound_addr(&app, "s5")).await.unwrap();
    let rep = socks5_connect(&mut client, other).await;
    assert_eq!(rep, 0x00);

    client.write_all(b"direct").await.unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"direct");

    app.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unhealthy_servers_receive_no_traffic() {
    let app = App::new().unwrap();
    let live = spawn_echo().await;
    app.execute("add server-group sg0 timeout 500 period 100 up 2 down 3 method wrr")
        .unwrap();
    app.execute(&format!(
        "add server live to server-group sg0 address {} weight 10",
        live
    ))
    .unwrap();
    // nothing listens here, so its probes keep failing
    app.execute("add server dead to server-group sg0 address 127.0.0.1:1 weight 10")
        .unwrap();
    app.execute("add server-groups sgs0").unwrap();
    app.execute("add server-group sg0 to server-groups sgs0 weight 10")
        .unwrap();
    wait_until_up(&app, "sg0", "live").await;
    app.execute("add tcp-lb lb0 address 127.0.0.1:0 backend sgs0")
        .unwrap();

    let lb = bound_addr(&app, "lb0");
    for _ in 0..10 {
        let mut client = TcpStream::connect(lb).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();
        assert_eq!(one[0], b'x');
    }

    let group = app.get_server_group("sg0").unwrap();
    assert!(!group.get_server("dead").unwrap().is_up());
    assert_eq!(group.get_server("dead").unwrap().bytes_to_remote(), 0);
    assert_eq!(group.get_server("live").unwrap().bytes_to_remote(), 10);

    app.shutdown();
}
