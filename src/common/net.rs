//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

#[inline]
pub fn configure_std_listener(listener: &std::net::TcpListener) {
    let sock = SockRef::from(listener);
    let _ = sock.set_reuse_address(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// Requested destination address, IP or domain form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Get as IP if the address is not a domain.
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    /// Get as a socket address when the host part is an IP.
    pub fn to_socket_addr(&self, port: u16) -> Option<SocketAddr> {
        self.to_ip().map(|ip| SocketAddr::new(ip, port))
    }

    /// String representation including the port.
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

/// Parse `host:port` where host is an IP, as used by server addresses.
pub fn parse_socket_addr(s: &str) -> Result<SocketAddr> {
    s.parse::<SocketAddr>()
        .map_err(|_| Error::invalid_argument(format!("bad address {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_ip() {
        let addr = Address::from(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(matches!(addr, Address::Ipv4(_)));
        assert_eq!(addr.to_string_with_port(80), "127.0.0.1:80");
    }

    #[test]
    fn test_domain_has_no_socket_addr() {
        let addr = Address::Domain("example.com".to_string());
        assert!(addr.to_socket_addr(443).is_none());
    }

    #[test]
    fn test_parse_socket_addr() {
        assert!(parse_socket_addr("127.0.0.1:8080").is_ok());
        assert!(parse_socket_addr("[::1]:8080").is_ok());
        assert!(parse_socket_addr("example.com:8080").is_err());
    }
}
