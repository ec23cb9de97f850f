//! Network address model shared by the server and the client
//!
//! A `NetAddr` pairs a socket address with the transport it arrived on. Bots
//! and in-process loopback clients have no real socket behind them, so the
//! kind decides whether the server may transmit to the address at all.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Transport a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrKind {
    /// A real UDP peer
    Remote,
    /// A server-side bot, never transmitted to
    Bot,
    /// An in-process client sharing the server's host
    Loopback,
}

/// Source or destination of a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddr {
    pub kind: AddrKind,
    pub addr: SocketAddr,
}

impl NetAddr {
    pub fn remote(addr: SocketAddr) -> Self {
        Self {
            kind: AddrKind::Remote,
            addr,
        }
    }

    pub fn bot() -> Self {
        Self {
            kind: AddrKind::Bot,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self {
            kind: AddrKind::Loopback,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Compares kind and host, ignoring the port
    pub fn compare_base(&self, other: &NetAddr) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            AddrKind::Remote => self.addr.ip() == other.addr.ip(),
            AddrKind::Bot | AddrKind::Loopback => true,
        }
    }

    /// True for in-process loopback and bot connections
    ///
    /// These never went through a network, so challenge checks do not apply.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, AddrKind::Loopback | AddrKind::Bot)
    }

    /// True for local connections and hosts on a private network
    pub fn is_lan(&self) -> bool {
        if self.is_local() {
            return true;
        }
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                ip.is_loopback() || ip.is_private() || ip.is_link_local()
            }
            IpAddr::V6(ip) => {
                ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00
            }
        }
    }

    /// Network prefix used to group reflection-attack victims
    ///
    /// IPv4 addresses are masked to /24 and IPv6 addresses to /64.
    pub fn subnet(&self) -> IpAddr {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                let [a, b, c, _] = ip.octets();
                IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
            }
            IpAddr::V6(ip) => {
                let s = ip.segments();
                IpAddr::V6(Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0))
            }
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddrKind::Remote => write!(f, "{}", self.addr),
            AddrKind::Bot => write!(f, "bot"),
            AddrKind::Loopback => write!(f, "loopback"),
        }
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        NetAddr::remote(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddr {
        NetAddr::remote(s.parse().unwrap())
    }

    #[test]
    fn test_base_compare_ignores_port() {
        assert!(addr("1.2.3.4:1000").compare_base(&addr("1.2.3.4:2000")));
        assert!(!addr("1.2.3.4:1000").compare_base(&addr("1.2.3.5:1000")));
        assert_ne!(addr("1.2.3.4:1000"), addr("1.2.3.4:2000"));
    }

    #[test]
    fn test_lan_classification() {
        assert!(addr("192.168.0.10:27960").is_lan());
        assert!(addr("10.1.2.3:27960").is_lan());
        assert!(addr("127.0.0.1:27960").is_lan());
        assert!(!addr("8.8.8.8:27960").is_lan());
        assert!(NetAddr::bot().is_lan());
    }

    #[test]
    fn test_local_only_for_in_process_kinds() {
        assert!(!addr("127.0.0.1:27960").is_local());
        assert!(NetAddr::loopback(27960).is_local());
        assert!(NetAddr::bot().is_local());
    }

    #[test]
    fn test_subnet_masks_last_octet() {
        assert_eq!(
            addr("81.2.3.77:1").subnet(),
            "81.2.3.0".parse::<IpAddr>().unwrap()
        );
        assert_eq!(addr("81.2.3.77:1").subnet(), addr("81.2.3.1:9").subnet());
    }
}
