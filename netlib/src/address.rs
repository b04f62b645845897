use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// IPv4 endpoint, value type, equality by (ip, port).
///
/// Corresponds to `NetLib::Address` in the original source, which wraps a
/// `sockaddr_in` and exposes `GetIP`/`GetPort`/`operator==`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    ip: Ipv4Addr,
    port: u16,
}

impl Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Address { ip, port }
    }

    pub fn invalid() -> Self {
        Address::new(Ipv4Addr::UNSPECIFIED, 0)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Only IPv4 addresses are supported, matching spec.md §1's explicit
    /// non-goal of transports other than connected-less IPv4 datagrams.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Address::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => None,
        }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
