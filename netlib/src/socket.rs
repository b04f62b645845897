use std::io;
use std::net::UdpSocket;

use crate::address::Address;
use crate::error::{NetError, Result};

/// Non-blocking UDP endpoint, one per `Peer`.
///
/// `WouldBlock` is treated the same way the teacher's `net::buffer::Buffer`
/// treats it in `egress`/`ingress`: "done for now", not an error.
pub struct Socket {
    inner: UdpSocket,
}

impl Socket {
    pub fn bind(address: Address) -> Result<Self> {
        let inner = UdpSocket::bind(address.to_socket_addr()).map_err(NetError::BindFailed)?;
        inner.set_nonblocking(true).map_err(NetError::BindFailed)?;
        Ok(Socket { inner })
    }

    pub fn local_addr(&self) -> Result<Address> {
        let addr = self.inner.local_addr()?;
        Address::from_socket_addr(addr).ok_or(NetError::BindFailed(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "non-IPv4 local address",
        )))
    }

    /// Best-effort send: transient errors (e.g. a full OS send buffer) are
    /// dropped silently, matching spec.md §4.1; anything else is reported.
    pub fn send(&self, buf: &[u8], address: Address) -> Result<()> {
        match self.inner.send_to(buf, address.to_socket_addr()) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(NetError::SendFailed(e)),
        }
    }

    /// Returns `Ok(None)` when nothing is available right now.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, Address)>> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => match Address::from_socket_addr(addr) {
                Some(address) => Ok(Some((n, address))),
                None => Ok(None),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetError::RecvFailed(e)),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
