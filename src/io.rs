//! Datagram transport supplied by the host.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// The transport the run loop reads from and writes to.
///
/// `recv` blocks for at most `timeout` and returns `None` when nothing
/// arrived; the run loop treats that as an idle iteration. Implementations
/// only ever deal in IPv4 endpoints.
pub trait DhtIo {
    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddrV4)>>;

    fn send(&mut self, buf: &[u8], to: SocketAddrV4) -> io::Result<usize>;
}

/// Standard-library UDP socket transport.
pub struct UdpIo {
    socket: UdpSocket,
}

impl UdpIo {
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        Ok(UdpIo { socket })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}

impl DhtIo for UdpIo {
    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddrV4)>> {
        self.socket.set_read_timeout(Some(timeout))?;
        match self.socket.recv_from(buf) {
            Ok((len, SocketAddr::V4(addr))) => Ok(Some((len, addr))),
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, buf: &[u8], to: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(buf, to)
    }
}
