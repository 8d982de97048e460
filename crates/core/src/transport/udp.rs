use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use super::PacketReader;
use crate::error::Result;

/// A UDP socket carrying one RTP or RTCP flow.
///
/// This layer is address-only: it knows nothing about streams or sessions.
/// Callers resolve destinations before calling [`send_to`](Self::send_to).
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `addr`; port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        tracing::debug!(local = %socket.local_addr()?, "UDP socket bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }

    /// Wait up to `timeout` for one datagram.
    pub fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl PacketReader for Arc<UdpTransport> {
    fn recv_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        Ok(self.recv_from(buf, timeout)?.map(|(n, _)| n))
    }
}
