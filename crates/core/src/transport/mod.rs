//! Packet channels between the engine and the network.
//!
//! The engine only sees two small traits: [`PacketWriter`] (send one packet)
//! and [`PacketReader`] (receive one packet, with a timeout so loops can
//! notice a stop request). Implementations:
//!
//! - **UDP** ([`udp`]): one socket per RTP or RTCP flow.
//! - **Interleaved TCP** ([`tcp`]): RTP/RTCP multiplexed onto the RTSP
//!   connection with `$` framing (RFC 2326 §10.12).
//! - [`PacketQueue`]: in-memory channel. Used to hand interleaved packets
//!   read by the RTSP layer to a receiver, and to capture output in tests.
//! - [`FanOut`]: one writer feeding every destination of a shared stream.

pub mod tcp;
pub mod udp;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

pub use tcp::InterleavedWriter;
pub use udp::UdpTransport;

/// Sends whole packets.
pub trait PacketWriter: Send + Sync {
    fn send_packet(&self, packet: &[u8]) -> Result<()>;
}

/// Receives whole packets.
pub trait PacketReader: Send {
    /// Wait up to `timeout` for a packet, writing it into `buf`.
    ///
    /// Returns `Ok(None)` on timeout and the packet length otherwise.
    /// Packets longer than `buf` are truncated.
    fn recv_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;
}

/// In-memory packet channel.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

impl PacketQueue {
    pub fn push(&self, packet: Vec<u8>) {
        self.packets.lock().push_back(packet);
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    /// Remove and return every queued packet.
    pub fn take(&self) -> Vec<Vec<u8>> {
        self.packets.lock().drain(..).collect()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut packets = self.packets.lock();
        if packets.is_empty() {
            self.ready.wait_for(&mut packets, timeout);
        }
        packets.pop_front()
    }
}

impl PacketWriter for PacketQueue {
    fn send_packet(&self, packet: &[u8]) -> Result<()> {
        self.push(packet.to_vec());
        Ok(())
    }
}

impl PacketReader for Arc<PacketQueue> {
    fn recv_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        Ok(self.pop_timeout(timeout).map(|packet| {
            let n = packet.len().min(buf.len());
            buf[..n].copy_from_slice(&packet[..n]);
            n
        }))
    }
}

/// Where one flow of a stream goes.
#[derive(Clone)]
pub enum Target {
    Udp(SocketAddr),
    Interleaved(InterleavedWriter),
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Udp(addr) => write!(f, "udp:{addr}"),
            Target::Interleaved(w) => write!(f, "interleaved:{}", w.channel()),
        }
    }
}

/// Sends every packet to each registered target.
///
/// Targets are keyed by a caller-chosen id (the RTSP session) so they can be
/// added and removed while a sink thread is writing.
pub struct FanOut {
    socket: Arc<UdpTransport>,
    targets: Mutex<Vec<(u64, Target)>>,
}

impl FanOut {
    pub fn new(socket: Arc<UdpTransport>) -> Self {
        Self {
            socket,
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, id: u64, target: Target) {
        tracing::debug!(id, ?target, "destination added");
        self.targets.lock().push((id, target));
    }

    /// Returns whether a target with this id was present.
    pub fn remove(&self, id: u64) -> bool {
        let mut targets = self.targets.lock();
        let before = targets.len();
        targets.retain(|(tid, _)| *tid != id);
        before != targets.len()
    }

    pub fn len(&self) -> usize {
        self.targets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.lock().is_empty()
    }
}

impl PacketWriter for FanOut {
    fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let targets = self.targets.lock().clone();
        let mut last_err = None;
        for (id, target) in &targets {
            let sent = match target {
                Target::Udp(addr) => self.socket.send_to(packet, *addr).map(|_| ()),
                Target::Interleaved(writer) => writer.send_packet(packet),
            };
            if let Err(e) = sent {
                tracing::debug!(id, ?target, error = %e, "send to destination failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) if targets.len() == 1 => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn queue_times_out_when_empty() {
        let mut q = Arc::new(PacketQueue::default());
        let mut buf = [0u8; 8];
        assert!(q
            .recv_packet(&mut buf, Duration::from_millis(5))
            .unwrap()
            .is_none());
    }

    #[test]
    fn queue_wakes_reader() {
        let q = Arc::new(PacketQueue::default());
        let writer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.send_packet(b"hello").unwrap();
        });
        let mut reader = q.clone();
        let mut buf = [0u8; 8];
        let n = reader
            .recv_packet(&mut buf, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        handle.join().unwrap();
    }

    #[test]
    fn fan_out_reaches_every_udp_target() {
        let socket = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap());
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let fan = FanOut::new(socket);
        fan.add(1, Target::Udp(a.local_addr().unwrap()));
        fan.add(2, Target::Udp(b.local_addr().unwrap()));
        fan.send_packet(b"rtp").unwrap();

        let mut buf = [0u8; 16];
        for t in [&a, &b] {
            let (n, _) = t
                .recv_from(&mut buf, Duration::from_secs(2))
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], b"rtp");
        }

        assert!(fan.remove(1));
        assert!(!fan.remove(1));
        assert_eq!(fan.len(), 1);
    }
}
