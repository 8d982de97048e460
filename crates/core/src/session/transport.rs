use std::fmt;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{InterleavedWriter, Target};

/// Where a client wants a stream delivered, as negotiated in SETUP
/// (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001    -> Destinations::Udp
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1      -> Destinations::Tcp
/// ```
#[derive(Clone)]
pub enum Destinations {
    /// RTP and RTCP datagrams to `addr` on separate ports.
    Udp {
        addr: IpAddr,
        rtp_port: u16,
        rtcp_port: u16,
    },
    /// RTP and RTCP interleaved on the RTSP connection.
    Tcp {
        stream: Arc<Mutex<TcpStream>>,
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl Destinations {
    pub fn udp(addr: IpAddr, rtp_port: u16, rtcp_port: u16) -> Self {
        Destinations::Udp {
            addr,
            rtp_port,
            rtcp_port,
        }
    }

    pub fn tcp(stream: Arc<Mutex<TcpStream>>, rtp_channel: u8, rtcp_channel: u8) -> Self {
        Destinations::Tcp {
            stream,
            rtp_channel,
            rtcp_channel,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Destinations::Tcp { .. })
    }

    /// Target for RTP packets.
    pub fn rtp_target(&self) -> Target {
        match self {
            Destinations::Udp { addr, rtp_port, .. } => Target::Udp(SocketAddr::new(*addr, *rtp_port)),
            Destinations::Tcp {
                stream, rtp_channel, ..
            } => Target::Interleaved(InterleavedWriter::new(stream.clone(), *rtp_channel)),
        }
    }

    /// Target for RTCP packets, or `None` when RTCP shares the RTP port
    /// (the RTP target already reaches it).
    pub fn rtcp_target(&self) -> Option<Target> {
        match self {
            Destinations::Udp {
                rtp_port, rtcp_port, ..
            } if rtp_port == rtcp_port => None,
            Destinations::Udp {
                addr, rtcp_port, ..
            } => Some(Target::Udp(SocketAddr::new(*addr, *rtcp_port))),
            Destinations::Tcp {
                stream,
                rtcp_channel,
                ..
            } => Some(Target::Interleaved(InterleavedWriter::new(
                stream.clone(),
                *rtcp_channel,
            ))),
        }
    }
}

impl fmt::Debug for Destinations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destinations::Udp {
                addr,
                rtp_port,
                rtcp_port,
            } => write!(f, "udp {addr} rtp={rtp_port} rtcp={rtcp_port}"),
            Destinations::Tcp {
                rtp_channel,
                rtcp_channel,
                ..
            } => write!(f, "tcp interleaved={rtp_channel}-{rtcp_channel}"),
        }
    }
}
