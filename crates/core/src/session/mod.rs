//! Per-stream state shared by the RTSP sessions watching it.
//!
//! A [`StreamState`] is created by the RTSP layer on the first SETUP for a
//! media track. It owns the sink (RTP or raw UDP), the RTP and RTCP server
//! sockets, the RTCP engine and the set of client destinations.
//!
//! ## Lifecycle
//!
//! ```text
//! SETUP         -> StreamState::new            (idle, no destinations)
//! PLAY          -> start_playing(id, dests)    (adds dests, initial SR, sink thread)
//! PAUSE         -> pause()                     (sink thread stopped, state kept)
//! PLAY          -> start_playing(id, dests)    (resumes)
//! TEARDOWN      -> end_playing(id)             (last one out stops RTP and sends BYE)
//! ```
//!
//! Destinations are keyed by the RTSP session id so several clients can
//! share one stream.

pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

use crate::error::{Result, RtpError};
use crate::rtcp::{RtcpConfig, RtcpEngine, RtcpTask};
use crate::sink::{MediaSink, RtpSink, RtpSinkState, SendOutcome, UdpSink, spawn_sink};
use crate::task::Task;
use crate::transport::{FanOut, PacketWriter, UdpTransport};
pub use transport::Destinations;

/// The sink a stream plays through.
pub enum StreamSink {
    Rtp(RtpSink),
    Udp(UdpSink),
}

impl MediaSink for StreamSink {
    fn restart_pacing(&mut self, now: Instant) {
        match self {
            StreamSink::Rtp(sink) => sink.restart_pacing(now),
            StreamSink::Udp(sink) => sink.restart_pacing(now),
        }
    }

    fn send_next(&mut self, writer: &dyn PacketWriter, now: Instant) -> Result<SendOutcome> {
        match self {
            StreamSink::Rtp(sink) => sink.send_next(writer, now),
            StreamSink::Udp(sink) => sink.send_next(writer, now),
        }
    }
}

/// Transport state of one media track.
pub struct StreamState {
    name: String,
    rtp_socket: Arc<UdpTransport>,
    rtcp_socket: Arc<UdpTransport>,
    rtp_out: Arc<FanOut>,
    rtcp_out: Arc<FanOut>,
    sink_state: Option<Arc<RtpSinkState>>,
    idle_sink: Option<StreamSink>,
    sink_task: Option<Task<StreamSink>>,
    rtcp_config: RtcpConfig,
    rtcp: Option<RtcpTask>,
    destinations: HashMap<u64, Destinations>,
}

impl StreamState {
    pub fn new(
        name: &str,
        sink: StreamSink,
        rtp_socket: Arc<UdpTransport>,
        rtcp_socket: Arc<UdpTransport>,
        rtcp_config: RtcpConfig,
    ) -> Self {
        let sink_state = match &sink {
            StreamSink::Rtp(rtp) => Some(rtp.state()),
            StreamSink::Udp(_) => None,
        };
        Self {
            name: name.to_string(),
            rtp_out: Arc::new(FanOut::new(rtp_socket.clone())),
            rtcp_out: Arc::new(FanOut::new(rtcp_socket.clone())),
            rtp_socket,
            rtcp_socket,
            sink_state,
            idle_sink: Some(sink),
            sink_task: None,
            rtcp_config,
            rtcp: None,
            destinations: HashMap::new(),
        }
    }

    /// Local (RTP, RTCP) addresses, for the `server_port` transport parameter.
    pub fn server_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((self.rtp_socket.local_addr()?, self.rtcp_socket.local_addr()?))
    }

    /// Sender counters, `None` for a raw UDP stream.
    pub fn sink_state(&self) -> Option<Arc<RtpSinkState>> {
        self.sink_state.clone()
    }

    /// The RTCP engine, once the stream has started playing.
    pub fn rtcp_engine(&self) -> Option<Arc<Mutex<RtcpEngine>>> {
        self.rtcp.as_ref().map(RtcpTask::engine)
    }

    pub fn is_playing(&self) -> bool {
        self.sink_task.as_ref().is_some_and(Task::is_running)
    }

    pub fn num_destinations(&self) -> usize {
        self.destinations.len()
    }

    /// Sequence number of the next RTP packet (for `RTP-Info: seq=`).
    pub fn current_seq_no(&self) -> Option<u16> {
        self.sink_state.as_ref().map(|s| s.current_seq_no())
    }

    /// RTP timestamp the next frame will carry (for `RTP-Info: rtptime=`).
    pub fn preset_next_timestamp(&self) -> Option<u32> {
        self.sink_state
            .as_ref()
            .map(|s| s.preset_next_timestamp(SystemTime::now()))
    }

    /// Add `destinations` for client `client_id` and start the sink if it
    /// is not already running.
    ///
    /// An RTP stream gets its RTCP engine on first play and sends one report
    /// right away so receivers can synchronize before the first RTP packet.
    pub fn start_playing(&mut self, client_id: u64, destinations: Destinations) -> Result<()> {
        tracing::info!(stream = %self.name, client_id, ?destinations, "start playing");
        self.rtp_out.add(client_id, destinations.rtp_target());
        if let Some(target) = destinations.rtcp_target() {
            self.rtcp_out.add(client_id, target);
        }
        self.destinations.insert(client_id, destinations);

        if let Some(state) = &self.sink_state {
            if self.rtcp.is_none() {
                let engine = RtcpEngine::new(&self.rtcp_config, Some(state.clone()), None, Instant::now());
                self.rtcp = Some(RtcpTask::spawn(
                    &format!("{}-rtcp", self.name),
                    Arc::new(Mutex::new(engine)),
                    self.rtcp_socket.clone(),
                    self.rtcp_out.clone(),
                )?);
            }
            if let Some(rtcp) = &self.rtcp {
                let sent = rtcp
                    .engine()
                    .lock()
                    .send_report(self.rtcp_out.as_ref(), SystemTime::now());
                if let Err(e) = sent {
                    tracing::warn!(stream = %self.name, error = %e, "initial RTCP report not sent");
                }
            }
        }

        if self.is_playing() {
            return Ok(());
        }
        // Reclaim the sink from a thread whose source ran out.
        if let Some(task) = self.sink_task.take() {
            self.idle_sink = task.stop();
        }
        let sink = self.idle_sink.take().ok_or(RtpError::NoMediaSource)?;
        let writer: Arc<dyn PacketWriter> = self.rtp_out.clone();
        self.sink_task = Some(spawn_sink(&format!("{}-rtp", self.name), sink, writer)?);
        Ok(())
    }

    /// Stop sending RTP, keeping destinations and RTCP alive.
    pub fn pause(&mut self) -> Result<()> {
        let task = self.sink_task.take().ok_or(RtpError::NotPlaying)?;
        self.idle_sink = task.stop();
        tracing::info!(stream = %self.name, "paused");
        if self.idle_sink.is_none() {
            return Err(RtpError::NoMediaSource);
        }
        Ok(())
    }

    /// Remove client `client_id`. When the last client leaves, the sink is
    /// stopped and RTCP says BYE. Returns whether the client was known.
    pub fn end_playing(&mut self, client_id: u64) -> bool {
        let Some(destinations) = self.destinations.remove(&client_id) else {
            return false;
        };
        tracing::info!(stream = %self.name, client_id, ?destinations, "end playing");

        if self.destinations.is_empty() {
            if self.sink_task.is_some() {
                if let Err(e) = self.pause() {
                    tracing::debug!(stream = %self.name, error = %e, "sink not resumable");
                }
            }
            // BYE goes out before the last destination is dropped.
            if let Some(rtcp) = self.rtcp.take() {
                rtcp.stop();
            }
        }
        self.rtp_out.remove(client_id);
        self.rtcp_out.remove(client_id);
        true
    }

    /// Feed a packet read from an RTSP connection's interleaved channel.
    ///
    /// Returns `false` if `channel` is not an RTCP channel of any TCP
    /// destination of this stream.
    pub fn handle_interleaved_packet(&self, channel: u8, packet: &[u8]) -> bool {
        let is_rtcp = self.destinations.values().any(
            |d| matches!(d, Destinations::Tcp { rtcp_channel, .. } if *rtcp_channel == channel),
        );
        if !is_rtcp {
            tracing::trace!(stream = %self.name, channel, "interleaved packet not for this stream");
            return false;
        }
        if let Some(rtcp) = &self.rtcp {
            RtcpEngine::process_shared(&rtcp.engine(), packet, Instant::now(), SystemTime::now());
        }
        true
    }

    /// Stop every thread of the stream and wait for them.
    pub fn close(mut self) {
        if let Some(task) = self.sink_task.take() {
            task.stop();
        }
        if let Some(rtcp) = self.rtcp.take() {
            rtcp.stop();
        }
        tracing::debug!(stream = %self.name, "stream closed");
    }
}
