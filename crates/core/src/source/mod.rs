//! Receive pipeline: datagrams in, ordered frames out.
//!
//! ```text
//! read ─► RTP header check ─► SSRC demux ─► stats ─► reorder ─► depacketize ─► frame
//! ```
//!
//! [`RtpSource`] is the synchronous core: feed it datagrams with
//! [`ingest`](RtpSource::ingest) (or let it read them with
//! [`receive_from`](RtpSource::receive_from)) and pull completed frames with
//! [`next_frame`](RtpSource::next_frame). [`RtpReceiver`] runs that loop on
//! its own thread and hands each frame to a callback.
//!
//! Malformed packets and packets with an unexpected payload type are
//! dropped and counted; they never end the stream.

pub mod packet;
pub mod reorder;
pub mod stats;

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

pub use packet::BufferedPacket;
pub use reorder::{ReorderStats, ReorderingPacketBuffer};
pub use stats::{ReceptionStats, ReceptionStatsTable};

use crate::error::{Result, RtpError};
use crate::media::Depacketizer;
use crate::media::rtp::RtpHeader;
use crate::task::Task;
use crate::transport::PacketReader;

/// Receive-side tuning.
///
/// Payload type and clock rate come from the [`Depacketizer`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// How long a packet waits for a missing predecessor before the gap is
    /// given up on. Zero delivers immediately.
    pub reorder_threshold: Duration,
    /// Frames larger than this are truncated.
    pub max_frame_size: usize,
    /// Spare packet buffers kept for reuse.
    pub packet_pool_size: usize,
    /// Read timeout of the receive loop; bounds how late a threshold
    /// expiry is noticed when no packets arrive.
    pub poll_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            reorder_threshold: reorder::DEFAULT_THRESHOLD,
            max_frame_size: 100_000,
            packet_pool_size: 32,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// A reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub data: Vec<u8>,
    pub num_truncated_bytes: usize,
    pub ssrc: u32,
    /// Sequence number of the packet that completed the frame.
    pub seq_no: u16,
    pub rtp_timestamp: u32,
    pub presentation_time: SystemTime,
    /// The presentation time is anchored to a sender report.
    pub synced_using_rtcp: bool,
    pub marker: bool,
}

/// Counters for diagnosing a receive stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverDiagnostics {
    pub packets_received: u64,
    pub malformed: u64,
    pub wrong_payload_type: u64,
    pub rejected_by_payload_format: u64,
    pub frames_delivered: u64,
    /// Partially assembled frames dropped because a fragment was lost.
    pub frames_discarded: u64,
    pub reorder: ReorderStats,
}

/// Frame reassembly over a reordering buffer.
pub struct RtpSource {
    depacketizer: Box<dyn Depacketizer>,
    reorder: ReorderingPacketBuffer,
    stats: Arc<Mutex<ReceptionStatsTable>>,
    last_received_ssrc: Option<u32>,

    frame: Vec<u8>,
    frame_size: usize,
    num_truncated_bytes: usize,
    current_packet_begins_frame: bool,
    current_packet_completes_frame: bool,
    packet_loss_in_fragmented_frame: bool,

    diagnostics: ReceiverDiagnostics,
}

impl RtpSource {
    pub fn new(depacketizer: Box<dyn Depacketizer>, config: &SourceConfig) -> Self {
        Self {
            depacketizer,
            reorder: ReorderingPacketBuffer::new(config.reorder_threshold, config.packet_pool_size),
            stats: Arc::new(Mutex::new(ReceptionStatsTable::new())),
            last_received_ssrc: None,
            frame: vec![0; config.max_frame_size],
            frame_size: 0,
            num_truncated_bytes: 0,
            current_packet_begins_frame: true,
            current_packet_completes_frame: true,
            packet_loss_in_fragmented_frame: false,
            diagnostics: ReceiverDiagnostics::default(),
        }
    }

    /// Reception statistics, shared with the RTCP engine.
    pub fn stats_table(&self) -> Arc<Mutex<ReceptionStatsTable>> {
        self.stats.clone()
    }

    pub fn payload_type(&self) -> u8 {
        self.depacketizer.payload_type()
    }

    pub fn last_received_ssrc(&self) -> Option<u32> {
        self.last_received_ssrc
    }

    pub fn diagnostics(&self) -> ReceiverDiagnostics {
        ReceiverDiagnostics {
            reorder: self.reorder.stats(),
            ..self.diagnostics
        }
    }

    /// Process one datagram that arrived at `arrival` (wall clock) and
    /// `received_at` (monotonic clock, used for the reorder threshold).
    pub fn ingest(&mut self, datagram: &[u8], arrival: SystemTime, received_at: Instant) {
        let mut packet = self.reorder.get_free_packet();
        if !packet.fill_from_slice(datagram) {
            tracing::warn!(len = datagram.len(), "datagram larger than packet buffer, dropped");
            self.reorder.free_packet(packet);
            return;
        }
        self.process_packet(packet, arrival, received_at);
    }

    /// Read at most one packet from `reader`. Returns whether one arrived.
    pub fn receive_from<R: PacketReader + ?Sized>(
        &mut self,
        reader: &mut R,
        timeout: Duration,
    ) -> Result<bool> {
        let mut packet = self.reorder.get_free_packet();
        match packet.fill_in_data(reader, timeout) {
            Ok(Some(_)) => {
                self.process_packet(packet, SystemTime::now(), Instant::now());
                Ok(true)
            }
            Ok(None) => {
                self.reorder.free_packet(packet);
                Ok(false)
            }
            Err(e) => {
                self.reorder.free_packet(packet);
                Err(e)
            }
        }
    }

    fn process_packet(
        &mut self,
        mut packet: BufferedPacket,
        arrival: SystemTime,
        received_at: Instant,
    ) {
        self.diagnostics.packets_received += 1;
        let header = match self.strip_headers(&mut packet) {
            Ok(header) => header,
            Err(e) => {
                match e {
                    RtpError::UnexpectedPayloadType { .. } => self.diagnostics.wrong_payload_type += 1,
                    _ => self.diagnostics.malformed += 1,
                }
                tracing::debug!(error = %e, "RTP packet dropped");
                self.reorder.free_packet(packet);
                return;
            }
        };

        if self.last_received_ssrc != Some(header.ssrc) {
            if let Some(previous) = self.last_received_ssrc {
                tracing::debug!(
                    old = format_args!("{:#010X}", previous),
                    new = format_args!("{:#010X}", header.ssrc),
                    "SSRC changed, restarting sequence tracking"
                );
            }
            self.last_received_ssrc = Some(header.ssrc);
            self.reorder.reset_have_seen_first_packet();
        }

        let usable_for_jitter = self
            .depacketizer
            .packet_is_usable_in_jitter_calculation(packet.data());
        let (presentation_time, synced) = self.stats.lock().note_incoming_packet(
            header.ssrc,
            header.sequence_number,
            header.timestamp,
            self.depacketizer.clock_rate(),
            usable_for_jitter,
            arrival,
            packet.data_size(),
        );
        packet.assign_misc_params(
            header.sequence_number,
            header.timestamp,
            presentation_time,
            synced,
            header.marker,
            received_at,
        );
        tracing::trace!(
            ssrc = format_args!("{:#010X}", header.ssrc),
            seq = header.sequence_number,
            ts = header.timestamp,
            len = packet.data_size(),
            "RTP packet received"
        );
        self.reorder.store_packet(packet);
    }

    /// Validate the RTP header and leave only the payload in `packet`.
    fn strip_headers(&self, packet: &mut BufferedPacket) -> Result<RtpHeader> {
        let (header, payload) = RtpHeader::parse(packet.data())?;
        let expected = self.depacketizer.payload_type();
        if header.payload_type != expected {
            return Err(RtpError::UnexpectedPayloadType {
                expected,
                got: header.payload_type,
            });
        }
        let padding = packet.data_size() - payload.end;
        packet.skip(payload.start);
        packet.remove_padding(padding);
        Ok(header)
    }

    /// The next completed frame, if one can be assembled from the packets
    /// released by the reorder buffer at `now`.
    ///
    /// A partially assembled frame is kept across calls. If a packet is
    /// lost in the middle of a fragmented frame, the partial frame is
    /// discarded and assembly restarts at the next frame start.
    pub fn next_frame(&mut self, now: Instant) -> Option<ReceivedFrame> {
        loop {
            let (packet, packet_loss_preceded) = self.reorder.get_next_completed_packet(now)?;

            if packet.use_count() == 0 {
                let marker = packet.marker();
                match self
                    .depacketizer
                    .process_special_header(packet.data_mut(), marker)
                {
                    Some(special) => {
                        packet.skip(special.size);
                        self.current_packet_begins_frame = special.begins_frame;
                        self.current_packet_completes_frame = special.completes_frame;
                    }
                    None => {
                        tracing::debug!(seq = packet.seq_no(), "payload header rejected");
                        self.diagnostics.rejected_by_payload_format += 1;
                        self.reorder.release_used_packet();
                        continue;
                    }
                }
            }

            if self.current_packet_begins_frame {
                if (packet_loss_preceded || self.packet_loss_in_fragmented_frame)
                    && self.frame_size > 0
                {
                    tracing::debug!(
                        seq = packet.seq_no(),
                        discarded = self.frame_size,
                        "incomplete frame discarded after packet loss"
                    );
                    self.diagnostics.frames_discarded += 1;
                    self.frame_size = 0;
                    self.num_truncated_bytes = 0;
                }
                self.packet_loss_in_fragmented_frame = false;
            } else if packet_loss_preceded {
                self.packet_loss_in_fragmented_frame = true;
            }

            if self.packet_loss_in_fragmented_frame {
                if self.frame_size > 0 {
                    self.diagnostics.frames_discarded += 1;
                    self.frame_size = 0;
                    self.num_truncated_bytes = 0;
                }
                self.reorder.release_used_packet();
                continue;
            }

            let chunk = packet.use_frame(&mut self.frame[self.frame_size..], self.depacketizer.as_ref());
            let done_with_packet = !packet.has_usable_data();
            self.frame_size += chunk.bytes_used;
            self.num_truncated_bytes += chunk.bytes_truncated;
            if done_with_packet {
                self.reorder.release_used_packet();
            }

            if self.current_packet_completes_frame && self.frame_size > 0 {
                if self.num_truncated_bytes > 0 {
                    tracing::warn!(
                        frame_size = self.frame_size,
                        truncated = self.num_truncated_bytes,
                        "received frame larger than max_frame_size, truncated"
                    );
                }
                let frame = ReceivedFrame {
                    data: self.frame[..self.frame_size].to_vec(),
                    num_truncated_bytes: self.num_truncated_bytes,
                    ssrc: self.last_received_ssrc.unwrap_or_default(),
                    seq_no: chunk.seq_no,
                    rtp_timestamp: chunk.rtp_timestamp,
                    presentation_time: chunk.presentation_time,
                    synced_using_rtcp: chunk.has_been_synced_using_rtcp,
                    marker: chunk.marker,
                };
                self.frame_size = 0;
                self.num_truncated_bytes = 0;
                self.diagnostics.frames_delivered += 1;
                return Some(frame);
            }
        }
    }
}

/// Runs an [`RtpSource`] on its own thread, delivering frames to a callback.
///
/// The callback runs on the receive thread and must not block. No callback
/// runs after [`stop`](Self::stop) returns.
pub struct RtpReceiver {
    task: Task<RtpSource>,
}

impl RtpReceiver {
    pub fn spawn<R, F>(
        name: &str,
        mut source: RtpSource,
        mut reader: R,
        poll_interval: Duration,
        mut on_frame: F,
    ) -> io::Result<Self>
    where
        R: PacketReader + 'static,
        F: FnMut(ReceivedFrame) + Send + 'static,
    {
        let task = Task::spawn(name, move |running| {
            while running.load(Ordering::SeqCst) {
                if let Err(e) = source.receive_from(&mut reader, poll_interval) {
                    tracing::warn!(error = %e, "RTP read failed, receiver stopping");
                    break;
                }
                // Also runs on poll timeout so a gap never stalls delivery
                // past the reorder threshold.
                while let Some(frame) = source.next_frame(Instant::now()) {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    on_frame(frame);
                }
            }
            let diag = source.diagnostics();
            tracing::debug!(
                packets = diag.packets_received,
                frames = diag.frames_delivered,
                malformed = diag.malformed,
                "receiver stopped"
            );
            source
        })?;
        Ok(Self { task })
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop reading and hand back the source.
    pub fn stop(self) -> Option<RtpSource> {
        self.task.stop()
    }
}
