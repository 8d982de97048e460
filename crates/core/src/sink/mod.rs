//! Send pipeline: frames in, paced RTP packets out.
//!
//! [`RtpSink`] pulls frames from a [`FrameSource`], packs one or more of them
//! into each RTP packet under the policy of a [`PayloadPacketizer`], and
//! computes when the next packet is due from the frames' durations. Frames
//! too large for a packet are split by the sink itself; the part that did
//! not fit is carried to the next packet as overflow data in the
//! [`OutPacketBuffer`].
//!
//! Counters that RTCP and the RTSP layer read while the sink is running
//! live in the shared [`RtpSinkState`].
//!
//! [`UdpSink`] is the non-RTP variant: one frame per datagram.

pub mod buffer;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

pub use buffer::OutPacketBuffer;

use crate::error::{Result, RtpError};
use crate::media::rtp::{MARKER_BIT, RTP_HEADER_LEN, header_word};
use crate::media::{FrameInfo, FrameSource, PackedFrame, PayloadPacketizer};
use crate::task::{Task, sleep_while_running};
use crate::time::rtp_units_since_epoch;
use crate::transport::PacketWriter;

/// Send-side tuning, in the style of a plain config struct with defaults.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Packets are sent once they reach this size (bytes, RTP header included).
    pub preferred_packet_size: usize,
    /// Hard upper bound on packet size.
    pub max_packet_size: usize,
    /// Out-buffer capacity, rounded up to whole packets.
    pub out_buffer_size: usize,
    /// Fixed SSRC; random when `None` (RFC 3550 §8.1).
    pub ssrc: Option<u32>,
    /// Fixed initial sequence number; random when `None`.
    pub initial_seq_no: Option<u16>,
    /// Fixed timestamp base; random when `None`.
    pub timestamp_base: Option<u32>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            preferred_packet_size: 1000,
            max_packet_size: 1456,
            out_buffer_size: 60000,
            ssrc: None,
            initial_seq_no: None,
            timestamp_base: None,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size <= RTP_HEADER_LEN {
            return Err(RtpError::InvalidConfig(format!(
                "max_packet_size {} leaves no room for payload",
                self.max_packet_size
            )));
        }
        if self.preferred_packet_size > self.max_packet_size {
            return Err(RtpError::InvalidConfig(format!(
                "preferred_packet_size {} exceeds max_packet_size {}",
                self.preferred_packet_size, self.max_packet_size
            )));
        }
        if self.out_buffer_size < self.max_packet_size {
            return Err(RtpError::InvalidConfig(format!(
                "out_buffer_size {} is smaller than one packet",
                self.out_buffer_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TimestampMapping {
    base: u32,
    next_timestamp_has_been_preset: bool,
}

/// Sender state shared with RTCP and the session layer.
///
/// Counters are updated by the sink thread only and read elsewhere with
/// relaxed loads.
#[derive(Debug)]
pub struct RtpSinkState {
    ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    seq_no: AtomicU16,
    packet_count: AtomicU32,
    octet_count: AtomicU32,
    total_octet_count: AtomicU64,
    has_sent: AtomicBool,
    rtcp_reports_enabled: AtomicBool,
    timestamps: Mutex<TimestampMapping>,
}

impl RtpSinkState {
    pub(crate) fn new(config: &SinkConfig, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            ssrc: config.ssrc.unwrap_or_else(rand::random),
            payload_type,
            clock_rate,
            seq_no: AtomicU16::new(config.initial_seq_no.unwrap_or_else(rand::random)),
            packet_count: AtomicU32::new(0),
            octet_count: AtomicU32::new(0),
            total_octet_count: AtomicU64::new(0),
            has_sent: AtomicBool::new(false),
            rtcp_reports_enabled: AtomicBool::new(true),
            timestamps: Mutex::new(TimestampMapping {
                base: config.timestamp_base.unwrap_or_else(rand::random),
                next_timestamp_has_been_preset: false,
            }),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Sequence number the next packet will carry (for `RTP-Info: seq=`).
    pub fn current_seq_no(&self) -> u16 {
        self.seq_no.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count.load(Ordering::Relaxed)
    }

    /// Payload octets sent (RTP and payload headers excluded), as reported in SRs.
    pub fn octet_count(&self) -> u32 {
        self.octet_count.load(Ordering::Relaxed)
    }

    pub fn total_octet_count(&self) -> u64 {
        self.total_octet_count.load(Ordering::Relaxed)
    }

    pub fn has_sent_packets(&self) -> bool {
        self.has_sent.load(Ordering::Relaxed)
    }

    /// Whether scheduled RTCP reports go out for this sender.
    pub fn rtcp_reports_enabled(&self) -> bool {
        self.rtcp_reports_enabled.load(Ordering::Relaxed)
    }

    pub fn set_rtcp_reports_enabled(&self, enabled: bool) {
        self.rtcp_reports_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn next_timestamp_has_been_preset(&self) -> bool {
        self.timestamps.lock().next_timestamp_has_been_preset
    }

    /// RTP timestamp for presentation time `t`.
    ///
    /// Consumes a pending preset: the first conversion after
    /// [`preset_next_timestamp`](Self::preset_next_timestamp) returns exactly
    /// the preset value and later ones follow from it.
    pub fn convert_to_rtp_timestamp(&self, t: SystemTime) -> u32 {
        let increment = rtp_units_since_epoch(t, self.clock_rate);
        let mut ts = self.timestamps.lock();
        if ts.next_timestamp_has_been_preset {
            ts.base = ts.base.wrapping_sub(increment);
            ts.next_timestamp_has_been_preset = false;
        }
        ts.base.wrapping_add(increment)
    }

    /// RTP timestamp for `t` without consuming a pending preset (used in SRs).
    pub fn rtp_timestamp_at(&self, t: SystemTime) -> u32 {
        let increment = rtp_units_since_epoch(t, self.clock_rate);
        self.timestamps.lock().base.wrapping_add(increment)
    }

    /// Returns the RTP timestamp for `now` and arranges for the next frame
    /// sent to carry it (for `RTP-Info: rtptime=`).
    pub fn preset_next_timestamp(&self, now: SystemTime) -> u32 {
        let ts_now = self.convert_to_rtp_timestamp(now);
        let mut ts = self.timestamps.lock();
        ts.base = ts_now;
        ts.next_timestamp_has_been_preset = true;
        ts_now
    }

    fn note_packet_sent(&self, packet_size: usize, payload_size: usize) {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.total_octet_count
            .fetch_add(packet_size as u64, Ordering::Relaxed);
        self.octet_count
            .fetch_add(payload_size as u32, Ordering::Relaxed);
        self.seq_no.fetch_add(1, Ordering::Relaxed);
        self.has_sent.store(true, Ordering::Relaxed);
    }
}

/// What a paced sink wants after sending one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send the next packet after `delay`.
    More { delay: Duration },
    /// The source is exhausted.
    Finished,
}

/// A sink that sends one packet per call, paced by the caller.
pub trait MediaSink: Send {
    /// Reset pacing so the next packet goes out at `now`.
    fn restart_pacing(&mut self, now: Instant);

    /// Build and send one packet.
    fn send_next(&mut self, writer: &dyn PacketWriter, now: Instant) -> Result<SendOutcome>;
}

/// Run `sink` on its own thread until the source ends or the task is stopped.
///
/// The sink is handed back by [`Task::stop`] so playback can resume later.
pub fn spawn_sink<S>(name: &str, mut sink: S, writer: Arc<dyn PacketWriter>) -> io::Result<Task<S>>
where
    S: MediaSink + 'static,
{
    Task::spawn(name, move |running| {
        sink.restart_pacing(Instant::now());
        while running.load(Ordering::SeqCst) {
            match sink.send_next(writer.as_ref(), Instant::now()) {
                Ok(SendOutcome::More { delay }) => {
                    if !sleep_while_running(&running, delay) {
                        break;
                    }
                }
                Ok(SendOutcome::Finished) => {
                    tracing::info!("media source exhausted, sink finished");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "sink stopped on source error");
                    break;
                }
            }
        }
        sink
    })
}

enum NextStep {
    PackMore,
    Send,
}

/// Packs frames into RTP packets and paces their transmission.
pub struct RtpSink {
    source: Box<dyn FrameSource>,
    format: Box<dyn PayloadPacketizer>,
    out: OutPacketBuffer,
    state: Arc<RtpSinkState>,

    next_send_time: Instant,
    no_frames_left: bool,

    // Per-packet bookkeeping.
    timestamp_position: usize,
    special_header_size: usize,
    total_frame_specific_header_sizes: usize,
    num_frames_used_so_far: usize,
    cur_fragmentation_offset: usize,
    previous_frame_ended_fragmentation: bool,
    overflow_completes_access_unit: bool,
}

impl RtpSink {
    pub fn new(
        source: Box<dyn FrameSource>,
        format: Box<dyn PayloadPacketizer>,
        config: &SinkConfig,
    ) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(RtpSinkState::new(
            config,
            format.payload_type(),
            format.clock_rate(),
        ));
        tracing::debug!(
            ssrc = format_args!("{:#010X}", state.ssrc()),
            pt = state.payload_type(),
            seq = state.current_seq_no(),
            max_packet = config.max_packet_size,
            "RTP sink created"
        );
        Ok(Self {
            source,
            format,
            out: OutPacketBuffer::new(
                config.preferred_packet_size,
                config.max_packet_size,
                config.out_buffer_size,
            ),
            state,
            next_send_time: Instant::now(),
            no_frames_left: false,
            timestamp_position: 0,
            special_header_size: 0,
            total_frame_specific_header_sizes: 0,
            num_frames_used_so_far: 0,
            cur_fragmentation_offset: 0,
            previous_frame_ended_fragmentation: false,
            overflow_completes_access_unit: false,
        })
    }

    pub fn state(&self) -> Arc<RtpSinkState> {
        self.state.clone()
    }

    /// Largest payload that fits one packet after the RTP and payload headers.
    pub fn max_payload_size(&self) -> usize {
        self.out.max_packet_size() - RTP_HEADER_LEN - self.format.special_header_size()
    }

    pub fn sdp_attributes(&self) -> Vec<String> {
        self.format.sdp_attributes()
    }

    /// Build one packet from as many frames as fit and send it.
    pub fn build_and_send_packet(
        &mut self,
        writer: &dyn PacketWriter,
        now: Instant,
    ) -> Result<SendOutcome> {
        self.begin_packet();
        while let NextStep::PackMore = self.pack_frame()? {}
        Ok(self.send_packet_if_necessary(writer, now))
    }

    fn begin_packet(&mut self) {
        let seq = self.state.current_seq_no();
        self.out
            .enqueue_word(header_word(self.state.payload_type(), seq));
        self.timestamp_position = self.out.cur_packet_size();
        self.out.skip_bytes(4);
        self.out.enqueue_word(self.state.ssrc());

        self.special_header_size = self.format.special_header_size();
        self.out.skip_bytes(self.special_header_size);

        self.total_frame_specific_header_sizes = 0;
        self.num_frames_used_so_far = 0;
        self.no_frames_left = false;
    }

    fn pack_frame(&mut self) -> Result<NextStep> {
        let frame_start = self.out.cur_packet_size();
        let header_size = self.format.frame_specific_header_size();
        self.out.skip_bytes(header_size);
        self.total_frame_specific_header_sizes += header_size;

        let info = if self.out.have_overflow_data() {
            let info = FrameInfo {
                frame_size: self.out.overflow_data_size(),
                num_truncated_bytes: 0,
                presentation_time: self.out.overflow_presentation_time(),
                duration: self.out.overflow_duration(),
                completes_access_unit: self.overflow_completes_access_unit,
            };
            self.out.use_overflow_data();
            info
        } else {
            match self.source.next_frame(self.out.cur_slice())? {
                Some(info) => info,
                None => {
                    tracing::debug!("frame source closed");
                    self.release_frame_header(header_size);
                    self.no_frames_left = true;
                    return Ok(NextStep::Send);
                }
            }
        };
        Ok(self.after_getting_frame(frame_start, header_size, info))
    }

    /// `header_size` is the frame-specific header reserved in front of the
    /// frame; it is given back if the frame is deferred to the next packet.
    fn after_getting_frame(&mut self, frame_start: usize, header_size: usize, info: FrameInfo) -> NextStep {
        if info.num_truncated_bytes > 0 {
            tracing::warn!(
                frame_size = info.frame_size,
                truncated = info.num_truncated_bytes,
                available = self.out.total_bytes_available(),
                "frame larger than out-buffer space, truncated"
            );
        }
        let frame_size = info.frame_size;
        let cur_fragmentation_offset = self.cur_fragmentation_offset;
        let mut num_frame_bytes_to_use = frame_size;
        let mut overflow_bytes = 0;

        if self.num_frames_used_so_far > 0 {
            let frame_pos = self.out.cur_packet_size();
            let mut peek = vec![0u8; frame_size.min(16)];
            self.out.extract(&mut peek, frame_pos);
            if (self.previous_frame_ended_fragmentation
                && !self.format.allow_other_frames_after_last_fragment())
                || !self.format.frame_can_appear_after_packet_start(&peek)
            {
                // Start the next packet with this frame instead.
                num_frame_bytes_to_use = 0;
                self.set_overflow(frame_pos, frame_size, &info);
                self.release_frame_header(header_size);
            }
        }
        self.previous_frame_ended_fragmentation = false;

        if num_frame_bytes_to_use > 0 {
            if self.out.would_overflow(frame_size) {
                // A frame leading its packet can never fit a later one
                // either, so it is split here.
                if self.num_frames_used_so_far == 0
                    || (self.out.is_too_big_for_a_packet(frame_size)
                        && self.format.allow_fragmentation_after_start())
                {
                    overflow_bytes = self.out.num_overflow_bytes(frame_size);
                    num_frame_bytes_to_use -= overflow_bytes;
                    self.cur_fragmentation_offset += num_frame_bytes_to_use;
                } else {
                    overflow_bytes = frame_size;
                    num_frame_bytes_to_use = 0;
                }
                let offset = self.out.cur_packet_size() + num_frame_bytes_to_use;
                self.set_overflow(offset, overflow_bytes, &info);
                if num_frame_bytes_to_use == 0 {
                    self.release_frame_header(header_size);
                }
            } else if self.cur_fragmentation_offset > 0 {
                self.cur_fragmentation_offset = 0;
                self.previous_frame_ended_fragmentation = true;
            }
        }

        if num_frame_bytes_to_use == 0 && frame_size > 0 {
            return NextStep::Send;
        }

        let data_start = self.out.cur_packet_size();
        self.out.increment(num_frame_bytes_to_use);
        self.special_frame_handling(
            data_start,
            num_frame_bytes_to_use,
            cur_fragmentation_offset,
            overflow_bytes,
            &info,
        );
        self.num_frames_used_so_far += 1;

        if overflow_bytes == 0 {
            self.next_send_time += info.duration;
        }

        let mut head = vec![0u8; num_frame_bytes_to_use.min(16)];
        self.out.extract(&mut head, data_start);
        let send_now = self.out.is_preferred_size()
            || self.out.would_overflow(num_frame_bytes_to_use)
            || (self.previous_frame_ended_fragmentation
                && !self.format.allow_other_frames_after_last_fragment())
            || !self.format.frame_can_appear_after_packet_start(&head);

        tracing::trace!(
            frame_start,
            used = num_frame_bytes_to_use,
            overflow = overflow_bytes,
            packet_size = self.out.cur_packet_size(),
            send_now,
            "frame packed"
        );
        if send_now {
            NextStep::Send
        } else {
            NextStep::PackMore
        }
    }

    fn release_frame_header(&mut self, header_size: usize) {
        self.out.rewind(header_size);
        self.total_frame_specific_header_sizes -= header_size;
    }

    fn set_overflow(&mut self, offset: usize, size: usize, info: &FrameInfo) {
        self.out
            .set_overflow_data(offset, size, info.presentation_time, info.duration);
        self.overflow_completes_access_unit = info.completes_access_unit;
    }

    fn special_frame_handling(
        &mut self,
        data_start: usize,
        num_bytes: usize,
        fragmentation_offset: usize,
        num_remaining_bytes: usize,
        info: &FrameInfo,
    ) {
        let mut data = vec![0u8; num_bytes];
        self.out.extract(&mut data, data_start);
        let marker = self.format.packed_frame(&PackedFrame {
            data: &data,
            info,
            fragmentation_offset,
            num_remaining_bytes,
            index_in_packet: self.num_frames_used_so_far,
        });
        if marker {
            let word = self.out.extract_word(0) | MARKER_BIT;
            self.out.insert_word(word, 0);
        }
        if self.num_frames_used_so_far == 0 {
            let ts = self.state.convert_to_rtp_timestamp(info.presentation_time);
            self.out.insert_word(ts, self.timestamp_position);
        }
    }

    fn send_packet_if_necessary(&mut self, writer: &dyn PacketWriter, now: Instant) -> SendOutcome {
        if self.num_frames_used_so_far > 0 {
            let packet = self.out.packet();
            if let Err(e) = writer.send_packet(packet) {
                tracing::warn!(error = %e, len = packet.len(), "failed to send RTP packet");
            }
            let overhead =
                RTP_HEADER_LEN + self.special_header_size + self.total_frame_specific_header_sizes;
            tracing::trace!(
                seq = self.state.current_seq_no(),
                len = packet.len(),
                frames = self.num_frames_used_so_far,
                "RTP packet sent"
            );
            self.state
                .note_packet_sent(packet.len(), packet.len().saturating_sub(overhead));
        }

        // Keep pending overflow where it is when there is room: the next
        // header then lands right in front of it.
        if self.out.have_overflow_data()
            && self.out.total_bytes_available() > self.out.limit() / 2
        {
            let header_size = RTP_HEADER_LEN
                + self.special_header_size
                + self.format.frame_specific_header_size();
            let new_packet_start = self.out.cur_packet_size().saturating_sub(header_size);
            self.out.adjust_packet_start(new_packet_start);
        } else {
            self.out.reset_packet_start();
        }
        self.out.reset_offset();
        self.num_frames_used_so_far = 0;

        if self.no_frames_left {
            SendOutcome::Finished
        } else {
            SendOutcome::More {
                delay: self.next_send_time.saturating_duration_since(now),
            }
        }
    }
}

impl MediaSink for RtpSink {
    fn restart_pacing(&mut self, now: Instant) {
        self.next_send_time = now;
    }

    fn send_next(&mut self, writer: &dyn PacketWriter, now: Instant) -> Result<SendOutcome> {
        self.build_and_send_packet(writer, now)
    }
}

/// Sends each frame from `source` as one raw UDP datagram (no RTP header).
pub struct UdpSink {
    source: Box<dyn FrameSource>,
    buf: Vec<u8>,
    next_send_time: Instant,
}

impl UdpSink {
    pub fn new(source: Box<dyn FrameSource>, max_payload_size: usize) -> Self {
        Self {
            source,
            buf: vec![0; max_payload_size],
            next_send_time: Instant::now(),
        }
    }
}

impl MediaSink for UdpSink {
    fn restart_pacing(&mut self, now: Instant) {
        self.next_send_time = now;
    }

    fn send_next(&mut self, writer: &dyn PacketWriter, now: Instant) -> Result<SendOutcome> {
        let Some(info) = self.source.next_frame(&mut self.buf)? else {
            return Ok(SendOutcome::Finished);
        };
        if info.num_truncated_bytes > 0 {
            tracing::warn!(
                truncated = info.num_truncated_bytes,
                max = self.buf.len(),
                "frame larger than datagram, truncated"
            );
        }
        if let Err(e) = writer.send_packet(&self.buf[..info.frame_size]) {
            tracing::warn!(error = %e, len = info.frame_size, "failed to send datagram");
        }
        self.next_send_time += info.duration;
        Ok(SendOutcome::More {
            delay: self.next_send_time.saturating_duration_since(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::{H264Fragmenter, H264Packetizer};
    use crate::media::simple::SimplePacketizer;
    use crate::transport::PacketQueue;
    use std::time::UNIX_EPOCH;

    /// Yields fixed-size frames of distinct byte patterns, 40 ms apart.
    struct Frames {
        sizes: Vec<usize>,
        next: usize,
    }

    fn frame_bytes(index: usize, size: usize) -> Vec<u8> {
        (0..size).map(|i| (index * 31 + i) as u8).collect()
    }

    impl FrameSource for Frames {
        fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>> {
            let Some(&size) = self.sizes.get(self.next) else {
                return Ok(None);
            };
            let data = frame_bytes(self.next, size);
            let n = size.min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            let info = FrameInfo {
                frame_size: n,
                num_truncated_bytes: size - n,
                presentation_time: UNIX_EPOCH
                    + Duration::from_secs(1000)
                    + Duration::from_millis(40 * self.next as u64),
                duration: Duration::from_millis(40),
                completes_access_unit: true,
            };
            self.next += 1;
            Ok(Some(info))
        }

        fn max_frame_size(&self) -> usize {
            self.sizes.iter().copied().max().unwrap_or(0)
        }
    }

    fn config(max_packet_size: usize) -> SinkConfig {
        SinkConfig {
            preferred_packet_size: max_packet_size,
            max_packet_size,
            out_buffer_size: 4 * max_packet_size,
            ssrc: Some(0x1234_5678),
            initial_seq_no: Some(65534),
            timestamp_base: Some(0),
        }
    }

    fn run(sink: &mut RtpSink, out: &PacketQueue) {
        let now = Instant::now();
        sink.restart_pacing(now);
        while let SendOutcome::More { .. } = sink.build_and_send_packet(out, now).unwrap() {}
    }

    #[test]
    fn header_fields_and_wrapping_sequence() {
        let source = Frames {
            sizes: vec![10, 10, 10],
            next: 0,
        };
        let format = SimplePacketizer::new(97, 8000, "L8").with_multiple_frames_per_packet(false);
        let mut sink = RtpSink::new(Box::new(source), Box::new(format), &config(100)).unwrap();
        let out = PacketQueue::default();
        run(&mut sink, &out);

        let packets = out.take();
        assert_eq!(packets.len(), 3);
        let seqs: Vec<u16> = packets
            .iter()
            .map(|p| u16::from_be_bytes([p[2], p[3]]))
            .collect();
        assert_eq!(seqs, vec![65534, 65535, 0]);
        for p in &packets {
            assert_eq!(p[0], 0x80);
            assert_eq!(p[1], 0x80 | 97);
            assert_eq!(&p[8..12], &[0x12, 0x34, 0x56, 0x78]);
        }
        let ts: Vec<u32> = packets
            .iter()
            .map(|p| u32::from_be_bytes([p[4], p[5], p[6], p[7]]))
            .collect();
        assert_eq!(ts[1].wrapping_sub(ts[0]), 320);
        assert_eq!(ts[2].wrapping_sub(ts[1]), 320);

        let state = sink.state();
        assert_eq!(state.packet_count(), 3);
        assert_eq!(state.octet_count(), 30);
        assert_eq!(state.total_octet_count(), 66);
        assert_eq!(state.current_seq_no(), 1);
    }

    #[test]
    fn small_frames_share_a_packet() {
        let source = Frames {
            sizes: vec![20; 4],
            next: 0,
        };
        let format = SimplePacketizer::new(97, 8000, "L8").with_marker_on_last_fragment(false);
        let mut cfg = config(100);
        cfg.preferred_packet_size = 50;
        let mut sink = RtpSink::new(Box::new(source), Box::new(format), &cfg).unwrap();
        let out = PacketQueue::default();
        run(&mut sink, &out);

        let packets = out.take();
        let sizes: Vec<usize> = packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![12 + 40, 12 + 40]);
        assert_eq!(&packets[0][12..32], frame_bytes(0, 20).as_slice());
        assert_eq!(&packets[0][32..52], frame_bytes(1, 20).as_slice());
    }

    #[test]
    fn oversized_frame_is_split_with_bit_identical_overflow() {
        let source = Frames {
            sizes: vec![250, 30],
            next: 0,
        };
        let format = SimplePacketizer::new(97, 8000, "L8");
        let mut sink = RtpSink::new(Box::new(source), Box::new(format), &config(100)).unwrap();
        let out = PacketQueue::default();
        run(&mut sink, &out);

        let packets = out.take();
        assert!(packets.iter().all(|p| p.len() <= 100));
        let mut first_frame = Vec::new();
        for p in &packets[..3] {
            first_frame.extend_from_slice(&p[12..]);
        }
        assert_eq!(first_frame, frame_bytes(0, 250));

        // Marker only on the fragment completing the frame.
        let markers: Vec<bool> = packets.iter().map(|p| p[1] & 0x80 != 0).collect();
        assert_eq!(markers, vec![false, false, true, true]);
        // All fragments of one frame share its timestamp.
        let ts0 = &packets[0][4..8];
        assert!(packets[..3].iter().all(|p| &p[4..8] == ts0));
        assert_eq!(&packets[3][12..], frame_bytes(1, 30).as_slice());
    }

    #[test]
    fn h264_fragments_one_per_packet_with_marker_on_last() {
        struct OneNal(Option<Vec<u8>>);
        impl FrameSource for OneNal {
            fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>> {
                let Some(nal) = self.0.take() else {
                    return Ok(None);
                };
                buf[..nal.len()].copy_from_slice(&nal);
                Ok(Some(FrameInfo {
                    frame_size: nal.len(),
                    num_truncated_bytes: 0,
                    presentation_time: UNIX_EPOCH,
                    duration: Duration::from_millis(40),
                    completes_access_unit: true,
                }))
            }
            fn max_frame_size(&self) -> usize {
                4000
            }
        }

        let mut nal = vec![0x65];
        nal.extend(std::iter::repeat_n(0x11, 3000));
        let cfg = SinkConfig {
            ssrc: Some(1),
            ..SinkConfig::default()
        };
        let packetizer = H264Packetizer::new(96);
        // Fragmenter needs the payload limit of the sink it feeds.
        let sizing = RtpSink::new(
            Box::new(OneNal(None)),
            Box::new(packetizer.clone()),
            &cfg,
        )
        .unwrap();
        let max_payload = sizing.max_payload_size();
        let fragmenter = H264Fragmenter::new(OneNal(Some(nal)), max_payload);
        let mut sink = RtpSink::new(Box::new(fragmenter), Box::new(packetizer), &cfg).unwrap();
        let out = PacketQueue::default();
        run(&mut sink, &out);

        let packets = out.take();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.len() <= cfg.max_packet_size));
        assert!(packets.iter().all(|p| p[12] & 0x1F == 28));
        let markers: Vec<bool> = packets.iter().map(|p| p[1] & 0x80 != 0).collect();
        assert_eq!(markers, vec![false, false, true]);
    }

    #[test]
    fn preset_timestamp_is_used_by_next_frame() {
        let source = Frames {
            sizes: vec![10, 10],
            next: 0,
        };
        let format = SimplePacketizer::new(97, 8000, "L8").with_multiple_frames_per_packet(false);
        let mut sink = RtpSink::new(Box::new(source), Box::new(format), &config(100)).unwrap();
        let state = sink.state();
        let preset = state.preset_next_timestamp(UNIX_EPOCH + Duration::from_secs(5000));
        assert!(state.next_timestamp_has_been_preset());

        let out = PacketQueue::default();
        run(&mut sink, &out);
        assert!(!state.next_timestamp_has_been_preset());
        let packets = out.take();
        let ts0 = u32::from_be_bytes([packets[0][4], packets[0][5], packets[0][6], packets[0][7]]);
        let ts1 = u32::from_be_bytes([packets[1][4], packets[1][5], packets[1][6], packets[1][7]]);
        assert_eq!(ts0, preset);
        assert_eq!(ts1.wrapping_sub(ts0), 320);
    }

    #[test]
    fn pacing_follows_frame_durations() {
        let source = Frames {
            sizes: vec![10, 10, 10],
            next: 0,
        };
        let format = SimplePacketizer::new(97, 8000, "L8").with_multiple_frames_per_packet(false);
        let mut sink = RtpSink::new(Box::new(source), Box::new(format), &config(100)).unwrap();
        let out = PacketQueue::default();
        let start = Instant::now();
        sink.restart_pacing(start);
        assert_eq!(
            sink.build_and_send_packet(&out, start).unwrap(),
            SendOutcome::More {
                delay: Duration::from_millis(40)
            }
        );
        assert_eq!(
            sink.build_and_send_packet(&out, start + Duration::from_millis(50))
                .unwrap(),
            SendOutcome::More {
                delay: Duration::from_millis(30)
            }
        );
    }

    /// Runs the sink to completion, failing if it stops making progress.
    fn run_to_end(sink: &mut RtpSink, out: &PacketQueue) {
        let now = Instant::now();
        sink.restart_pacing(now);
        for _ in 0..100 {
            if sink.build_and_send_packet(out, now).unwrap() == SendOutcome::Finished {
                return;
            }
        }
        panic!("sink did not finish, {} packets sent", out.len());
    }

    #[test]
    fn frame_leading_a_packet_is_split_when_headers_leave_too_little_room() {
        // 95 and 183 bytes fit under the 100-byte limit only without the RTP header.
        for (size, expected) in [(95, vec![100, 19]), (183, vec![100, 100, 19])] {
            let source = Frames {
                sizes: vec![size],
                next: 0,
            };
            let format = SimplePacketizer::new(97, 8000, "L8");
            let mut sink = RtpSink::new(Box::new(source), Box::new(format), &config(100)).unwrap();
            let out = PacketQueue::default();
            run_to_end(&mut sink, &out);

            let packets = out.take();
            assert_eq!(packets.iter().map(Vec::len).collect::<Vec<_>>(), expected);
            let payload: Vec<u8> = packets.iter().flat_map(|p| p[12..].to_vec()).collect();
            assert_eq!(payload, frame_bytes(0, size));
        }
    }

    /// Two-byte per-frame header, zeroed when each frame is packed.
    struct Prefixed;

    impl PayloadPacketizer for Prefixed {
        fn payload_type(&self) -> u8 {
            98
        }

        fn clock_rate(&self) -> u32 {
            8000
        }

        fn codec_name(&self) -> &'static str {
            "X-PREFIXED"
        }

        fn frame_specific_header_size(&self) -> usize {
            2
        }
    }

    #[test]
    fn deferred_frame_takes_its_header_to_the_next_packet() {
        let source = Frames {
            sizes: vec![40, 50],
            next: 0,
        };
        let mut sink = RtpSink::new(Box::new(source), Box::new(Prefixed), &config(100)).unwrap();
        let out = PacketQueue::default();
        run_to_end(&mut sink, &out);

        let packets = out.take();
        assert_eq!(packets.iter().map(Vec::len).collect::<Vec<_>>(), vec![12 + 2 + 40, 12 + 2 + 50]);
        assert_eq!(&packets[0][14..], frame_bytes(0, 40).as_slice());
        assert_eq!(&packets[1][14..], frame_bytes(1, 50).as_slice());
        // Payload octets exclude the per-frame headers.
        assert_eq!(sink.state().octet_count(), 90);
    }

    #[test]
    fn rejects_bad_config() {
        let cfg = SinkConfig {
            max_packet_size: 12,
            ..SinkConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
