//! Payload formats: how media frames map onto RTP payloads.
//!
//! The transport engine is codec-agnostic. Three small traits mark the seams
//! where a payload format plugs in:
//!
//! - [`FrameSource`]: produces the next media frame into a caller-supplied
//!   buffer (an encoder, a file reader, or a filter such as the H.264
//!   fragmenter wrapping another source).
//! - [`PayloadPacketizer`]: send-side policy consulted by
//!   [`RtpSink`](crate::sink::RtpSink) while packing frames into packets.
//! - [`Depacketizer`]: receive-side parsing of payload-format headers used by
//!   [`RtpSource`](crate::source::RtpSource) while reassembling frames.
//!
//! ## Supported formats
//!
//! | Format | Module | RFC |
//! |--------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | Generic single-frame (audio, raw) | [`simple`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) |

pub mod h264;
pub mod rtp;
pub mod simple;

use std::time::{Duration, SystemTime};

use crate::error::Result;

/// Metadata describing one frame delivered by a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Bytes written into the caller's buffer.
    pub frame_size: usize,
    /// Bytes of the frame that did not fit in the caller's buffer and were dropped.
    pub num_truncated_bytes: usize,
    pub presentation_time: SystemTime,
    /// Time until the next frame should be sent. Zero for frames that share a
    /// presentation time with their successor (e.g. NAL units of one picture).
    pub duration: Duration,
    /// This frame ends an access unit (the RTP marker bit for video).
    pub completes_access_unit: bool,
}

/// A producer of media frames.
pub trait FrameSource: Send {
    /// Write the next frame into `buf`.
    ///
    /// Returns `Ok(None)` once the source is exhausted. A frame larger than
    /// `buf` is truncated and the dropped byte count is reported in
    /// [`FrameInfo::num_truncated_bytes`].
    fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>>;

    /// Largest frame this source can emit, used to size intermediate buffers.
    fn max_frame_size(&self) -> usize;
}

/// A frame as placed into an outgoing packet, handed to
/// [`PayloadPacketizer::packed_frame`].
#[derive(Debug)]
pub struct PackedFrame<'a> {
    /// The bytes of this frame (or fragment) that went into the packet.
    pub data: &'a [u8],
    pub info: &'a FrameInfo,
    /// Offset of `data` within the source frame when the sink had to split it.
    pub fragmentation_offset: usize,
    /// Bytes of the source frame still waiting for the next packet.
    pub num_remaining_bytes: usize,
    /// Zero for the first frame in the packet.
    pub index_in_packet: usize,
}

/// Send-side payload format policy.
///
/// Defaults describe a format that packs whole frames back to back with no
/// payload header and never sets the marker bit.
pub trait PayloadPacketizer: Send {
    /// RTP payload type number (RFC 3551). Dynamic types use 96 to 127.
    fn payload_type(&self) -> u8;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// Encoding name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// Bytes reserved after the RTP header once per packet.
    fn special_header_size(&self) -> usize {
        0
    }

    /// Bytes reserved before each frame within a packet.
    fn frame_specific_header_size(&self) -> usize {
        0
    }

    /// Whether a frame that starts after other frames in a packet may be
    /// split across packets.
    fn allow_fragmentation_after_start(&self) -> bool {
        false
    }

    /// Whether more frames may follow the final fragment of a split frame
    /// in the same packet.
    fn allow_other_frames_after_last_fragment(&self) -> bool {
        false
    }

    /// Whether `frame` may be packed behind other frames in one packet.
    fn frame_can_appear_after_packet_start(&self, _frame: &[u8]) -> bool {
        true
    }

    /// Called once per frame (or fragment) packed. Returns whether the packet
    /// must carry the marker bit.
    fn packed_frame(&mut self, _frame: &PackedFrame<'_>) -> bool {
        false
    }

    /// SDP media-level attribute lines (with the `a=` prefix), `rtpmap` first.
    fn sdp_attributes(&self) -> Vec<String> {
        vec![format!(
            "a=rtpmap:{} {}/{}",
            self.payload_type(),
            self.codec_name(),
            self.clock_rate()
        )]
    }
}

/// Payload-format header found at the start of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialHeader {
    /// Bytes to skip before the first enclosed frame.
    pub size: usize,
    /// This packet starts a new frame.
    pub begins_frame: bool,
    /// This packet ends the frame it belongs to.
    pub completes_frame: bool,
}

/// Receive-side payload format parsing.
pub trait Depacketizer: Send {
    fn payload_type(&self) -> u8;

    fn clock_rate(&self) -> u32;

    /// Inspect the payload header of a packet about to be consumed.
    ///
    /// Runs exactly once per packet. `payload` may be rewritten in place
    /// (e.g. to rebuild an H.264 NAL header from an FU-A header). Returns
    /// `None` to reject the packet.
    fn process_special_header(&mut self, payload: &mut [u8], marker: bool)
    -> Option<SpecialHeader>;

    /// Locate the next frame within `remaining` packet data, returning the
    /// number of framing bytes to skip and the frame length that follows.
    fn next_enclosed_frame(&self, remaining: &[u8]) -> (usize, usize) {
        (0, remaining.len())
    }

    /// Presentation-time advance between successive frames of one packet.
    fn enclosed_frame_duration(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether this payload's timestamp reflects its sampling instant.
    fn packet_is_usable_in_jitter_calculation(&self, _payload: &[u8]) -> bool {
        true
    }
}
