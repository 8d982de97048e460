//! Generic payload format for media with no RTP payload header of its own
//! (most audio codecs, raw frames).

use super::{Depacketizer, PackedFrame, PayloadPacketizer, SpecialHeader};

/// Send side: frames are copied into packets verbatim.
#[derive(Debug, Clone)]
pub struct SimplePacketizer {
    pt: u8,
    clock_rate: u32,
    codec_name: &'static str,
    set_marker_on_last_fragment: bool,
    allow_multiple_frames_per_packet: bool,
}

impl SimplePacketizer {
    pub fn new(pt: u8, clock_rate: u32, codec_name: &'static str) -> Self {
        Self {
            pt,
            clock_rate,
            codec_name,
            set_marker_on_last_fragment: true,
            allow_multiple_frames_per_packet: true,
        }
    }

    /// Set the marker bit on packets ending a frame. On by default.
    pub fn with_marker_on_last_fragment(mut self, enabled: bool) -> Self {
        self.set_marker_on_last_fragment = enabled;
        self
    }

    /// Let several small frames share one packet. On by default.
    pub fn with_multiple_frames_per_packet(mut self, enabled: bool) -> Self {
        self.allow_multiple_frames_per_packet = enabled;
        self
    }
}

impl PayloadPacketizer for SimplePacketizer {
    fn payload_type(&self) -> u8 {
        self.pt
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn codec_name(&self) -> &'static str {
        self.codec_name
    }

    fn frame_can_appear_after_packet_start(&self, _frame: &[u8]) -> bool {
        self.allow_multiple_frames_per_packet
    }

    fn packed_frame(&mut self, frame: &PackedFrame<'_>) -> bool {
        self.set_marker_on_last_fragment && frame.num_remaining_bytes == 0
    }
}

/// Receive side: each packet is one frame, or one piece of a frame when the
/// marker bit is used to flag the final piece.
#[derive(Debug)]
pub struct SimpleDepacketizer {
    pt: u8,
    clock_rate: u32,
    offset: usize,
    use_marker: bool,
    previous_completed: bool,
}

impl SimpleDepacketizer {
    pub fn new(pt: u8, clock_rate: u32) -> Self {
        Self {
            pt,
            clock_rate,
            offset: 0,
            use_marker: false,
            previous_completed: true,
        }
    }

    /// Skip this many bytes of fixed payload header in every packet.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// A frame is complete only on a packet with the marker bit set.
    pub fn with_marker(mut self, use_marker: bool) -> Self {
        self.use_marker = use_marker;
        self
    }
}

impl Depacketizer for SimpleDepacketizer {
    fn payload_type(&self) -> u8 {
        self.pt
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn process_special_header(
        &mut self,
        payload: &mut [u8],
        marker: bool,
    ) -> Option<SpecialHeader> {
        if payload.len() < self.offset {
            return None;
        }
        let completes_frame = !self.use_marker || marker;
        let header = SpecialHeader {
            size: self.offset,
            begins_frame: self.previous_completed,
            completes_frame,
        };
        self.previous_completed = completes_frame;
        Some(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_rule_spans_packets() {
        let mut d = SimpleDepacketizer::new(97, 8000).with_marker(true);
        let a = d.process_special_header(&mut [1, 2], false).unwrap();
        assert!(a.begins_frame && !a.completes_frame);
        let b = d.process_special_header(&mut [3], true).unwrap();
        assert!(!b.begins_frame && b.completes_frame);
        let c = d.process_special_header(&mut [4], true).unwrap();
        assert!(c.begins_frame && c.completes_frame);
    }

    #[test]
    fn offset_too_large_rejects() {
        let mut d = SimpleDepacketizer::new(14, 90000).with_offset(4);
        assert!(d.process_special_header(&mut [0; 3], false).is_none());
        assert_eq!(d.process_special_header(&mut [0; 8], false).unwrap().size, 4);
    }

    #[test]
    fn packetizer_defaults() {
        let p = SimplePacketizer::new(0, 8000, "PCMU");
        assert!(p.frame_can_appear_after_packet_start(&[]));
        assert_eq!(p.sdp_attributes(), vec!["a=rtpmap:0 PCMU/8000".to_string()]);
    }
}
