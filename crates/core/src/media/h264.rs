use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::prelude::{BASE64_STANDARD, Engine as _};
use parking_lot::Mutex;

use super::{Depacketizer, FrameInfo, FrameSource, PackedFrame, PayloadPacketizer, SpecialHeader};
use crate::error::Result;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_STAP_B: u8 = 25;
const NAL_TYPE_MTAP16: u8 = 26;
const NAL_TYPE_MTAP24: u8 = 27;
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_FU_B: u8 = 29;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Splits H.264 NAL units that exceed one RTP payload into FU-A fragments
/// (RFC 6184 §5.8).
///
/// Sits between an upstream [`FrameSource`] that yields one NAL unit per
/// frame (e.g. [`AnnexBSource`]) and the [`RtpSink`](crate::sink::RtpSink).
/// NAL units that fit in `max_output_packet_size` pass through untouched.
/// Larger ones are emitted as successive fragments:
///
/// ```text
/// FU indicator:  [F|NRI|Type=28]     (1 byte)
/// FU header:     [S|E|R|NAL_Type]    (1 byte)
/// Fragment data: [...]               (up to max_output_packet_size - 2 bytes)
/// ```
///
/// All fragments share the NAL unit's presentation time. Only the last one
/// carries its duration and its access-unit-end flag.
pub struct H264Fragmenter<S> {
    input: S,
    max_output_packet_size: usize,
    /// Byte 0 is spare so the first fragment can prepend its FU indicator
    /// without moving the NAL unit.
    buf: Vec<u8>,
    num_valid_data_bytes: usize,
    cur_data_offset: usize,
    fu_indicator: u8,
    nal_type: u8,
    current: Option<FrameInfo>,
}

impl<S: FrameSource> H264Fragmenter<S> {
    /// `max_output_packet_size` is the largest RTP payload the sink accepts,
    /// i.e. [`RtpSink::max_payload_size`](crate::sink::RtpSink::max_payload_size).
    pub fn new(input: S, max_output_packet_size: usize) -> Self {
        let buf = vec![0u8; input.max_frame_size() + 1];
        Self {
            input,
            max_output_packet_size: max_output_packet_size.max(3),
            buf,
            num_valid_data_bytes: 1,
            cur_data_offset: 1,
            fu_indicator: 0,
            nal_type: 0,
            current: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.input
    }

    /// Pull the next non-empty NAL unit from the input. `false` at end of stream.
    fn fill(&mut self) -> Result<bool> {
        loop {
            let Some(info) = self.input.next_frame(&mut self.buf[1..])? else {
                return Ok(false);
            };
            if info.num_truncated_bytes > 0 {
                tracing::warn!(
                    truncated = info.num_truncated_bytes,
                    capacity = self.buf.len() - 1,
                    "NAL unit larger than fragmenter input buffer, truncated"
                );
            }
            if info.frame_size == 0 {
                continue;
            }
            self.num_valid_data_bytes = 1 + info.frame_size;
            self.cur_data_offset = 1;
            self.current = Some(info);
            return Ok(true);
        }
    }
}

impl<S: FrameSource> FrameSource for H264Fragmenter<S> {
    fn next_frame(&mut self, out: &mut [u8]) -> Result<Option<FrameInfo>> {
        if self.num_valid_data_bytes == 1 && !self.fill()? {
            return Ok(None);
        }
        let Some(nal) = self.current else {
            return Ok(None);
        };

        let (start, len, last_fragment) = if self.cur_data_offset == 1 {
            let nal_size = self.num_valid_data_bytes - 1;
            if nal_size <= self.max_output_packet_size {
                self.cur_data_offset = self.num_valid_data_bytes;
                (1, nal_size, true)
            } else {
                let header = self.buf[1];
                self.fu_indicator = (header & 0xE0) | NAL_TYPE_FU_A;
                self.nal_type = header & 0x1F;
                self.buf[0] = self.fu_indicator;
                self.buf[1] = FU_START | self.nal_type;
                self.cur_data_offset += self.max_output_packet_size - 1;
                (0, self.max_output_packet_size, false)
            }
        } else {
            // Overwrite the tail of the previous fragment with this one's FU bytes.
            let start = self.cur_data_offset - 2;
            self.buf[start] = self.fu_indicator;
            self.buf[start + 1] = self.nal_type;
            let mut len = 2 + (self.num_valid_data_bytes - self.cur_data_offset);
            let last = len <= self.max_output_packet_size;
            if last {
                self.buf[start + 1] |= FU_END;
            } else {
                len = self.max_output_packet_size;
            }
            self.cur_data_offset += len - 2;
            (start, len, last)
        };

        let frame_size = len.min(out.len());
        out[..frame_size].copy_from_slice(&self.buf[start..start + frame_size]);
        if frame_size < len {
            tracing::warn!(
                wanted = len,
                available = out.len(),
                "sink buffer too small for H.264 fragment, truncated"
            );
        }

        if self.cur_data_offset >= self.num_valid_data_bytes {
            self.num_valid_data_bytes = 1;
            self.cur_data_offset = 1;
        }

        Ok(Some(FrameInfo {
            frame_size,
            num_truncated_bytes: len - frame_size,
            presentation_time: nal.presentation_time,
            duration: if last_fragment {
                nal.duration
            } else {
                Duration::ZERO
            },
            completes_access_unit: last_fragment && nal.completes_access_unit,
        }))
    }

    fn max_frame_size(&self) -> usize {
        self.max_output_packet_size
    }
}

#[derive(Debug, Default)]
struct ParameterSets {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

/// H.264 send-side payload format (RFC 6184, packetization-mode 1).
///
/// Each packet carries exactly one NAL unit or FU-A fragment; the marker bit
/// is set on the packet that ends an access unit (RFC 6184 §5.1).
///
/// SPS/PPS are captured from the first NAL units of those types that pass
/// through the sink, unless set explicitly. Clones share the captured sets so
/// a clone kept outside the sink can still produce the `fmtp` line.
#[derive(Debug, Clone)]
pub struct H264Packetizer {
    pt: u8,
    params: Arc<Mutex<ParameterSets>>,
}

impl H264Packetizer {
    pub fn new(pt: u8) -> Self {
        Self {
            pt,
            params: Arc::new(Mutex::new(ParameterSets::default())),
        }
    }

    pub fn set_parameter_sets(&self, sps: &[u8], pps: &[u8]) {
        let mut params = self.params.lock();
        params.sps = Some(sps.to_vec());
        params.pps = Some(pps.to_vec());
    }

    /// `a=fmtp` line per RFC 6184 §8.1. `profile-level-id` comes from SPS
    /// bytes 1 to 3; `sprop-parameter-sets` is the base64 SPS and PPS.
    pub fn fmtp_line(&self) -> String {
        let params = self.params.lock();
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.pt);
        if let Some(sps) = params.sps.as_deref().filter(|sps| sps.len() >= 4) {
            fmtp.push_str(&format!(
                ";profile-level-id={:02X}{:02X}{:02X}",
                sps[1], sps[2], sps[3]
            ));
        }
        if let (Some(sps), Some(pps)) = (params.sps.as_deref(), params.pps.as_deref()) {
            fmtp.push_str(&format!(
                ";sprop-parameter-sets={},{}",
                BASE64_STANDARD.encode(sps),
                BASE64_STANDARD.encode(pps)
            ));
        }
        fmtp
    }

    fn capture_parameter_set(&self, nal: &[u8]) {
        let Some(&header) = nal.first() else {
            return;
        };
        let mut params = self.params.lock();
        match header & 0x1F {
            NAL_TYPE_SPS if params.sps.is_none() => {
                tracing::debug!(len = nal.len(), "H.264 SPS captured from bitstream");
                params.sps = Some(nal.to_vec());
            }
            NAL_TYPE_PPS if params.pps.is_none() => {
                tracing::debug!(len = nal.len(), "H.264 PPS captured from bitstream");
                params.pps = Some(nal.to_vec());
            }
            _ => {}
        }
    }
}

impl PayloadPacketizer for H264Packetizer {
    fn payload_type(&self) -> u8 {
        self.pt
    }

    /// 90 kHz clock rate per RFC 6184 §8.1.
    fn clock_rate(&self) -> u32 {
        90000
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn frame_can_appear_after_packet_start(&self, _frame: &[u8]) -> bool {
        false
    }

    fn packed_frame(&mut self, frame: &PackedFrame<'_>) -> bool {
        if frame.fragmentation_offset == 0 && frame.num_remaining_bytes == 0 {
            self.capture_parameter_set(frame.data);
        }
        frame.num_remaining_bytes == 0 && frame.info.completes_access_unit
    }

    /// `a=rtpmap` must precede the `a=fmtp` line that references its payload type.
    fn sdp_attributes(&self) -> Vec<String> {
        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.pt,
                self.codec_name(),
                self.clock_rate()
            ),
            self.fmtp_line(),
        ]
    }
}

/// H.264 receive-side payload format.
///
/// Single NAL unit packets are delivered as-is. Aggregation packets (STAP-A,
/// STAP-B, MTAP) are split into their NAL units, one frame each. FU-A/FU-B
/// fragments are reassembled: the start fragment has its FU indicator
/// dropped and the original NAL header rebuilt in place of the FU header.
#[derive(Debug)]
pub struct H264Depacketizer {
    pt: u8,
    current_packet_nal_type: u8,
}

impl H264Depacketizer {
    pub fn new(pt: u8) -> Self {
        Self {
            pt,
            current_packet_nal_type: 0,
        }
    }
}

impl Depacketizer for H264Depacketizer {
    fn payload_type(&self) -> u8 {
        self.pt
    }

    fn clock_rate(&self) -> u32 {
        90000
    }

    fn process_special_header(
        &mut self,
        payload: &mut [u8],
        _marker: bool,
    ) -> Option<SpecialHeader> {
        let &first = payload.first()?;
        self.current_packet_nal_type = first & 0x1F;
        let header = match self.current_packet_nal_type {
            NAL_TYPE_STAP_A => SpecialHeader {
                size: 1,
                begins_frame: true,
                completes_frame: true,
            },
            // Type byte plus the 16-bit decoding order number.
            NAL_TYPE_STAP_B | NAL_TYPE_MTAP16 | NAL_TYPE_MTAP24 => SpecialHeader {
                size: 3,
                begins_frame: true,
                completes_frame: true,
            },
            NAL_TYPE_FU_A | NAL_TYPE_FU_B => {
                if payload.len() < 2 {
                    return None;
                }
                let fu_header = payload[1];
                let start = fu_header & FU_START != 0;
                if start {
                    payload[1] = (first & 0xE0) | (fu_header & 0x1F);
                }
                SpecialHeader {
                    size: if start { 1 } else { 2 },
                    begins_frame: start,
                    completes_frame: fu_header & FU_END != 0,
                }
            }
            _ => SpecialHeader {
                size: 0,
                begins_frame: true,
                completes_frame: true,
            },
        };
        Some(header)
    }

    fn next_enclosed_frame(&self, remaining: &[u8]) -> (usize, usize) {
        let (prefix, overhead) = match self.current_packet_nal_type {
            NAL_TYPE_STAP_A | NAL_TYPE_STAP_B => (2, 0),
            // Size, DOND and a 16- or 24-bit timestamp offset.
            NAL_TYPE_MTAP16 => (5, 3),
            NAL_TYPE_MTAP24 => (6, 4),
            _ => return (0, remaining.len()),
        };
        if remaining.len() < prefix {
            return (0, remaining.len());
        }
        let declared = usize::from(u16::from_be_bytes([remaining[0], remaining[1]]));
        let frame_size = declared.saturating_sub(overhead);
        (prefix, frame_size.min(remaining.len() - prefix))
    }
}

/// A [`FrameSource`] over an in-memory H.264 Annex B byte stream.
///
/// Emits one NAL unit per frame, without start codes. All NAL units of an
/// access unit share a presentation time; the last one carries the frame
/// interval as its duration and is flagged as completing the access unit.
pub struct AnnexBSource {
    nal_units: Vec<Vec<u8>>,
    next: usize,
    frame_interval: Duration,
    presentation_time: Option<SystemTime>,
    max_frame_size: usize,
}

impl AnnexBSource {
    pub fn new(data: &[u8], fps: f64) -> Self {
        let nal_units = extract_nal_units(data);
        let max_frame_size = nal_units.iter().map(Vec::len).max().unwrap_or(0);
        tracing::debug!(
            nal_count = nal_units.len(),
            max_nal = max_frame_size,
            fps,
            "Annex B stream loaded"
        );
        Self {
            nal_units,
            next: 0,
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1.0)),
            presentation_time: None,
            max_frame_size,
        }
    }

    /// First presentation time; defaults to the wall clock at the first read.
    pub fn with_start_time(mut self, start: SystemTime) -> Self {
        self.presentation_time = Some(start);
        self
    }

    /// Whether the NAL unit at `idx` is the last of its access unit.
    fn ends_access_unit(&self, idx: usize) -> bool {
        let Some(&header) = self.nal_units[idx].first() else {
            return false;
        };
        if !is_vcl(header) {
            return false;
        }
        match self.nal_units.get(idx + 1) {
            None => true,
            Some(next) => match next.first() {
                // first_mb_in_slice == 0 is coded as a single '1' bit.
                Some(&h) if is_vcl(h) => next.get(1).is_some_and(|b| b & 0x80 != 0),
                Some(_) => true,
                None => false,
            },
        }
    }
}

impl FrameSource for AnnexBSource {
    fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>> {
        if self.next >= self.nal_units.len() {
            return Ok(None);
        }
        let idx = self.next;
        self.next += 1;

        let presentation_time = *self.presentation_time.get_or_insert_with(SystemTime::now);
        let nal = &self.nal_units[idx];
        let frame_size = nal.len().min(buf.len());
        buf[..frame_size].copy_from_slice(&nal[..frame_size]);
        let num_truncated_bytes = nal.len() - frame_size;

        let completes_access_unit = self.ends_access_unit(idx);
        let duration = if completes_access_unit {
            self.presentation_time = Some(presentation_time + self.frame_interval);
            self.frame_interval
        } else {
            Duration::ZERO
        };

        Ok(Some(FrameInfo {
            frame_size,
            num_truncated_bytes,
            presentation_time,
            duration,
            completes_access_unit,
        }))
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

fn is_vcl(header: u8) -> bool {
    matches!(header & 0x1F, 1..=5)
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte `00 00 01`)
/// and returns the NAL data between them, excluding the start codes. Each
/// start code's length is tracked so boundaries stay correct when 3- and
/// 4-byte codes are mixed.
pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
    // (nal_data_start_index, start_code_length)
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        if data[i..].starts_with(&[0, 0, 0, 1]) {
            starts.push((i + 4, 4));
            i += 4;
        } else if data[i..].starts_with(&[0, 0, 1]) {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .filter_map(|(idx, &(start, _))| {
            let end = match starts.get(idx + 1) {
                Some(&(next_start, sc_len)) => next_start - sc_len,
                None => data.len(),
            };
            (start < end).then(|| data[start..end].to_vec())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    /// Yields the given NAL units, one per frame.
    struct NalList {
        nals: Vec<Vec<u8>>,
        next: usize,
    }

    impl FrameSource for NalList {
        fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>> {
            let Some(nal) = self.nals.get(self.next) else {
                return Ok(None);
            };
            self.next += 1;
            buf[..nal.len()].copy_from_slice(nal);
            Ok(Some(FrameInfo {
                frame_size: nal.len(),
                num_truncated_bytes: 0,
                presentation_time: UNIX_EPOCH + Duration::from_secs(10),
                duration: Duration::from_millis(40),
                completes_access_unit: true,
            }))
        }

        fn max_frame_size(&self) -> usize {
            self.nals.iter().map(Vec::len).max().unwrap_or(0)
        }
    }

    fn drain(frag: &mut H264Fragmenter<NalList>) -> Vec<(Vec<u8>, FrameInfo)> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 2000];
        while let Some(info) = frag.next_frame(&mut buf).unwrap() {
            out.push((buf[..info.frame_size].to_vec(), info));
        }
        out
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let nals = extract_nal_units(&[0, 0, 0, 1, 0x65, 0xAA, 0xBB]);
        assert_eq!(nals, vec![vec![0x65, 0xAA, 0xBB]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(extract_nal_units(&[]).is_empty());
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Fragmentation ---

    #[test]
    fn small_nal_passes_through() {
        let nal = vec![0x65, 0xAA, 0xBB, 0xCC];
        let mut frag = H264Fragmenter::new(
            NalList {
                nals: vec![nal.clone()],
                next: 0,
            },
            1444,
        );
        let out = drain(&mut frag);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, nal);
        assert!(out[0].1.completes_access_unit);
        assert_eq!(out[0].1.duration, Duration::from_millis(40));
    }

    #[test]
    fn large_nal_reassembles_byte_for_byte() {
        let max = 100;
        let mut nal = vec![0x65];
        nal.extend((0..1000u32).map(|i| (i % 251) as u8));
        let mut frag = H264Fragmenter::new(
            NalList {
                nals: vec![nal.clone()],
                next: 0,
            },
            max,
        );
        let out = drain(&mut frag);
        assert!(out.len() > 1);

        let starts = out.iter().filter(|(f, _)| f[1] & FU_START != 0).count();
        let ends = out.iter().filter(|(f, _)| f[1] & FU_END != 0).count();
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
        assert!(out[0].0[1] & FU_START != 0);
        assert!(out.last().unwrap().0[1] & FU_END != 0);

        let mut rebuilt = vec![(out[0].0[0] & 0xE0) | (out[0].0[1] & 0x1F)];
        for (fragment, info) in &out {
            assert!(fragment.len() <= max);
            assert_eq!(fragment[0] & 0x1F, NAL_TYPE_FU_A);
            assert_eq!(fragment[0] & 0x60, 0x60);
            rebuilt.extend_from_slice(&fragment[2..]);
            assert_eq!(info.presentation_time, UNIX_EPOCH + Duration::from_secs(10));
        }
        assert_eq!(rebuilt, nal);

        let (last, head) = out.split_last().unwrap();
        assert!(head.iter().all(|(_, i)| i.duration.is_zero() && !i.completes_access_unit));
        assert_eq!(last.1.duration, Duration::from_millis(40));
        assert!(last.1.completes_access_unit);
    }

    #[test]
    fn nal_exactly_max_size_is_not_fragmented() {
        let nal = vec![0x41; 50];
        let mut frag = H264Fragmenter::new(
            NalList {
                nals: vec![nal.clone(), vec![0x41, 1]],
                next: 0,
            },
            50,
        );
        let out = drain(&mut frag);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, nal);
    }

    // --- Depacketization ---

    #[test]
    fn depacketizer_rebuilds_fu_a_start() {
        let mut d = H264Depacketizer::new(96);
        let mut start = vec![0x7C, 0x85, 1, 2, 3];
        let h = d.process_special_header(&mut start, false).unwrap();
        assert_eq!(h.size, 1);
        assert!(h.begins_frame && !h.completes_frame);
        assert_eq!(start[1], 0x65);

        let mut end = vec![0x7C, 0x45, 4, 5];
        let h = d.process_special_header(&mut end, true).unwrap();
        assert_eq!(h.size, 2);
        assert!(!h.begins_frame && h.completes_frame);
    }

    #[test]
    fn depacketizer_splits_stap_a() {
        let mut d = H264Depacketizer::new(96);
        let mut pkt = vec![0x18, 0, 2, 0x67, 0x42, 0, 3, 0x68, 0xCE, 0x38];
        let h = d.process_special_header(&mut pkt, true).unwrap();
        assert_eq!(h.size, 1);
        let rest = &pkt[1..];
        assert_eq!(d.next_enclosed_frame(rest), (2, 2));
        assert_eq!(d.next_enclosed_frame(&rest[4..]), (2, 3));
    }

    #[test]
    fn depacketizer_rejects_truncated_fu() {
        let mut d = H264Depacketizer::new(96);
        assert!(d.process_special_header(&mut [0x7C], false).is_none());
        assert!(d.process_special_header(&mut [], false).is_none());
    }

    // --- Payload format ---

    #[test]
    fn fmtp_after_capture() {
        let mut p = H264Packetizer::new(96);
        let observer = p.clone();
        assert_eq!(observer.fmtp_line(), "a=fmtp:96 packetization-mode=1");

        let info = FrameInfo {
            frame_size: 4,
            num_truncated_bytes: 0,
            presentation_time: UNIX_EPOCH,
            duration: Duration::ZERO,
            completes_access_unit: false,
        };
        for nal in [&[0x67u8, 0x42, 0x00, 0x1e][..], &[0x68, 0xce, 0x38, 0x80]] {
            let marker = p.packed_frame(&PackedFrame {
                data: nal,
                info: &info,
                fragmentation_offset: 0,
                num_remaining_bytes: 0,
                index_in_packet: 0,
            });
            assert!(!marker);
        }
        let fmtp = observer.fmtp_line();
        assert!(fmtp.contains("profile-level-id=42001E"), "{fmtp}");
        assert!(fmtp.contains("sprop-parameter-sets=Z0IAHg==,aM44gA=="), "{fmtp}");
        assert!(observer.sdp_attributes()[0].starts_with("a=rtpmap:96 H264/90000"));
    }

    #[test]
    fn annex_b_access_units() {
        let mut data = Vec::new();
        for nal in [
            &[0x67u8, 0x42, 0x00, 0x1e][..],
            &[0x68, 0xce],
            &[0x65, 0x88, 0x01], // first slice of picture 0
            &[0x65, 0x08, 0x02], // continuation slice
            &[0x41, 0x9a, 0x03], // picture 1
        ] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nal);
        }
        let start = UNIX_EPOCH + Duration::from_secs(1);
        let mut src = AnnexBSource::new(&data, 25.0).with_start_time(start);
        let mut buf = [0u8; 16];
        let mut infos = Vec::new();
        while let Some(info) = src.next_frame(&mut buf).unwrap() {
            infos.push(info);
        }
        let ends: Vec<bool> = infos.iter().map(|i| i.completes_access_unit).collect();
        assert_eq!(ends, vec![false, false, false, true, true]);
        assert_eq!(infos[3].presentation_time, start);
        assert_eq!(infos[3].duration, Duration::from_millis(40));
        assert_eq!(infos[4].presentation_time, start + Duration::from_millis(40));
    }
}
