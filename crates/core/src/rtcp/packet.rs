//! RTCP wire format (RFC 3550 §6.4 - §6.6).
//!
//! Every RTCP packet starts with a 4-byte common header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  RC/SC  |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `length` counts 32-bit words minus one. Several packets are stacked into
//! one compound datagram; [`CompoundIter`] walks them.

use crate::error::{Result, RtpError};
use crate::time::NtpTimestamp;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;

const SDES_END: u8 = 0;
const SDES_CNAME: u8 = 1;

const HEADER_LEN: usize = 4;
const SENDER_INFO_LEN: usize = 20;

/// Largest RC/SC value the 5-bit count field can carry.
pub const MAX_REPORT_BLOCKS: usize = 31;

/// One 24-byte reception report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    /// Source this block reports on.
    pub ssrc: u32,
    /// Fraction lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost; signed 24-bit on the wire.
    pub cumulative_lost: i32,
    pub highest_seq: u32,
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp.
    pub last_sr: u32,
    /// Delay since that SR, 1/65536 s.
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    pub const LEN: usize = 24;

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        let lost = (self.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF) as u32) & 0x00FF_FFFF;
        out.extend_from_slice(&((u32::from(self.fraction_lost) << 24) | lost).to_be_bytes());
        out.extend_from_slice(&self.highest_seq.to_be_bytes());
        out.extend_from_slice(&self.jitter.to_be_bytes());
        out.extend_from_slice(&self.last_sr.to_be_bytes());
        out.extend_from_slice(&self.delay_since_last_sr.to_be_bytes());
    }

    fn parse(b: &[u8]) -> Self {
        let loss = be32(b, 4);
        // Sign-extend the 24-bit cumulative count.
        let cumulative_lost = ((loss << 8) as i32) >> 8;
        Self {
            ssrc: be32(b, 0),
            fraction_lost: (loss >> 24) as u8,
            cumulative_lost,
            highest_seq: be32(b, 8),
            jitter: be32(b, 12),
            last_sr: be32(b, 16),
            delay_since_last_sr: be32(b, 20),
        }
    }
}

/// Sender information section of an SR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub info: SenderInfo,
    pub reports: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

/// One SDES chunk. Only CNAME is interpreted; other items are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

/// A decoded RTCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Vec<SdesChunk>),
    Goodbye(Goodbye),
    /// APP or a type this engine does not interpret (feedback, XR, ...).
    Other { packet_type: u8 },
}

impl RtcpPacket {
    /// SSRC of the packet's sender, where the packet names one.
    pub fn sender_ssrc(&self) -> Option<u32> {
        match self {
            RtcpPacket::SenderReport(sr) => Some(sr.ssrc),
            RtcpPacket::ReceiverReport(rr) => Some(rr.ssrc),
            RtcpPacket::SourceDescription(chunks) => chunks.first().map(|c| c.ssrc),
            RtcpPacket::Goodbye(bye) => bye.sources.first().copied(),
            RtcpPacket::Other { .. } => None,
        }
    }

    /// Decode one packet given its header fields and body (padding removed).
    fn decode(count: usize, packet_type: u8, body: &[u8]) -> Result<Self> {
        match packet_type {
            PT_SR => {
                need(body, 4 + SENDER_INFO_LEN + count * ReportBlock::LEN, "SR")?;
                let info = SenderInfo {
                    ntp_timestamp: NtpTimestamp::from_words(be32(body, 4), be32(body, 8)),
                    rtp_timestamp: be32(body, 12),
                    packet_count: be32(body, 16),
                    octet_count: be32(body, 20),
                };
                Ok(RtcpPacket::SenderReport(SenderReport {
                    ssrc: be32(body, 0),
                    info,
                    reports: report_blocks(&body[4 + SENDER_INFO_LEN..], count),
                }))
            }
            PT_RR => {
                need(body, 4 + count * ReportBlock::LEN, "RR")?;
                Ok(RtcpPacket::ReceiverReport(ReceiverReport {
                    ssrc: be32(body, 0),
                    reports: report_blocks(&body[4..], count),
                }))
            }
            PT_SDES => parse_sdes(count, body).map(RtcpPacket::SourceDescription),
            PT_BYE => {
                need(body, count * 4, "BYE")?;
                let sources = (0..count).map(|i| be32(body, i * 4)).collect();
                let rest = &body[count * 4..];
                let reason = match rest.first() {
                    Some(&len) if rest.len() > usize::from(len) => Some(
                        String::from_utf8_lossy(&rest[1..1 + usize::from(len)]).into_owned(),
                    ),
                    Some(_) => return Err(malformed("BYE reason runs past packet end")),
                    None => None,
                };
                Ok(RtcpPacket::Goodbye(Goodbye { sources, reason }))
            }
            other => Ok(RtcpPacket::Other { packet_type: other }),
        }
    }
}

fn parse_sdes(count: usize, body: &[u8]) -> Result<Vec<SdesChunk>> {
    let mut chunks = Vec::with_capacity(count);
    let mut pos = 0;
    for _ in 0..count {
        need(body, pos + 4, "SDES chunk")?;
        let ssrc = be32(body, pos);
        pos += 4;
        let mut cname = None;
        loop {
            let Some(&item) = body.get(pos) else {
                return Err(malformed("SDES chunk missing END item"));
            };
            if item == SDES_END {
                pos += 1;
                break;
            }
            need(body, pos + 2, "SDES item")?;
            let len = usize::from(body[pos + 1]);
            need(body, pos + 2 + len, "SDES item")?;
            if item == SDES_CNAME {
                cname = Some(String::from_utf8_lossy(&body[pos + 2..pos + 2 + len]).into_owned());
            }
            pos += 2 + len;
        }
        // Chunks end on a 32-bit boundary.
        pos = (pos + 3) & !3;
        chunks.push(SdesChunk { ssrc, cname });
    }
    Ok(chunks)
}

/// Iterator over the packets of a compound RTCP datagram.
///
/// A sub-packet whose body is inconsistent with its header yields an error
/// and iteration moves on to the next one. A bad common header (version,
/// length) yields an error and ends iteration, since the following packet
/// boundary is unknown.
pub struct CompoundIter<'a> {
    data: &'a [u8],
    done: bool,
}

/// Walk the packets of a compound RTCP datagram.
pub fn parse_compound(data: &[u8]) -> CompoundIter<'_> {
    CompoundIter { data, done: false }
}

impl Iterator for CompoundIter<'_> {
    type Item = Result<RtcpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.data.is_empty() {
            return None;
        }
        let data = self.data;
        if data.len() < HEADER_LEN {
            self.done = true;
            return Some(Err(malformed("truncated common header")));
        }
        if data[0] >> 6 != 2 {
            self.done = true;
            return Some(Err(malformed(format!("version {} is not 2", data[0] >> 6))));
        }
        let len = (usize::from(u16::from_be_bytes([data[2], data[3]])) + 1) * 4;
        if len > data.len() {
            self.done = true;
            return Some(Err(malformed(format!(
                "length {len} exceeds the {} bytes left",
                data.len()
            ))));
        }
        self.data = &data[len..];

        let padding = if data[0] & 0x20 != 0 {
            usize::from(data[len - 1])
        } else {
            0
        };
        if padding > len - HEADER_LEN {
            return Some(Err(malformed("invalid padding length")));
        }
        let body = &data[HEADER_LEN..len - padding];
        Some(RtcpPacket::decode(usize::from(data[0] & 0x1F), data[1], body))
    }
}

/// Builds a compound RTCP datagram packet by packet.
#[derive(Debug, Default)]
pub struct CompoundBuilder {
    buf: Vec<u8>,
}

impl CompoundBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Append an SR. Blocks beyond the count field's capacity are dropped.
    pub fn sender_report(mut self, ssrc: u32, info: &SenderInfo, reports: &[ReportBlock]) -> Self {
        let reports = &reports[..reports.len().min(MAX_REPORT_BLOCKS)];
        let start = self.begin(reports.len() as u8, PT_SR);
        self.push32(ssrc);
        self.push32(info.ntp_timestamp.msw());
        self.push32(info.ntp_timestamp.lsw());
        self.push32(info.rtp_timestamp);
        self.push32(info.packet_count);
        self.push32(info.octet_count);
        for block in reports {
            block.write(&mut self.buf);
        }
        self.end(start);
        self
    }

    pub fn receiver_report(mut self, ssrc: u32, reports: &[ReportBlock]) -> Self {
        let reports = &reports[..reports.len().min(MAX_REPORT_BLOCKS)];
        let start = self.begin(reports.len() as u8, PT_RR);
        self.push32(ssrc);
        for block in reports {
            block.write(&mut self.buf);
        }
        self.end(start);
        self
    }

    /// Append an SDES packet with a single CNAME chunk.
    pub fn sdes_cname(mut self, ssrc: u32, cname: &str) -> Self {
        let cname = truncate_to_byte(cname);
        let start = self.begin(1, PT_SDES);
        self.push32(ssrc);
        self.buf.push(SDES_CNAME);
        self.buf.push(cname.len() as u8);
        self.buf.extend_from_slice(cname);
        // END item, then zero-fill to the word boundary.
        self.buf.push(SDES_END);
        self.pad_to_word();
        self.end(start);
        self
    }

    pub fn bye(mut self, ssrc: u32, reason: Option<&str>) -> Self {
        let start = self.begin(1, PT_BYE);
        self.push32(ssrc);
        if let Some(reason) = reason {
            let reason = truncate_to_byte(reason);
            self.buf.push(reason.len() as u8);
            self.buf.extend_from_slice(reason);
            self.pad_to_word();
        }
        self.end(start);
        self
    }

    fn begin(&mut self, count: u8, packet_type: u8) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&[0x80 | (count & 0x1F), packet_type, 0, 0]);
        start
    }

    fn end(&mut self, start: usize) {
        let words = ((self.buf.len() - start) / 4 - 1) as u16;
        self.buf[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
    }

    fn push32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn pad_to_word(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }
}

fn truncate_to_byte(s: &str) -> &[u8] {
    let bytes = s.as_bytes();
    &bytes[..bytes.len().min(255)]
}

fn report_blocks(b: &[u8], count: usize) -> Vec<ReportBlock> {
    b.chunks_exact(ReportBlock::LEN)
        .take(count)
        .map(ReportBlock::parse)
        .collect()
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn need(body: &[u8], len: usize, what: &str) -> Result<()> {
    if body.len() < len {
        return Err(malformed(format!(
            "{what} needs {len} bytes, packet has {}",
            body.len()
        )));
    }
    Ok(())
}

fn malformed(msg: impl Into<String>) -> RtpError {
    RtpError::MalformedRtcp(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(ssrc: u32) -> ReportBlock {
        ReportBlock {
            ssrc,
            fraction_lost: 64,
            cumulative_lost: -3,
            highest_seq: 0x1_0005,
            jitter: 120,
            last_sr: 0xDEAD_BEEF,
            delay_since_last_sr: 0x0001_8000,
        }
    }

    #[test]
    fn sr_with_sdes_compound() {
        let info = SenderInfo {
            ntp_timestamp: NtpTimestamp::from_words(0xE000_0000, 0x8000_0000),
            rtp_timestamp: 90_000,
            packet_count: 10,
            octet_count: 12_000,
        };
        let bytes = CompoundBuilder::new()
            .sender_report(0x1111, &info, &[block(0x2222)])
            .sdes_cname(0x1111, "cam@host")
            .finish();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(&bytes[..4], &[0x81, PT_SR, 0, 12]);

        let packets: Vec<RtcpPacket> = parse_compound(&bytes).map(|p| p.unwrap()).collect();
        assert_eq!(
            packets,
            vec![
                RtcpPacket::SenderReport(SenderReport {
                    ssrc: 0x1111,
                    info,
                    reports: vec![block(0x2222)],
                }),
                RtcpPacket::SourceDescription(vec![SdesChunk {
                    ssrc: 0x1111,
                    cname: Some("cam@host".into()),
                }]),
            ]
        );
    }

    #[test]
    fn cumulative_loss_is_clamped_and_sign_extended() {
        let mut b = block(1);
        b.cumulative_lost = i32::MAX;
        let bytes = CompoundBuilder::new().receiver_report(9, &[b]).finish();
        let Some(Ok(RtcpPacket::ReceiverReport(rr))) = parse_compound(&bytes).next() else {
            panic!("expected RR");
        };
        assert_eq!(rr.reports[0].cumulative_lost, 0x7F_FFFF);

        b.cumulative_lost = -5;
        let bytes = CompoundBuilder::new().receiver_report(9, &[b]).finish();
        let Some(Ok(RtcpPacket::ReceiverReport(rr))) = parse_compound(&bytes).next() else {
            panic!("expected RR");
        };
        assert_eq!(rr.reports[0].cumulative_lost, -5);
    }

    #[test]
    fn report_blocks_capped_at_count_field() {
        let blocks: Vec<_> = (0..40).map(block).collect();
        let bytes = CompoundBuilder::new().receiver_report(1, &blocks).finish();
        assert_eq!(bytes[0] & 0x1F, 31);
        assert_eq!(bytes.len(), 8 + 31 * ReportBlock::LEN);
    }

    #[test]
    fn bye_with_reason() {
        let bytes = CompoundBuilder::new()
            .receiver_report(7, &[])
            .bye(7, Some("teardown"))
            .finish();
        let packets: Vec<_> = parse_compound(&bytes).map(|p| p.unwrap()).collect();
        assert_eq!(
            packets[1],
            RtcpPacket::Goodbye(Goodbye {
                sources: vec![7],
                reason: Some("teardown".into()),
            })
        );
        assert_eq!(packets[1].sender_ssrc(), Some(7));
    }

    #[test]
    fn bad_length_ends_iteration() {
        let mut bytes = CompoundBuilder::new().receiver_report(7, &[]).finish();
        bytes.extend_from_slice(&[0x80, PT_RR, 0, 40, 0, 0, 0, 1]);
        let mut it = parse_compound(&bytes);
        assert!(matches!(it.next(), Some(Ok(RtcpPacket::ReceiverReport(_)))));
        assert!(matches!(it.next(), Some(Err(RtpError::MalformedRtcp(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn bad_body_skips_only_that_packet() {
        // RR claiming one block but carrying none, followed by a valid BYE.
        let mut bytes = vec![0x81, PT_RR, 0, 1, 0, 0, 0, 7];
        bytes.extend(CompoundBuilder::new().bye(7, None).finish());
        let results: Vec<_> = parse_compound(&bytes).collect();
        assert!(results[0].is_err());
        assert!(matches!(results[1], Ok(RtcpPacket::Goodbye(_))));
    }

    #[test]
    fn wrong_version_rejected() {
        let bytes = [0x40, PT_RR, 0, 1, 0, 0, 0, 7];
        assert!(parse_compound(&bytes).next().unwrap().is_err());
    }

    #[test]
    fn app_packets_pass_through() {
        let bytes = [0x80, PT_APP, 0, 2, 0, 0, 0, 1, b'n', b'a', b'm', b'e'];
        assert_eq!(
            parse_compound(&bytes).next().unwrap().unwrap(),
            RtcpPacket::Other { packet_type: PT_APP }
        );
    }
}
