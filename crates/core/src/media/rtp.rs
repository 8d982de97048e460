use std::ops::Range;

use crate::error::RtpHeaderErrorKind;

/// Length of the fixed RTP header in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// The marker bit within the first 32-bit header word.
pub const MARKER_BIT: u32 = 0x0080_0000;

/// RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                  CSRC list (CC x 32 bits)                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The sender writes headers word by word into its out-buffer (see
/// [`header_word`]); this struct is the receive-side view produced by
/// [`parse`](Self::parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
}

impl RtpHeader {
    /// Validate an RTP packet and locate its payload.
    ///
    /// Skips the CSRC list and any header extension, and strips padding
    /// declared by the P bit. Returns the header fields and the byte range of
    /// the payload within `packet`.
    pub fn parse(packet: &[u8]) -> Result<(Self, Range<usize>), RtpHeaderErrorKind> {
        if packet.len() < RTP_HEADER_LEN {
            return Err(RtpHeaderErrorKind::TooShort);
        }
        let word = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        if word & 0xC000_0000 != 0x8000_0000 {
            return Err(RtpHeaderErrorKind::BadVersion);
        }
        let header = RtpHeader {
            marker: word & MARKER_BIT != 0,
            payload_type: ((word >> 16) & 0x7F) as u8,
            sequence_number: word as u16,
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        };

        let mut start = RTP_HEADER_LEN;
        let mut end = packet.len();

        let csrc_count = ((word >> 24) & 0x0F) as usize;
        if end - start < csrc_count * 4 {
            return Err(RtpHeaderErrorKind::TruncatedCsrcList);
        }
        start += csrc_count * 4;

        if word & 0x1000_0000 != 0 {
            if end - start < 4 {
                return Err(RtpHeaderErrorKind::TruncatedExtension);
            }
            let ext_words = u16::from_be_bytes([packet[start + 2], packet[start + 3]]);
            start += 4;
            let ext_len = usize::from(ext_words) * 4;
            if end - start < ext_len {
                return Err(RtpHeaderErrorKind::TruncatedExtension);
            }
            start += ext_len;
        }

        if word & 0x2000_0000 != 0 {
            if end == start {
                return Err(RtpHeaderErrorKind::InvalidPadding);
            }
            let padding = usize::from(packet[end - 1]);
            if padding == 0 || padding > end - start {
                return Err(RtpHeaderErrorKind::InvalidPadding);
            }
            end -= padding;
        }

        Ok((header, start..end))
    }

    /// Serialize as a plain 12-byte header (V=2, no padding/extension/CSRCs).
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut first = header_word(self.payload_type, self.sequence_number);
        if self.marker {
            first |= MARKER_BIT;
        }
        let mut buf = [0u8; RTP_HEADER_LEN];
        buf[0..4].copy_from_slice(&first.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }
}

/// First 32-bit word of an outgoing RTP header: version 2, no padding, no
/// extension, no CSRCs, marker clear.
pub fn header_word(payload_type: u8, sequence_number: u16) -> u32 {
    0x8000_0000 | (u32::from(payload_type & 0x7F) << 16) | u32::from(sequence_number)
}

/// "Less than" on 16-bit sequence numbers, modulo wraparound.
///
/// `a` precedes `b` when `b` is less than half the sequence space ahead of it.
/// Numbers exactly half the space apart are ordered numerically, which keeps
/// the relation asymmetric for every pair of distinct values.
pub fn seq_num_lt(a: u16, b: u16) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && (diff < 0x8000 || (diff == 0x8000 && a < b))
}
