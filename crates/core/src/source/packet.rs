use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::media::Depacketizer;
use crate::transport::PacketReader;

/// Capacity of one receive buffer: larger than any datagram we expect.
pub const MAX_PACKET_SIZE: usize = 20000;

/// One frame copied out of a packet by [`BufferedPacket::use_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChunk {
    pub bytes_used: usize,
    pub bytes_truncated: usize,
    pub seq_no: u16,
    pub rtp_timestamp: u32,
    pub presentation_time: SystemTime,
    pub has_been_synced_using_rtcp: bool,
    pub marker: bool,
}

/// A received datagram plus the cursor state used while consuming it.
///
/// `head..tail` is the unconsumed data. Parsing peels headers off the front
/// with [`skip`](Self::skip) and padding off the back with
/// [`remove_padding`](Self::remove_padding).
#[derive(Debug)]
pub struct BufferedPacket {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    use_count: u32,
    is_first_packet: bool,
    seq_no: u16,
    rtp_timestamp: u32,
    marker: bool,
    presentation_time: SystemTime,
    has_been_synced_using_rtcp: bool,
    time_received: Instant,
}

impl Default for BufferedPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedPacket {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
            use_count: 0,
            is_first_packet: false,
            seq_no: 0,
            rtp_timestamp: 0,
            marker: false,
            presentation_time: UNIX_EPOCH,
            has_been_synced_using_rtcp: false,
            time_received: Instant::now(),
        }
    }

    /// Clear the cursors and flags for reuse from the pool.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.use_count = 0;
        self.is_first_packet = false;
    }

    /// Read one packet from `reader` into the free space after `tail`.
    pub fn fill_in_data<R: PacketReader + ?Sized>(
        &mut self,
        reader: &mut R,
        timeout: Duration,
    ) -> Result<Option<usize>> {
        let received = reader.recv_packet(&mut self.buf[self.tail..], timeout)?;
        if let Some(n) = received {
            self.tail += n;
        }
        Ok(received)
    }

    /// Append `data`, returning `false` when it does not fit.
    pub fn fill_from_slice(&mut self, data: &[u8]) -> bool {
        if data.len() > self.buf.len() - self.tail {
            return false;
        }
        self.buf[self.tail..self.tail + data.len()].copy_from_slice(data);
        self.tail += data.len();
        true
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.tail]
    }

    pub fn data_size(&self) -> usize {
        self.tail - self.head
    }

    pub fn has_usable_data(&self) -> bool {
        self.tail > self.head
    }

    pub fn skip(&mut self, num_bytes: usize) {
        self.head = (self.head + num_bytes).min(self.tail);
    }

    pub fn remove_padding(&mut self, num_bytes: usize) {
        self.tail = self.tail.saturating_sub(num_bytes).max(self.head);
    }

    pub fn assign_misc_params(
        &mut self,
        seq_no: u16,
        rtp_timestamp: u32,
        presentation_time: SystemTime,
        has_been_synced_using_rtcp: bool,
        marker: bool,
        time_received: Instant,
    ) {
        self.seq_no = seq_no;
        self.rtp_timestamp = rtp_timestamp;
        self.presentation_time = presentation_time;
        self.has_been_synced_using_rtcp = has_been_synced_using_rtcp;
        self.marker = marker;
        self.time_received = time_received;
    }

    pub fn seq_no(&self) -> u16 {
        self.seq_no
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn time_received(&self) -> Instant {
        self.time_received
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn is_first_packet(&self) -> bool {
        self.is_first_packet
    }

    pub fn set_is_first_packet(&mut self, first: bool) {
        self.is_first_packet = first;
    }

    /// Copy the next enclosed frame into `to` and advance past it.
    ///
    /// The presentation time advances by the format's per-frame duration so
    /// that the following enclosed frame (if any) gets its own timestamp.
    pub fn use_frame(&mut self, to: &mut [u8], depacketizer: &dyn Depacketizer) -> FrameChunk {
        let (skip, frame_size) = depacketizer.next_enclosed_frame(self.data());
        let start = (self.head + skip).min(self.tail);
        let frame_size = frame_size.min(self.tail - start);
        let bytes_used = frame_size.min(to.len());
        to[..bytes_used].copy_from_slice(&self.buf[start..start + bytes_used]);
        self.head = start + frame_size;
        self.use_count += 1;

        let chunk = FrameChunk {
            bytes_used,
            bytes_truncated: frame_size - bytes_used,
            seq_no: self.seq_no,
            rtp_timestamp: self.rtp_timestamp,
            presentation_time: self.presentation_time,
            has_been_synced_using_rtcp: self.has_been_synced_using_rtcp,
            marker: self.marker,
        };
        self.presentation_time += depacketizer.enclosed_frame_duration();
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Depacketizer;
    use crate::media::simple::SimpleDepacketizer;

    #[test]
    fn cursors() {
        let mut p = BufferedPacket::new();
        assert!(p.fill_from_slice(&[1, 2, 3, 4, 5, 6]));
        p.skip(2);
        p.remove_padding(1);
        assert_eq!(p.data(), &[3, 4, 5]);
        p.skip(10);
        assert!(!p.has_usable_data());
        p.reset();
        assert_eq!(p.data_size(), 0);
        assert!(!p.fill_from_slice(&vec![0; MAX_PACKET_SIZE + 1]));
    }

    #[test]
    fn use_whole_packet_with_truncation() {
        let d = SimpleDepacketizer::new(0, 8000);
        let mut p = BufferedPacket::new();
        p.fill_from_slice(&[9; 10]);
        let mut to = [0u8; 4];
        let chunk = p.use_frame(&mut to, &d);
        assert_eq!(chunk.bytes_used, 4);
        assert_eq!(chunk.bytes_truncated, 6);
        assert_eq!(p.use_count(), 1);
        assert!(!p.has_usable_data());
    }

    #[test]
    fn use_stap_a_units_one_at_a_time() {
        let mut d = H264Depacketizer::new(96);
        let mut p = BufferedPacket::new();
        p.fill_from_slice(&[0x18, 0, 2, 0x67, 0x42, 0, 3, 0x68, 0xCE, 0x38]);
        let header = {
            let data = p.data_mut();
            d.process_special_header(data, true).unwrap()
        };
        p.skip(header.size);

        let mut to = [0u8; 16];
        let first = p.use_frame(&mut to, &d);
        assert_eq!(&to[..first.bytes_used], &[0x67, 0x42]);
        let second = p.use_frame(&mut to, &d);
        assert_eq!(&to[..second.bytes_used], &[0x68, 0xCE, 0x38]);
        assert!(!p.has_usable_data());
    }
}
