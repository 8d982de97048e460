use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Staging buffer for outgoing packets.
///
/// The buffer holds the packet being built, starting at `packet_start`, plus
/// any "overflow": the tail of a frame that did not fit in the previous
/// packet and must open the next one. Positions passed to [`insert`],
/// [`extract`] and [`set_overflow_data`] are relative to the packet start.
///
/// ```text
/// 0           packet_start        +cur_offset               limit
/// |  (sent)   |  current packet   |  free space ...         |
///                                    ^ overflow lives here until reused
/// ```
///
/// [`insert`]: Self::insert
/// [`extract`]: Self::extract
/// [`set_overflow_data`]: Self::set_overflow_data
#[derive(Debug)]
pub struct OutPacketBuffer {
    buf: Vec<u8>,
    packet_start: usize,
    cur_offset: usize,
    preferred: usize,
    max: usize,
    overflow_data_offset: usize,
    overflow_data_size: usize,
    overflow_presentation_time: SystemTime,
    overflow_duration: Duration,
}

impl OutPacketBuffer {
    /// The capacity is `max_buffer_size` rounded up to a whole number of
    /// `max_packet_size` packets.
    pub fn new(preferred_packet_size: usize, max_packet_size: usize, max_buffer_size: usize) -> Self {
        let max = max_packet_size.max(1);
        let num_packets = max_buffer_size.div_ceil(max).max(1);
        Self {
            buf: vec![0; num_packets * max],
            packet_start: 0,
            cur_offset: 0,
            preferred: preferred_packet_size.min(max),
            max,
            overflow_data_offset: 0,
            overflow_data_size: 0,
            overflow_presentation_time: UNIX_EPOCH,
            overflow_duration: Duration::ZERO,
        }
    }

    pub fn limit(&self) -> usize {
        self.buf.len()
    }

    pub fn max_packet_size(&self) -> usize {
        self.max
    }

    pub fn cur_offset(&self) -> usize {
        self.cur_offset
    }

    pub fn cur_packet_size(&self) -> usize {
        self.cur_offset
    }

    /// The packet built so far.
    pub fn packet(&self) -> &[u8] {
        &self.buf[self.packet_start..self.packet_start + self.cur_offset]
    }

    /// Writable space from the current position to the end of the buffer.
    pub fn cur_slice(&mut self) -> &mut [u8] {
        let pos = self.packet_start + self.cur_offset;
        &mut self.buf[pos..]
    }

    pub fn total_bytes_available(&self) -> usize {
        self.buf.len() - (self.packet_start + self.cur_offset)
    }

    pub fn increment(&mut self, num_bytes: usize) {
        self.cur_offset += num_bytes;
    }

    /// Append `data`, truncating to the space left in the buffer.
    pub fn enqueue(&mut self, data: &[u8]) {
        let n = self.clamp_to_available(data.len());
        let pos = self.packet_start + self.cur_offset;
        self.buf[pos..pos + n].copy_from_slice(&data[..n]);
        self.cur_offset += n;
    }

    pub fn enqueue_word(&mut self, word: u32) {
        self.enqueue(&word.to_be_bytes());
    }

    /// Overwrite bytes at `to_position`, extending the packet if they reach
    /// past its current end.
    pub fn insert(&mut self, data: &[u8], to_position: usize) {
        let real = self.packet_start + to_position;
        if real >= self.buf.len() {
            tracing::warn!(position = to_position, "out-buffer insert past end, ignored");
            return;
        }
        let n = data.len().min(self.buf.len() - real);
        if n < data.len() {
            tracing::warn!(
                requested = data.len(),
                written = n,
                "out-buffer insert truncated"
            );
        }
        self.buf[real..real + n].copy_from_slice(&data[..n]);
        if to_position + n > self.cur_offset {
            self.cur_offset = to_position + n;
        }
    }

    pub fn insert_word(&mut self, word: u32, to_position: usize) {
        self.insert(&word.to_be_bytes(), to_position);
    }

    /// Copy bytes starting at `from_position` into `to`. Bytes past the end
    /// of the buffer are left untouched in `to`.
    pub fn extract(&self, to: &mut [u8], from_position: usize) {
        let real = self.packet_start + from_position;
        if real >= self.buf.len() {
            return;
        }
        let n = to.len().min(self.buf.len() - real);
        to[..n].copy_from_slice(&self.buf[real..real + n]);
    }

    pub fn extract_word(&self, from_position: usize) -> u32 {
        let mut word = [0u8; 4];
        self.extract(&mut word, from_position);
        u32::from_be_bytes(word)
    }

    /// Reserve `num_bytes` (left as-is, typically zero) at the current position.
    pub fn skip_bytes(&mut self, num_bytes: usize) {
        let n = num_bytes.min(self.total_bytes_available());
        self.cur_offset += n;
    }

    /// Give back the last `num_bytes` reserved or written.
    pub fn rewind(&mut self, num_bytes: usize) {
        self.cur_offset = self.cur_offset.saturating_sub(num_bytes);
    }

    pub fn is_preferred_size(&self) -> bool {
        self.cur_offset >= self.preferred
    }

    pub fn would_overflow(&self, num_bytes: usize) -> bool {
        self.cur_offset + num_bytes > self.max
    }

    pub fn num_overflow_bytes(&self, num_bytes: usize) -> usize {
        (self.cur_offset + num_bytes).saturating_sub(self.max)
    }

    pub fn is_too_big_for_a_packet(&self, num_bytes: usize) -> bool {
        num_bytes > self.max
    }

    /// Record that `size` bytes at `offset` belong to the next packet.
    pub fn set_overflow_data(
        &mut self,
        offset: usize,
        size: usize,
        presentation_time: SystemTime,
        duration: Duration,
    ) {
        self.overflow_data_offset = offset;
        self.overflow_data_size = size;
        self.overflow_presentation_time = presentation_time;
        self.overflow_duration = duration;
    }

    pub fn overflow_data_size(&self) -> usize {
        self.overflow_data_size
    }

    pub fn overflow_presentation_time(&self) -> SystemTime {
        self.overflow_presentation_time
    }

    pub fn overflow_duration(&self) -> Duration {
        self.overflow_duration
    }

    pub fn have_overflow_data(&self) -> bool {
        self.overflow_data_size > 0
    }

    /// Move the overflow bytes to the current position, without advancing it.
    ///
    /// The caller accounts for the bytes as a freshly delivered frame. Nothing
    /// is copied when the overflow already sits at the current position.
    pub fn use_overflow_data(&mut self) {
        let from = self.packet_start + self.overflow_data_offset;
        let to = self.packet_start + self.cur_offset;
        let n = self.clamp_to_available(self.overflow_data_size);
        if from != to {
            self.buf.copy_within(from..from + n, to);
        }
        self.reset_overflow_data();
    }

    /// Slide the packet start forward so pending overflow stays in place.
    pub fn adjust_packet_start(&mut self, num_bytes: usize) {
        self.packet_start += num_bytes;
        if self.overflow_data_offset >= num_bytes {
            self.overflow_data_offset -= num_bytes;
        } else {
            self.overflow_data_offset = 0;
            self.overflow_data_size = 0;
        }
    }

    /// Return the packet start to the beginning of the buffer.
    pub fn reset_packet_start(&mut self) {
        if self.overflow_data_size > 0 {
            self.overflow_data_offset += self.packet_start;
        }
        self.packet_start = 0;
    }

    pub fn reset_offset(&mut self) {
        self.cur_offset = 0;
    }

    pub fn reset_overflow_data(&mut self) {
        self.overflow_data_offset = 0;
        self.overflow_data_size = 0;
    }

    fn clamp_to_available(&self, requested: usize) -> usize {
        let available = self.total_bytes_available();
        if requested > available {
            tracing::warn!(
                requested,
                available,
                "out-buffer too small, data truncated"
            );
            available
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_rounds_up_to_whole_packets() {
        let b = OutPacketBuffer::new(1000, 1456, 60000);
        assert_eq!(b.limit(), 42 * 1456);
        assert_eq!(b.total_bytes_available(), 42 * 1456);
    }

    #[test]
    fn word_round_trip() {
        let mut b = OutPacketBuffer::new(100, 200, 1000);
        b.enqueue_word(0x8060_1234);
        assert_eq!(b.extract_word(0), 0x8060_1234);
        b.insert_word(0xDEAD_BEEF, 0);
        assert_eq!(b.extract_word(0), 0xDEAD_BEEF);
        assert_eq!(b.cur_packet_size(), 4);
    }

    #[test]
    fn insert_past_end_extends_packet() {
        let mut b = OutPacketBuffer::new(100, 200, 1000);
        b.enqueue(&[1, 2]);
        b.insert(&[9, 9, 9], 4);
        assert_eq!(b.packet(), &[1, 2, 0, 0, 9, 9, 9]);
    }

    #[test]
    fn enqueue_truncates_at_limit() {
        let mut b = OutPacketBuffer::new(4, 8, 8);
        b.enqueue(&[7; 20]);
        assert_eq!(b.cur_packet_size(), 8);
        assert_eq!(b.total_bytes_available(), 0);
    }

    #[test]
    fn size_predicates() {
        let mut b = OutPacketBuffer::new(10, 20, 100);
        b.skip_bytes(12);
        assert!(b.is_preferred_size());
        assert!(!b.would_overflow(8));
        assert!(b.would_overflow(9));
        assert_eq!(b.num_overflow_bytes(15), 7);
        assert!(b.is_too_big_for_a_packet(21));
    }

    #[test]
    fn overflow_moves_to_next_packet_start() {
        let mut b = OutPacketBuffer::new(10, 10, 100);
        b.enqueue(&[0xAA; 4]); // header
        let frame: Vec<u8> = (0..12).collect();
        b.cur_slice()[..frame.len()].copy_from_slice(&frame);
        let fits = 6;
        b.set_overflow_data(4 + fits, frame.len() - fits, UNIX_EPOCH, Duration::from_millis(5));
        b.increment(fits);
        assert_eq!(b.packet().len(), 10);

        b.reset_packet_start();
        b.reset_offset();
        b.enqueue(&[0xBB; 4]);
        assert!(b.have_overflow_data());
        let n = b.overflow_data_size();
        b.use_overflow_data();
        b.increment(n);
        assert!(!b.have_overflow_data());
        assert_eq!(&b.packet()[4..], &frame[fits..]);
    }

    #[test]
    fn adjusted_packet_start_keeps_overflow_in_place() {
        let mut b = OutPacketBuffer::new(10, 10, 100);
        b.enqueue(&[0xAA; 4]);
        let frame: Vec<u8> = (100..115).collect();
        b.cur_slice()[..frame.len()].copy_from_slice(&frame);
        b.set_overflow_data(10, 9, UNIX_EPOCH, Duration::ZERO);
        b.increment(6);

        // Next packet's header ends exactly where the overflow begins.
        b.adjust_packet_start(6);
        b.reset_offset();
        b.enqueue(&[0xBB; 4]);
        b.use_overflow_data();
        b.increment(9);
        assert_eq!(b.packet()[..4], [0xBB; 4]);
        assert_eq!(&b.packet()[4..], &frame[6..]);
    }
}
