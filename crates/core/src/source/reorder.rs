use std::time::{Duration, Instant};

use super::packet::BufferedPacket;
use crate::media::rtp::seq_num_lt;

/// Default time a packet may wait for a missing predecessor.
pub const DEFAULT_THRESHOLD: Duration = Duration::from_millis(100);

/// Counters kept while reordering, for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStats {
    /// Packets older than the next expected sequence number.
    pub stale: u64,
    /// Packets whose sequence number was already queued.
    pub duplicate: u64,
    /// Head packets released after the threshold because a predecessor never came.
    pub force_released: u64,
    /// Packets allocated because the pool was empty.
    pub pool_misses: u64,
}

#[derive(Debug)]
struct Slot {
    packet: BufferedPacket,
    next: Option<usize>,
}

/// Queue of received packets ordered by RTP sequence number.
///
/// Packets live in an arena of slots linked by index in sequence order.
/// The buffer also owns the pool of spare [`BufferedPacket`]s: callers take
/// one with [`get_free_packet`](Self::get_free_packet), fill it, and hand it
/// to [`store_packet`](Self::store_packet); released and rejected packets go
/// back to the pool.
#[derive(Debug)]
pub struct ReorderingPacketBuffer {
    slots: Vec<Option<Slot>>,
    vacant: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    pool: Vec<BufferedPacket>,
    pool_capacity: usize,
    threshold: Duration,
    have_seen_first_packet: bool,
    next_expected_seq_no: u16,
    stats: ReorderStats,
}

impl ReorderingPacketBuffer {
    pub fn new(threshold: Duration, pool_capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            pool: Vec::new(),
            pool_capacity,
            threshold,
            have_seen_first_packet: false,
            next_expected_seq_no: 0,
            stats: ReorderStats::default(),
        }
    }

    pub fn set_threshold(&mut self, threshold: Duration) {
        self.threshold = threshold;
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn next_expected_seq_no(&self) -> u16 {
        self.next_expected_seq_no
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// A clean packet from the pool, or a fresh one when the pool is empty.
    pub fn get_free_packet(&mut self) -> BufferedPacket {
        match self.pool.pop() {
            Some(mut packet) => {
                packet.reset();
                packet
            }
            None => {
                self.stats.pool_misses += 1;
                BufferedPacket::new()
            }
        }
    }

    /// Return a packet to the pool; dropped if the pool is full.
    pub fn free_packet(&mut self, packet: BufferedPacket) {
        if self.pool.len() < self.pool_capacity {
            self.pool.push(packet);
        }
    }

    /// Treat the next stored packet as the start of a new stream (after an
    /// SSRC change).
    pub fn reset_have_seen_first_packet(&mut self) {
        self.have_seen_first_packet = false;
    }

    /// Queue `packet` in sequence order.
    ///
    /// Returns `false`, recycling the packet, when it is older than the next
    /// expected sequence number or duplicates a queued one.
    pub fn store_packet(&mut self, mut packet: BufferedPacket) -> bool {
        let seq = packet.seq_no();
        if !self.have_seen_first_packet {
            self.next_expected_seq_no = seq;
            packet.set_is_first_packet(true);
            self.have_seen_first_packet = true;
        }

        if seq_num_lt(seq, self.next_expected_seq_no) {
            tracing::trace!(seq, expected = self.next_expected_seq_no, "stale packet dropped");
            self.stats.stale += 1;
            self.free_packet(packet);
            return false;
        }

        let Some(tail) = self.tail else {
            let idx = self.alloc(packet);
            self.head = Some(idx);
            self.tail = Some(idx);
            return true;
        };

        let tail_seq = self.slot(tail).packet.seq_no();
        if seq_num_lt(tail_seq, seq) {
            let idx = self.alloc(packet);
            self.slot_mut(tail).next = Some(idx);
            self.tail = Some(idx);
            return true;
        }
        if seq == tail_seq {
            return self.reject_duplicate(packet);
        }

        // Out of order: walk from the head to find the insertion point.
        let mut before: Option<usize> = None;
        let mut after = self.head;
        while let Some(idx) = after {
            let queued = self.slot(idx).packet.seq_no();
            if seq_num_lt(seq, queued) {
                break;
            }
            if seq == queued {
                return self.reject_duplicate(packet);
            }
            before = Some(idx);
            after = self.slot(idx).next;
        }

        let idx = self.alloc(packet);
        self.slot_mut(idx).next = after;
        match before {
            Some(b) => self.slot_mut(b).next = Some(idx),
            None => self.head = Some(idx),
        }
        tracing::trace!(seq, "out-of-order packet queued");
        true
    }

    /// The head packet, if it may be consumed now.
    ///
    /// The head is ready when it carries the expected sequence number, or
    /// when it has waited longer than the threshold; in the latter case the
    /// gap is given up on and the packet is reported as loss-preceded. The
    /// returned flag is `true` when packets were lost before this one (the
    /// first packet of a stream counts as such).
    pub fn get_next_completed_packet(
        &mut self,
        now: Instant,
    ) -> Option<(&mut BufferedPacket, bool)> {
        let head = self.head?;
        let (head_seq, received, is_first) = {
            let p = &self.slot(head).packet;
            (p.seq_no(), p.time_received(), p.is_first_packet())
        };

        if head_seq == self.next_expected_seq_no {
            return Some((&mut self.slot_mut(head).packet, is_first));
        }

        let exceeded = self.threshold.is_zero()
            || now.saturating_duration_since(received) > self.threshold;
        if !exceeded {
            return None;
        }

        tracing::debug!(
            expected = self.next_expected_seq_no,
            seq = head_seq,
            "reorder threshold exceeded, skipping gap"
        );
        self.next_expected_seq_no = head_seq;
        self.stats.force_released += 1;
        Some((&mut self.slot_mut(head).packet, true))
    }

    /// Remove the head packet after it has been consumed.
    pub fn release_used_packet(&mut self) {
        let Some(head) = self.head else {
            return;
        };
        self.next_expected_seq_no = self.next_expected_seq_no.wrapping_add(1);
        let Some(slot) = self.slots[head].take() else {
            return;
        };
        self.vacant.push(head);
        self.head = slot.next;
        if self.head.is_none() {
            self.tail = None;
        }
        self.free_packet(slot.packet);
    }

    fn reject_duplicate(&mut self, packet: BufferedPacket) -> bool {
        tracing::trace!(seq = packet.seq_no(), "duplicate packet dropped");
        self.stats.duplicate += 1;
        self.free_packet(packet);
        false
    }

    fn alloc(&mut self, packet: BufferedPacket) -> usize {
        let slot = Slot { packet, next: None };
        match self.vacant.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    // Linked indices always point at occupied slots.
    fn slot(&self, idx: usize) -> &Slot {
        match &self.slots[idx] {
            Some(slot) => slot,
            None => unreachable!("reorder list links a vacant slot"),
        }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        match &mut self.slots[idx] {
            Some(slot) => slot,
            None => unreachable!("reorder list links a vacant slot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn packet(buf: &mut ReorderingPacketBuffer, seq: u16, at: Instant) -> BufferedPacket {
        let mut p = buf.get_free_packet();
        p.fill_from_slice(&seq.to_be_bytes());
        p.assign_misc_params(seq, 0, UNIX_EPOCH, false, false, at);
        p
    }

    fn drain(buf: &mut ReorderingPacketBuffer, now: Instant) -> Vec<(u16, bool)> {
        let mut out = Vec::new();
        while let Some((p, loss)) = buf.get_next_completed_packet(now) {
            out.push((p.seq_no(), loss));
            buf.release_used_packet();
        }
        out
    }

    #[test]
    fn delivers_in_sequence_order() {
        let now = Instant::now();
        let mut buf = ReorderingPacketBuffer::new(DEFAULT_THRESHOLD, 8);
        let first = packet(&mut buf, 2, now);
        assert!(buf.store_packet(first));
        assert_eq!(drain(&mut buf, now), vec![(2, true)]);
        assert_eq!(buf.next_expected_seq_no(), 3);

        for seq in [5, 3, 4] {
            let p = packet(&mut buf, seq, now);
            assert!(buf.store_packet(p));
        }
        assert_eq!(drain(&mut buf, now), vec![(3, false), (4, false), (5, false)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_stale_and_duplicates() {
        let now = Instant::now();
        let mut buf = ReorderingPacketBuffer::new(DEFAULT_THRESHOLD, 8);
        for seq in [10, 12] {
            let p = packet(&mut buf, seq, now);
            assert!(buf.store_packet(p));
        }
        let dup_tail = packet(&mut buf, 12, now);
        assert!(!buf.store_packet(dup_tail));
        let dup_head = packet(&mut buf, 10, now);
        assert!(!buf.store_packet(dup_head));
        let stale = packet(&mut buf, 9, now);
        assert!(!buf.store_packet(stale));
        assert_eq!(buf.len(), 2);

        let stats = buf.stats();
        assert_eq!(stats.duplicate, 2);
        assert_eq!(stats.stale, 1);
    }

    #[test]
    fn gap_is_skipped_after_threshold() {
        let t0 = Instant::now();
        let mut buf = ReorderingPacketBuffer::new(Duration::from_millis(100), 8);
        let p = packet(&mut buf, 100, t0);
        buf.store_packet(p);
        assert_eq!(drain(&mut buf, t0), vec![(100, true)]);

        let p = packet(&mut buf, 102, t0);
        buf.store_packet(p);
        assert!(buf.get_next_completed_packet(t0 + Duration::from_millis(50)).is_none());

        let late = t0 + Duration::from_millis(101);
        assert_eq!(drain(&mut buf, late), vec![(102, true)]);
        assert_eq!(buf.next_expected_seq_no(), 103);
        assert_eq!(buf.stats().force_released, 1);

        // The missing packet is now stale.
        let p = packet(&mut buf, 101, late);
        assert!(!buf.store_packet(p));
    }

    #[test]
    fn zero_threshold_never_waits() {
        let now = Instant::now();
        let mut buf = ReorderingPacketBuffer::new(Duration::ZERO, 8);
        let p = packet(&mut buf, 1, now);
        buf.store_packet(p);
        buf.release_used_packet();
        let p = packet(&mut buf, 5, now);
        buf.store_packet(p);
        assert_eq!(drain(&mut buf, now), vec![(5, true)]);
    }

    #[test]
    fn ordering_survives_wraparound() {
        let now = Instant::now();
        let mut buf = ReorderingPacketBuffer::new(DEFAULT_THRESHOLD, 8);
        let p = packet(&mut buf, 65534, now);
        buf.store_packet(p);
        for seq in [1, 65535, 0] {
            let p = packet(&mut buf, seq, now);
            assert!(buf.store_packet(p));
        }
        let order: Vec<u16> = drain(&mut buf, now).into_iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn pool_recycles_and_caps() {
        let now = Instant::now();
        let mut buf = ReorderingPacketBuffer::new(DEFAULT_THRESHOLD, 1);
        for seq in 0..3 {
            let p = packet(&mut buf, seq, now);
            buf.store_packet(p);
        }
        assert_eq!(buf.stats().pool_misses, 3);
        drain(&mut buf, now);
        let reused = buf.get_free_packet();
        assert_eq!(reused.data_size(), 0);
        assert_eq!(buf.stats().pool_misses, 3);
        let _fresh = buf.get_free_packet();
        assert_eq!(buf.stats().pool_misses, 4);
    }

    #[test]
    fn ssrc_change_restarts_expectation() {
        let now = Instant::now();
        let mut buf = ReorderingPacketBuffer::new(DEFAULT_THRESHOLD, 8);
        let p = packet(&mut buf, 500, now);
        buf.store_packet(p);
        drain(&mut buf, now);

        buf.reset_have_seen_first_packet();
        let p = packet(&mut buf, 7, now);
        assert!(buf.store_packet(p));
        assert_eq!(drain(&mut buf, now), vec![(7, true)]);
    }
}
