//! Per-source reception statistics (RFC 3550 §6.4.1, Appendix A.3 and A.8).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::media::rtp::seq_num_lt;
use crate::time::{NtpTimestamp, offset_by_ticks, rtp_units_since_epoch, to_ntp_short};

/// Running statistics for one synchronization source.
///
/// Extended sequence numbers carry the 16-bit wrap count in their high half
/// and start at `0x10000 | first_seq`, so a late packet from just before the
/// first one can still lower the base without underflowing.
#[derive(Debug, Clone)]
pub struct ReceptionStats {
    ssrc: u32,
    have_seen_initial_seq_no: bool,
    base_ext_seq_no_received: u32,
    highest_ext_seq_no_received: u32,
    last_reset_ext_seq_no_received: u32,
    num_packets_received_since_last_reset: u32,
    tot_num_packets_received: u32,
    tot_bytes_received: u64,

    last_packet_reception_time: Option<SystemTime>,
    min_inter_packet_gap: Duration,
    max_inter_packet_gap: Duration,
    total_inter_packet_gaps: Duration,

    /// `None` until the first packet usable for jitter.
    last_transit: Option<i32>,
    previous_packet_rtp_timestamp: Option<u32>,
    jitter: f64,

    last_received_sr_ntp: Option<NtpTimestamp>,
    last_received_sr_time: Option<SystemTime>,

    sync: Option<(u32, SystemTime)>,
    has_been_synchronized: bool,
}

impl ReceptionStats {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            have_seen_initial_seq_no: false,
            base_ext_seq_no_received: 0,
            highest_ext_seq_no_received: 0,
            last_reset_ext_seq_no_received: 0,
            num_packets_received_since_last_reset: 0,
            tot_num_packets_received: 0,
            tot_bytes_received: 0,
            last_packet_reception_time: None,
            min_inter_packet_gap: Duration::MAX,
            max_inter_packet_gap: Duration::ZERO,
            total_inter_packet_gaps: Duration::ZERO,
            last_transit: None,
            previous_packet_rtp_timestamp: None,
            jitter: 0.0,
            last_received_sr_ntp: None,
            last_received_sr_time: None,
            sync: None,
            has_been_synchronized: false,
        }
    }

    fn init_seq_no(&mut self, initial: u16) {
        self.base_ext_seq_no_received = 0x10000 | u32::from(initial);
        self.highest_ext_seq_no_received = self.base_ext_seq_no_received;
        self.last_reset_ext_seq_no_received = self.base_ext_seq_no_received - 1;
        self.have_seen_initial_seq_no = true;
    }

    /// Account for one received packet and compute its presentation time.
    ///
    /// `arrival` is the wall-clock reception time. Returns the presentation
    /// time and whether it derives from an RTCP sender report.
    pub fn note_incoming_packet(
        &mut self,
        seq_no: u16,
        rtp_timestamp: u32,
        clock_rate: u32,
        use_for_jitter_calculation: bool,
        arrival: SystemTime,
        packet_size: usize,
    ) -> (SystemTime, bool) {
        if !self.have_seen_initial_seq_no {
            self.init_seq_no(seq_no);
        }
        self.num_packets_received_since_last_reset += 1;
        self.tot_num_packets_received += 1;
        self.tot_bytes_received += packet_size as u64;

        let old_seq_no = self.highest_ext_seq_no_received as u16;
        let mut cycle = self.highest_ext_seq_no_received & 0xFFFF_0000;
        let difference = i32::from(seq_no) - i32::from(old_seq_no);
        if seq_num_lt(old_seq_no, seq_no) {
            if difference < 0 {
                cycle = cycle.wrapping_add(0x10000);
            }
            let ext = cycle | u32::from(seq_no);
            if ext > self.highest_ext_seq_no_received {
                self.highest_ext_seq_no_received = ext;
            }
        } else if self.tot_num_packets_received > 1 {
            // Late packet; it may come from the previous cycle.
            if difference >= 0x8000 {
                cycle = cycle.wrapping_sub(0x10000);
            }
            let ext = cycle | u32::from(seq_no);
            if ext < self.base_ext_seq_no_received {
                self.base_ext_seq_no_received = ext;
            }
        }

        if let Some(last) = self.last_packet_reception_time {
            let gap = arrival.duration_since(last).unwrap_or_default();
            self.max_inter_packet_gap = self.max_inter_packet_gap.max(gap);
            self.min_inter_packet_gap = self.min_inter_packet_gap.min(gap);
            self.total_inter_packet_gaps += gap;
        }
        self.last_packet_reception_time = Some(arrival);

        if use_for_jitter_calculation && self.previous_packet_rtp_timestamp != Some(rtp_timestamp) {
            let arrival_units = rtp_units_since_epoch(arrival, clock_rate);
            let transit = arrival_units.wrapping_sub(rtp_timestamp) as i32;
            let last_transit = *self.last_transit.get_or_insert(transit);
            let d = transit.wrapping_sub(last_transit).unsigned_abs();
            self.last_transit = Some(transit);
            self.jitter += (f64::from(d) - self.jitter) / 16.0;
        }

        let (sync_timestamp, sync_time) = *self.sync.get_or_insert((rtp_timestamp, arrival));
        let ticks = rtp_timestamp.wrapping_sub(sync_timestamp) as i32;
        let presentation_time = offset_by_ticks(sync_time, ticks, clock_rate);
        self.sync = Some((rtp_timestamp, presentation_time));
        self.previous_packet_rtp_timestamp = Some(rtp_timestamp);

        (presentation_time, self.has_been_synchronized)
    }

    /// Resynchronize the RTP-to-wallclock mapping from a sender report.
    pub fn note_incoming_sr(&mut self, ntp_msw: u32, ntp_lsw: u32, rtp_timestamp: u32, now: SystemTime) {
        let ntp = NtpTimestamp::from_words(ntp_msw, ntp_lsw);
        self.last_received_sr_ntp = Some(ntp);
        self.last_received_sr_time = Some(now);
        self.sync = Some((rtp_timestamp, ntp.to_system_time()));
        self.has_been_synchronized = true;
    }

    /// Start a new reporting interval.
    pub fn reset(&mut self) {
        self.num_packets_received_since_last_reset = 0;
        self.last_reset_ext_seq_no_received = self.highest_ext_seq_no_received;
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn base_ext_seq_no_received(&self) -> u32 {
        self.base_ext_seq_no_received
    }

    pub fn highest_ext_seq_no_received(&self) -> u32 {
        self.highest_ext_seq_no_received
    }

    pub fn num_packets_received_since_last_reset(&self) -> u32 {
        self.num_packets_received_since_last_reset
    }

    pub fn tot_num_packets_received(&self) -> u32 {
        self.tot_num_packets_received
    }

    pub fn tot_bytes_received(&self) -> u64 {
        self.tot_bytes_received
    }

    pub fn tot_num_packets_expected(&self) -> u32 {
        self.highest_ext_seq_no_received
            .wrapping_sub(self.base_ext_seq_no_received)
            .wrapping_add(1)
    }

    /// Cumulative loss clamped to the signed 24-bit report field.
    pub fn cumulative_lost(&self) -> i32 {
        let lost = i64::from(self.tot_num_packets_expected()) - i64::from(self.tot_num_packets_received);
        lost.clamp(-0x80_0000, 0x7F_FFFF) as i32
    }

    /// Fraction of packets lost since the last reset, in 1/256 units.
    pub fn loss_fraction(&self) -> u8 {
        let expected = self
            .highest_ext_seq_no_received
            .wrapping_sub(self.last_reset_ext_seq_no_received);
        let lost = i64::from(expected) - i64::from(self.num_packets_received_since_last_reset);
        if expected == 0 || lost <= 0 {
            0
        } else {
            ((lost << 8) / i64::from(expected)).min(255) as u8
        }
    }

    /// Interarrival jitter in RTP timestamp units.
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    pub fn jitter_f64(&self) -> f64 {
        self.jitter
    }

    /// Middle 32 bits of the last SR's NTP timestamp, 0 if none.
    pub fn last_sr(&self) -> u32 {
        self.last_received_sr_ntp.map_or(0, NtpTimestamp::middle_bits)
    }

    /// Delay since the last SR in 1/65536 s, 0 if none.
    pub fn delay_since_last_sr(&self, now: SystemTime) -> u32 {
        match self.last_received_sr_time {
            Some(t) if self.last_received_sr_ntp.is_some() => {
                to_ntp_short(now.duration_since(t).unwrap_or_default())
            }
            _ => 0,
        }
    }

    pub fn has_been_synchronized(&self) -> bool {
        self.has_been_synchronized
    }

    pub fn min_inter_packet_gap(&self) -> Option<Duration> {
        (self.min_inter_packet_gap != Duration::MAX).then_some(self.min_inter_packet_gap)
    }

    pub fn max_inter_packet_gap(&self) -> Duration {
        self.max_inter_packet_gap
    }

    pub fn total_inter_packet_gaps(&self) -> Duration {
        self.total_inter_packet_gaps
    }
}

/// Reception statistics for every source heard on a stream.
#[derive(Debug, Default)]
pub struct ReceptionStatsTable {
    table: HashMap<u32, ReceptionStats>,
}

impl ReceptionStatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn note_incoming_packet(
        &mut self,
        ssrc: u32,
        seq_no: u16,
        rtp_timestamp: u32,
        clock_rate: u32,
        use_for_jitter_calculation: bool,
        arrival: SystemTime,
        packet_size: usize,
    ) -> (SystemTime, bool) {
        let stats = self.table.entry(ssrc).or_insert_with(|| {
            tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "new RTP source");
            ReceptionStats::new(ssrc)
        });
        stats.note_incoming_packet(
            seq_no,
            rtp_timestamp,
            clock_rate,
            use_for_jitter_calculation,
            arrival,
            packet_size,
        )
    }

    pub fn note_incoming_sr(&mut self, ssrc: u32, ntp_msw: u32, ntp_lsw: u32, rtp_timestamp: u32, now: SystemTime) {
        self.table
            .entry(ssrc)
            .or_insert_with(|| ReceptionStats::new(ssrc))
            .note_incoming_sr(ntp_msw, ntp_lsw, rtp_timestamp, now);
    }

    pub fn lookup(&self, ssrc: u32) -> Option<&ReceptionStats> {
        self.table.get(&ssrc)
    }

    pub fn remove(&mut self, ssrc: u32) -> Option<ReceptionStats> {
        self.table.remove(&ssrc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceptionStats> {
        self.table.values()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Sources with packets since the last reset: the ones an RR reports on.
    pub fn num_active_sources_since_last_reset(&self) -> usize {
        self.table
            .values()
            .filter(|s| s.num_packets_received_since_last_reset > 0)
            .count()
    }

    pub fn reset(&mut self) {
        for stats in self.table.values_mut() {
            stats.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NTP_UNIX_OFFSET_SECS;
    use std::time::UNIX_EPOCH;

    const CLOCK: u32 = 90_000;

    fn at_ms(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000_000) + Duration::from_millis(ms)
    }

    #[test]
    fn extended_sequence_across_wrap() {
        let mut s = ReceptionStats::new(1);
        s.note_incoming_packet(65534, 0, CLOCK, false, at_ms(0), 100);
        s.note_incoming_packet(65535, 0, CLOCK, false, at_ms(1), 100);
        s.note_incoming_packet(1, 0, CLOCK, false, at_ms(2), 100);
        assert_eq!(s.base_ext_seq_no_received(), 0x1_FFFE);
        assert_eq!(s.highest_ext_seq_no_received(), 0x2_0001);
        // Late packet from the new cycle does not move the highest.
        s.note_incoming_packet(0, 0, CLOCK, false, at_ms(3), 100);
        assert_eq!(s.highest_ext_seq_no_received(), 0x2_0001);
        assert_eq!(s.tot_num_packets_expected(), 4);
        assert_eq!(s.cumulative_lost(), 0);
        assert_eq!(s.tot_bytes_received(), 400);
    }

    #[test]
    fn late_packet_from_before_first_lowers_base() {
        let mut s = ReceptionStats::new(1);
        s.note_incoming_packet(2, 0, CLOCK, false, at_ms(0), 10);
        s.note_incoming_packet(65535, 0, CLOCK, false, at_ms(1), 10);
        assert_eq!(s.base_ext_seq_no_received(), 0xFFFF);
        assert_eq!(s.highest_ext_seq_no_received(), 0x1_0002);
    }

    #[test]
    fn loss_accounting() {
        let mut s = ReceptionStats::new(1);
        for seq in [10, 11, 14, 15] {
            s.note_incoming_packet(seq, 0, CLOCK, false, at_ms(0), 10);
        }
        assert_eq!(s.tot_num_packets_expected(), 6);
        assert_eq!(s.cumulative_lost(), 2);
        assert_eq!(s.loss_fraction(), (2 * 256 / 6) as u8);

        s.reset();
        s.note_incoming_packet(16, 0, CLOCK, false, at_ms(1), 10);
        assert_eq!(s.loss_fraction(), 0);
        s.note_incoming_packet(19, 0, CLOCK, false, at_ms(2), 10);
        assert_eq!(s.loss_fraction(), (2 * 256 / 4) as u8);
    }

    #[test]
    fn jitter_stays_zero_for_steady_spacing() {
        let mut s = ReceptionStats::new(1);
        for i in 0..50u32 {
            s.note_incoming_packet(i as u16, i * 3600, CLOCK, true, at_ms(u64::from(i) * 40), 1000);
        }
        assert!(s.jitter_f64() < 1.0, "jitter {}", s.jitter_f64());
    }

    #[test]
    fn jitter_spike_adds_one_sixteenth() {
        let mut s = ReceptionStats::new(1);
        for i in 0..10u32 {
            s.note_incoming_packet(i as u16, i * 3600, CLOCK, true, at_ms(u64::from(i) * 40), 1000);
        }
        let before = s.jitter_f64();
        // 100 ms late: 9000 RTP units.
        s.note_incoming_packet(10, 36_000, CLOCK, true, at_ms(400 + 100), 1000);
        let after = s.jitter_f64();
        assert!((after - (before + (9000.0 - before) / 16.0)).abs() < 1e-9);
        assert_eq!(s.jitter(), 562);
    }

    #[test]
    fn repeated_timestamp_skips_jitter() {
        let mut s = ReceptionStats::new(1);
        s.note_incoming_packet(0, 1000, CLOCK, true, at_ms(0), 10);
        s.note_incoming_packet(1, 1000, CLOCK, true, at_ms(300), 10);
        assert_eq!(s.jitter_f64(), 0.0);
    }

    #[test]
    fn presentation_time_follows_rtp_clock() {
        let mut s = ReceptionStats::new(1);
        let (t0, synced) = s.note_incoming_packet(0, 5000, CLOCK, true, at_ms(0), 10);
        assert_eq!(t0, at_ms(0));
        assert!(!synced);
        let (t1, _) = s.note_incoming_packet(1, 5000 + 9000, CLOCK, true, at_ms(150), 10);
        assert_eq!(t1, at_ms(100));
    }

    #[test]
    fn sender_report_resyncs_presentation_time() {
        let mut s = ReceptionStats::new(1);
        s.note_incoming_packet(0, 1000, CLOCK, true, at_ms(0), 10);

        let sync_time = UNIX_EPOCH + Duration::from_secs(2_000_000);
        let msw = 2_000_000u32.wrapping_add(NTP_UNIX_OFFSET_SECS);
        s.note_incoming_sr(msw, 0, 50_000, at_ms(10));
        assert!(s.has_been_synchronized());
        assert_ne!(s.last_sr(), 0);

        let (t, synced) = s.note_incoming_packet(1, 50_000 + 45_000, CLOCK, true, at_ms(20), 10);
        assert!(synced);
        assert_eq!(t, sync_time + Duration::from_millis(500));
    }

    #[test]
    fn dlsr_counts_from_sr_arrival() {
        let mut s = ReceptionStats::new(1);
        assert_eq!(s.delay_since_last_sr(at_ms(0)), 0);
        s.note_incoming_sr(NTP_UNIX_OFFSET_SECS, 0, 0, at_ms(0));
        assert_eq!(s.delay_since_last_sr(at_ms(1500)), 0x0001_8000);
    }

    #[test]
    fn table_tracks_active_sources() {
        let mut table = ReceptionStatsTable::new();
        table.note_incoming_packet(1, 0, 0, CLOCK, true, at_ms(0), 10);
        table.note_incoming_packet(2, 0, 0, CLOCK, true, at_ms(0), 10);
        assert_eq!(table.num_active_sources_since_last_reset(), 2);
        table.reset();
        assert_eq!(table.num_active_sources_since_last_reset(), 0);
        assert!(table.remove(1).is_some());
        assert_eq!(table.len(), 1);
    }
}
