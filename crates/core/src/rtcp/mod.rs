//! RTCP report scheduling and processing (RFC 3550 §6).
//!
//! [`RtcpEngine`] is the per-stream state machine. Time is passed in
//! explicitly so that scheduling can be driven by tests; [`RtcpTask`] runs
//! it on a background thread against a packet reader and writer.
//!
//! Outgoing reports are compound packets: an SR when we are sending RTP and
//! no timestamp preset is pending (else an RR), followed by an SDES CNAME
//! chunk, and a BYE when the stream ends. Incoming SRs resynchronize
//! reception statistics; report blocks about our own SSRC feed the
//! [`TransmissionStatsTable`].

pub mod interval;
pub mod packet;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::error::Result;
use crate::sink::RtpSinkState;
use crate::source::ReceptionStatsTable;
use crate::task::Task;
use crate::time::NtpTimestamp;
use crate::transport::{PacketReader, PacketWriter};

use interval::{IntervalParams, rtcp_interval};
use packet::{CompoundBuilder, MAX_REPORT_BLOCKS, ReportBlock, RtcpPacket, SenderInfo, parse_compound};

/// Bytes of IP and UDP header counted into the average RTCP packet size.
const IP_UDP_HEADER_SIZE: usize = 28;

/// Receive buffer for incoming RTCP datagrams.
pub const MAX_RTCP_PACKET_SIZE: usize = 1500;

/// Members not heard from for this many of our own reports are dropped.
const MEMBERSHIP_REAP_PERIOD: u32 = 5;

/// Longest the RTCP thread blocks in a read before re-checking its timers.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// RTCP settings for one stream.
#[derive(Debug, Clone)]
pub struct RtcpConfig {
    /// Total session bandwidth; RTCP gets 5% of it.
    pub session_bandwidth_kbps: u32,
    /// Canonical name carried in SDES.
    pub cname: String,
    /// SSRC for a receive-only engine. A sending engine uses its sink's SSRC.
    pub ssrc: Option<u32>,
}

impl Default for RtcpConfig {
    fn default() -> Self {
        Self {
            session_bandwidth_kbps: 500,
            cname: "localhost".to_string(),
            ssrc: None,
        }
    }
}

impl RtcpConfig {
    /// RTCP bandwidth in bytes per second.
    fn rtcp_bw(&self) -> f64 {
        0.05 * f64::from(self.session_bandwidth_kbps) * 1024.0 / 8.0
    }
}

/// What one remote receiver reports about our stream.
#[derive(Debug, Clone)]
pub struct TransmissionStats {
    ssrc: u32,
    first_report_at: Instant,
    last_report_at: Instant,
    num_reports: u32,
    fraction_lost: u8,
    cumulative_lost: i32,
    highest_seq: u32,
    jitter: u32,
    last_sr: u32,
    delay_since_last_sr: u32,
    round_trip_delay: Option<Duration>,
}

impl TransmissionStats {
    fn new(ssrc: u32, now: Instant) -> Self {
        Self {
            ssrc,
            first_report_at: now,
            last_report_at: now,
            num_reports: 0,
            fraction_lost: 0,
            cumulative_lost: 0,
            highest_seq: 0,
            jitter: 0,
            last_sr: 0,
            delay_since_last_sr: 0,
            round_trip_delay: None,
        }
    }

    fn note_incoming_rr(&mut self, block: &ReportBlock, now: Instant, wall: SystemTime) {
        self.last_report_at = now;
        self.num_reports += 1;
        self.fraction_lost = block.fraction_lost;
        self.cumulative_lost = block.cumulative_lost;
        self.highest_seq = block.highest_seq;
        self.jitter = block.jitter;
        self.last_sr = block.last_sr;
        self.delay_since_last_sr = block.delay_since_last_sr;

        // RFC 3550 §6.4.1: A - LSR - DLSR, all in 1/65536 s.
        self.round_trip_delay = (block.last_sr != 0)
            .then(|| {
                let arrival = NtpTimestamp::from_system_time(wall).middle_bits();
                arrival
                    .wrapping_sub(block.last_sr)
                    .wrapping_sub(block.delay_since_last_sr)
            })
            .filter(|units| *units < 0x8000_0000)
            .map(|units| Duration::from_secs_f64(f64::from(units) / 65536.0));
    }

    /// SSRC of the receiver that sent the reports.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn first_report_at(&self) -> Instant {
        self.first_report_at
    }

    pub fn last_report_at(&self) -> Instant {
        self.last_report_at
    }

    pub fn num_reports(&self) -> u32 {
        self.num_reports
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn cumulative_lost(&self) -> i32 {
        self.cumulative_lost
    }

    pub fn highest_seq(&self) -> u32 {
        self.highest_seq
    }

    pub fn jitter(&self) -> u32 {
        self.jitter
    }

    pub fn last_sr(&self) -> u32 {
        self.last_sr
    }

    pub fn delay_since_last_sr(&self) -> u32 {
        self.delay_since_last_sr
    }

    /// `None` until the receiver has echoed one of our SRs.
    pub fn round_trip_delay(&self) -> Option<Duration> {
        self.round_trip_delay
    }
}

/// Receiver reports about our stream, keyed by receiver SSRC.
#[derive(Debug, Default)]
pub struct TransmissionStatsTable {
    table: HashMap<u32, TransmissionStats>,
}

impl TransmissionStatsTable {
    pub fn lookup(&self, ssrc: u32) -> Option<&TransmissionStats> {
        self.table.get(&ssrc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransmissionStats> {
        self.table.values()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn note_incoming_rr(&mut self, reporter: u32, block: &ReportBlock, now: Instant, wall: SystemTime) {
        self.table
            .entry(reporter)
            .or_insert_with(|| TransmissionStats::new(reporter, now))
            .note_incoming_rr(block, now, wall);
    }

    fn remove(&mut self, ssrc: u32) {
        self.table.remove(&ssrc);
    }
}

#[derive(Debug)]
struct Member {
    /// Our outgoing report count when this member was last heard.
    last_heard: u32,
    is_sender: bool,
    cname: Option<String>,
}

/// Callback receiving the SSRC that triggered it.
pub type SsrcHandler = Box<dyn FnMut(u32) + Send>;

/// A packet that a registered handler must hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    SenderReport(u32),
    ReceiverReport(u32),
    Goodbye(u32),
}

#[derive(Default)]
struct Handlers {
    sr: Option<SsrcHandler>,
    rr: Option<SsrcHandler>,
    bye: Option<SsrcHandler>,
}

impl Handlers {
    fn notify(&mut self, notices: &[Notice]) {
        for notice in notices {
            let (handler, ssrc) = match *notice {
                Notice::SenderReport(ssrc) => (self.sr.as_mut(), ssrc),
                Notice::ReceiverReport(ssrc) => (self.rr.as_mut(), ssrc),
                Notice::Goodbye(ssrc) => (self.bye.as_mut(), ssrc),
            };
            if let Some(handler) = handler {
                handler(ssrc);
            }
        }
    }

    /// Put back handlers taken for an unlocked call. One installed in the
    /// meantime is kept.
    fn restore(&mut self, taken: Handlers) {
        self.sr = self.sr.take().or(taken.sr);
        self.rr = self.rr.take().or(taken.rr);
        self.bye = self.bye.take().or(taken.bye);
    }
}

/// RTCP state for one stream.
pub struct RtcpEngine {
    ssrc: u32,
    cname: String,
    rtcp_bw: f64,
    sink: Option<Arc<RtpSinkState>>,
    reception: Option<Arc<Mutex<ReceptionStatsTable>>>,
    transmission: TransmissionStatsTable,
    members: HashMap<u32, Member>,

    prev_report_time: Instant,
    next_report_time: Instant,
    prev_num_members: usize,
    avg_rtcp_size: f64,
    initial: bool,
    outgoing_report_count: u32,
    last_sent_size: usize,
    malformed: u64,

    handlers: Handlers,
}

impl RtcpEngine {
    /// Create an engine for a stream that sends through `sink`, receives
    /// into `reception`, or both.
    ///
    /// The first report is scheduled at the randomized initial interval.
    pub fn new(
        config: &RtcpConfig,
        sink: Option<Arc<RtpSinkState>>,
        reception: Option<Arc<Mutex<ReceptionStatsTable>>>,
        now: Instant,
    ) -> Self {
        let ssrc = sink
            .as_ref()
            .map(|s| s.ssrc())
            .or(config.ssrc)
            .unwrap_or_else(rand::random);
        // RFC 3550 §6.3.2: start from the probable size of our first packet.
        let first_packet = CompoundBuilder::new()
            .receiver_report(ssrc, &[])
            .sdes_cname(ssrc, &config.cname)
            .len();
        let mut engine = Self {
            ssrc,
            cname: config.cname.clone(),
            rtcp_bw: config.rtcp_bw(),
            sink,
            reception,
            transmission: TransmissionStatsTable::default(),
            members: HashMap::new(),
            prev_report_time: now,
            next_report_time: now,
            prev_num_members: 1,
            avg_rtcp_size: (first_packet + IP_UDP_HEADER_SIZE) as f64,
            initial: true,
            outgoing_report_count: 1,
            last_sent_size: 0,
            malformed: 0,
            handlers: Handlers::default(),
        };
        engine.next_report_time = now + rtcp_interval(&engine.interval_params());
        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            cname = %engine.cname,
            first_report_in = ?engine.next_report_time - now,
            "RTCP engine created"
        );
        engine
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Members of the session, ourselves included.
    pub fn num_members(&self) -> usize {
        self.members.len() + 1
    }

    pub fn next_report_time(&self) -> Instant {
        self.next_report_time
    }

    pub fn avg_rtcp_size(&self) -> f64 {
        self.avg_rtcp_size
    }

    /// Size of the last compound packet we sent, 0 before the first.
    pub fn last_sent_size(&self) -> usize {
        self.last_sent_size
    }

    pub fn malformed_packets(&self) -> u64 {
        self.malformed
    }

    pub fn transmission_stats(&self) -> &TransmissionStatsTable {
        &self.transmission
    }

    /// CNAME announced by `ssrc`, if one has been received.
    pub fn member_cname(&self, ssrc: u32) -> Option<&str> {
        self.members.get(&ssrc)?.cname.as_deref()
    }

    pub fn set_sr_handler(&mut self, handler: impl FnMut(u32) + Send + 'static) {
        self.handlers.sr = Some(Box::new(handler));
    }

    pub fn set_rr_handler(&mut self, handler: impl FnMut(u32) + Send + 'static) {
        self.handlers.rr = Some(Box::new(handler));
    }

    pub fn set_bye_handler(&mut self, handler: impl FnMut(u32) + Send + 'static) {
        self.handlers.bye = Some(Box::new(handler));
    }

    fn we_sent(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| s.has_sent_packets())
    }

    fn interval_params(&self) -> IntervalParams {
        let remote_senders = self.members.values().filter(|m| m.is_sender).count();
        IntervalParams {
            members: self.num_members(),
            senders: remote_senders + usize::from(self.we_sent()),
            rtcp_bw: self.rtcp_bw,
            we_sent: self.we_sent(),
            avg_rtcp_size: self.avg_rtcp_size,
            initial: self.initial,
        }
    }

    /// Timer expiry (RFC 3550 A.7 `OnExpire`).
    ///
    /// Recomputes the interval with the current membership. If the report
    /// is due it is sent and the timer re-armed from `now`; otherwise the
    /// timer moves to the reconsidered time. Returns whether a report was
    /// sent.
    pub fn on_expire(&mut self, writer: &dyn PacketWriter, now: Instant, wall: SystemTime) -> bool {
        self.note_active_sources();
        let members = self.num_members();
        let tn = self.prev_report_time + rtcp_interval(&self.interval_params());
        let enabled = self.sink.as_ref().is_none_or(|s| s.rtcp_reports_enabled());
        let sent = if tn <= now {
            if !enabled {
                tracing::trace!("RTCP reports disabled, report skipped");
            } else if let Err(e) = self.send_report(writer, wall) {
                tracing::warn!(error = %e, "RTCP report send failed");
            }
            self.prev_report_time = now;
            self.initial = false;
            self.next_report_time = now + rtcp_interval(&self.interval_params());
            enabled
        } else {
            self.next_report_time = tn;
            false
        };
        self.prev_num_members = members;
        sent
    }

    /// Build and send one report now, outside the schedule.
    pub fn send_report(&mut self, writer: &dyn PacketWriter, wall: SystemTime) -> Result<usize> {
        let compound = self.build_compound(wall, false);
        writer.send_packet(&compound)?;
        self.note_report_sent(compound.len());
        tracing::debug!(
            ssrc = format_args!("{:#010X}", self.ssrc),
            len = compound.len(),
            members = self.num_members(),
            "RTCP report sent"
        );
        Ok(compound.len())
    }

    /// Send a final report followed by BYE.
    pub fn send_bye(&mut self, writer: &dyn PacketWriter, wall: SystemTime) -> Result<()> {
        let compound = self.build_compound(wall, true);
        writer.send_packet(&compound)?;
        self.note_report_sent(compound.len());
        tracing::info!(ssrc = format_args!("{:#010X}", self.ssrc), "RTCP BYE sent");
        Ok(())
    }

    fn build_compound(&mut self, wall: SystemTime, bye: bool) -> Vec<u8> {
        let blocks = self.report_blocks(wall);
        let builder = match self.sender_info(wall) {
            Some(info) => CompoundBuilder::new().sender_report(self.ssrc, &info, &blocks),
            None => CompoundBuilder::new().receiver_report(self.ssrc, &blocks),
        };
        let builder = builder.sdes_cname(self.ssrc, &self.cname);
        if bye {
            builder.bye(self.ssrc, None).finish()
        } else {
            builder.finish()
        }
    }

    /// Sender info when we act as a sender. While a timestamp preset is
    /// pending the RTP clock is about to jump, so an RR goes out instead.
    fn sender_info(&self, wall: SystemTime) -> Option<SenderInfo> {
        let sink = self.sink.as_ref()?;
        if sink.next_timestamp_has_been_preset() {
            return None;
        }
        Some(SenderInfo {
            ntp_timestamp: NtpTimestamp::from_system_time(wall),
            rtp_timestamp: sink.rtp_timestamp_at(wall),
            packet_count: sink.packet_count(),
            octet_count: sink.octet_count(),
        })
    }

    /// One block per source heard since the last report; starts a new
    /// reporting interval.
    fn report_blocks(&self, wall: SystemTime) -> Vec<ReportBlock> {
        let Some(reception) = &self.reception else {
            return Vec::new();
        };
        let mut table = reception.lock();
        let blocks = table
            .iter()
            .filter(|s| s.num_packets_received_since_last_reset() > 0)
            .take(MAX_REPORT_BLOCKS)
            .map(|s| ReportBlock {
                ssrc: s.ssrc(),
                fraction_lost: s.loss_fraction(),
                cumulative_lost: s.cumulative_lost(),
                highest_seq: s.highest_ext_seq_no_received(),
                jitter: s.jitter(),
                last_sr: s.last_sr(),
                delay_since_last_sr: s.delay_since_last_sr(wall),
            })
            .collect();
        table.reset();
        blocks
    }

    fn note_report_sent(&mut self, size: usize) {
        self.last_sent_size = size;
        self.update_avg_size(size);

        self.outgoing_report_count += 1;
        if self.outgoing_report_count % MEMBERSHIP_REAP_PERIOD == 0 {
            self.reap_old_members(self.outgoing_report_count - MEMBERSHIP_REAP_PERIOD);
        }
    }

    fn update_avg_size(&mut self, packet_size: usize) {
        let size = (packet_size + IP_UDP_HEADER_SIZE) as f64;
        self.avg_rtcp_size = size / 16.0 + self.avg_rtcp_size * 15.0 / 16.0;
    }

    fn reap_old_members(&mut self, threshold: u32) {
        let stale: Vec<u32> = self
            .members
            .iter()
            .filter(|(_, m)| m.last_heard < threshold)
            .map(|(ssrc, _)| *ssrc)
            .collect();
        for ssrc in stale {
            tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "RTCP member timed out");
            self.members.remove(&ssrc);
            self.remove_stats(ssrc);
        }
    }

    fn remove_stats(&mut self, ssrc: u32) {
        self.transmission.remove(ssrc);
        if let Some(reception) = &self.reception {
            reception.lock().remove(ssrc);
        }
    }

    /// Record `ssrc` as heard now. Returns whether it is new.
    fn note_member(&mut self, ssrc: u32, is_sender: bool) -> bool {
        if ssrc == self.ssrc {
            return false;
        }
        let heard = self.outgoing_report_count;
        match self.members.get_mut(&ssrc) {
            Some(member) => {
                member.last_heard = heard;
                member.is_sender |= is_sender;
                false
            }
            None => {
                self.members.insert(
                    ssrc,
                    Member {
                        last_heard: heard,
                        is_sender,
                        cname: None,
                    },
                );
                true
            }
        }
    }

    /// RTP sources count as sending members.
    fn note_active_sources(&mut self) {
        let Some(reception) = self.reception.clone() else {
            return;
        };
        let active: Vec<u32> = reception
            .lock()
            .iter()
            .filter(|s| s.num_packets_received_since_last_reset() > 0)
            .map(|s| s.ssrc())
            .collect();
        for ssrc in active {
            self.note_member(ssrc, true);
        }
    }

    /// Handle one incoming compound RTCP datagram (RFC 3550 A.7 `OnReceive`).
    ///
    /// Malformed sub-packets are counted and skipped. Handlers run after the
    /// whole datagram has been absorbed.
    pub fn process_incoming(&mut self, datagram: &[u8], now: Instant, wall: SystemTime) {
        let notices = self.absorb(datagram, now, wall);
        self.handlers.notify(&notices);
    }

    /// [`process_incoming`](Self::process_incoming) for an engine shared
    /// with other threads.
    ///
    /// Handlers run with `engine` unlocked, so they may lock it themselves.
    pub fn process_shared(engine: &Mutex<Self>, datagram: &[u8], now: Instant, wall: SystemTime) {
        let (notices, mut handlers) = {
            let mut locked = engine.lock();
            let notices = locked.absorb(datagram, now, wall);
            if notices.is_empty() {
                return;
            }
            (notices, std::mem::take(&mut locked.handlers))
        };
        handlers.notify(&notices);
        engine.lock().handlers.restore(handlers);
    }

    fn absorb(&mut self, datagram: &[u8], now: Instant, wall: SystemTime) -> Vec<Notice> {
        let mut notices = Vec::new();
        let mut byes = Vec::new();
        for parsed in parse_compound(datagram) {
            let packet = match parsed {
                Ok(packet) => packet,
                Err(e) => {
                    self.malformed += 1;
                    tracing::debug!(error = %e, "RTCP sub-packet dropped");
                    continue;
                }
            };
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    tracing::trace!(ssrc = format_args!("{:#010X}", sr.ssrc), "SR received");
                    self.note_member(sr.ssrc, true);
                    if let Some(reception) = &self.reception {
                        reception.lock().note_incoming_sr(
                            sr.ssrc,
                            sr.info.ntp_timestamp.msw(),
                            sr.info.ntp_timestamp.lsw(),
                            sr.info.rtp_timestamp,
                            wall,
                        );
                    }
                    self.note_report_blocks(sr.ssrc, &sr.reports, now, wall);
                    notices.push(Notice::SenderReport(sr.ssrc));
                }
                RtcpPacket::ReceiverReport(rr) => {
                    tracing::trace!(ssrc = format_args!("{:#010X}", rr.ssrc), "RR received");
                    self.note_member(rr.ssrc, false);
                    self.note_report_blocks(rr.ssrc, &rr.reports, now, wall);
                    notices.push(Notice::ReceiverReport(rr.ssrc));
                }
                RtcpPacket::SourceDescription(chunks) => {
                    for chunk in chunks {
                        self.note_member(chunk.ssrc, false);
                        if let (Some(member), Some(cname)) =
                            (self.members.get_mut(&chunk.ssrc), chunk.cname)
                        {
                            member.cname = Some(cname);
                        }
                    }
                }
                RtcpPacket::Goodbye(bye) => byes.extend(bye.sources),
                RtcpPacket::Other { packet_type } => {
                    tracing::trace!(packet_type, "RTCP packet ignored");
                }
            }
        }
        self.update_avg_size(datagram.len());
        for ssrc in byes {
            self.handle_bye(ssrc, now);
            notices.push(Notice::Goodbye(ssrc));
        }
        notices
    }

    fn note_report_blocks(&mut self, reporter: u32, blocks: &[ReportBlock], now: Instant, wall: SystemTime) {
        if self.sink.is_none() {
            return;
        }
        for block in blocks.iter().filter(|b| b.ssrc == self.ssrc) {
            self.transmission.note_incoming_rr(reporter, block, now, wall);
        }
    }

    fn handle_bye(&mut self, ssrc: u32, now: Instant) {
        tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "RTCP BYE received");
        let was_member = self.members.remove(&ssrc).is_some();
        self.remove_stats(ssrc);
        if !was_member {
            return;
        }

        // Reverse reconsideration (RFC 3550 §6.3.4).
        let members = self.num_members();
        if members < self.prev_num_members {
            let ratio = members as f64 / self.prev_num_members as f64;
            let until_next = self.next_report_time.saturating_duration_since(now);
            self.next_report_time = now + until_next.mul_f64(ratio);
            let since_prev = now.saturating_duration_since(self.prev_report_time);
            self.prev_report_time = now
                .checked_sub(since_prev.mul_f64(ratio))
                .unwrap_or(self.prev_report_time);
            self.prev_num_members = members;
        }
    }
}

/// Runs an [`RtcpEngine`] on its own thread.
///
/// The thread reads incoming RTCP, fires the report timer, and sends BYE
/// when stopped.
pub struct RtcpTask {
    engine: Arc<Mutex<RtcpEngine>>,
    task: Task<()>,
}

impl RtcpTask {
    pub fn spawn<R>(
        name: &str,
        engine: Arc<Mutex<RtcpEngine>>,
        mut reader: R,
        writer: Arc<dyn PacketWriter>,
    ) -> io::Result<Self>
    where
        R: PacketReader + 'static,
    {
        let shared = engine.clone();
        let task = Task::spawn(name, move |running| {
            let mut buf = vec![0u8; MAX_RTCP_PACKET_SIZE];
            while running.load(Ordering::SeqCst) {
                let wait = shared
                    .lock()
                    .next_report_time()
                    .saturating_duration_since(Instant::now())
                    .clamp(Duration::from_millis(1), POLL_INTERVAL);
                match reader.recv_packet(&mut buf, wait) {
                    Ok(Some(n)) => RtcpEngine::process_shared(
                        &shared,
                        &buf[..n],
                        Instant::now(),
                        SystemTime::now(),
                    ),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "RTCP read failed, reader stopping");
                        break;
                    }
                }
                let now = Instant::now();
                let mut engine = shared.lock();
                if now >= engine.next_report_time() {
                    engine.on_expire(writer.as_ref(), now, SystemTime::now());
                }
            }
            if let Err(e) = shared.lock().send_bye(writer.as_ref(), SystemTime::now()) {
                tracing::debug!(error = %e, "RTCP BYE not sent");
            }
        })?;
        Ok(Self { engine, task })
    }

    pub fn engine(&self) -> Arc<Mutex<RtcpEngine>> {
        self.engine.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop the thread after it sends BYE.
    pub fn stop(self) {
        self.task.stop();
    }
}
