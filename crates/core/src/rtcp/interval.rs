//! RTCP transmission interval (RFC 3550 §6.3.1, Appendix A.7).

use std::time::Duration;

/// Minimum average interval between reports, in seconds.
const RTCP_MIN_TIME: f64 = 5.0;
/// Share of the RTCP bandwidth reserved for active senders.
const RTCP_SENDER_BW_FRACTION: f64 = 0.25;
const RTCP_RCVR_BW_FRACTION: f64 = 1.0 - RTCP_SENDER_BW_FRACTION;
/// e - 3/2; offsets the bias toward shorter intervals introduced by timer
/// reconsideration.
const COMPENSATION: f64 = std::f64::consts::E - 1.5;

/// Inputs to one interval computation.
#[derive(Debug, Clone, Copy)]
pub struct IntervalParams {
    /// Session members, ourselves included.
    pub members: usize,
    /// Members that sent RTP recently, ourselves included.
    pub senders: usize,
    /// RTCP bandwidth in bytes per second.
    pub rtcp_bw: f64,
    pub we_sent: bool,
    /// Running average compound packet size, lower-layer headers included.
    pub avg_rtcp_size: f64,
    /// No report has been sent yet.
    pub initial: bool,
}

/// Randomized interval until the next report.
pub fn rtcp_interval(params: &IntervalParams) -> Duration {
    rtcp_interval_with_factor(params, rand::random_range(0.5..1.5))
}

/// Interval with an explicit randomization factor in `[0.5, 1.5)`.
pub fn rtcp_interval_with_factor(params: &IntervalParams, factor: f64) -> Duration {
    let min_time = if params.initial {
        RTCP_MIN_TIME / 2.0
    } else {
        RTCP_MIN_TIME
    };

    let mut rtcp_bw = params.rtcp_bw;
    let mut n = params.members as f64;
    let senders = params.senders as f64;
    if senders <= n * RTCP_SENDER_BW_FRACTION {
        if params.we_sent {
            rtcp_bw *= RTCP_SENDER_BW_FRACTION;
            n = senders;
        } else {
            rtcp_bw *= RTCP_RCVR_BW_FRACTION;
            n -= senders;
        }
    }

    let deterministic = if rtcp_bw > 0.0 {
        (params.avg_rtcp_size * n / rtcp_bw).max(min_time)
    } else {
        min_time
    };
    Duration::from_secs_f64(deterministic * factor / COMPENSATION)
}
