//! Wall-clock conversions shared by RTP timestamping and RTCP reports.
//!
//! RTP timestamps count media clock ticks (`1 / clock_rate` seconds) and wrap
//! at 32 bits. RTCP sender reports carry a 64-bit NTP timestamp (RFC 3550
//! §4): whole seconds since 1900 in the high word, a binary fraction of a
//! second in the low word.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds from the NTP epoch (1900-01-01) to the Unix epoch (1970-01-01).
pub const NTP_UNIX_OFFSET_SECS: u32 = 0x83AA_7E80;

/// A 64-bit NTP timestamp as carried in RTCP sender reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub fn from_words(msw: u32, lsw: u32) -> Self {
        NtpTimestamp((u64::from(msw) << 32) | u64::from(lsw))
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let msw = (since.as_secs() as u32).wrapping_add(NTP_UNIX_OFFSET_SECS);
        let lsw = ((u64::from(since.subsec_nanos()) << 32) / 1_000_000_000) as u32;
        Self::from_words(msw, lsw)
    }

    pub fn msw(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn lsw(self) -> u32 {
        self.0 as u32
    }

    /// The middle 32 bits, used as the "last SR" (LSR) field of report blocks.
    pub fn middle_bits(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Converts back to wall-clock time, rounding the fraction to the nearest
    /// microsecond.
    pub fn to_system_time(self) -> SystemTime {
        let secs = self.msw().wrapping_sub(NTP_UNIX_OFFSET_SECS);
        let micros = ((u64::from(self.lsw()) * 1_000_000) + (1 << 31)) >> 32;
        UNIX_EPOCH + Duration::from_secs(u64::from(secs)) + Duration::from_micros(micros)
    }
}

/// Expresses `t` in RTP clock units since the Unix epoch, truncated to 32 bits.
///
/// The fractional second is rounded to the nearest tick.
pub fn rtp_units_since_epoch(t: SystemTime, clock_rate: u32) -> u32 {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let whole = u64::from(clock_rate).wrapping_mul(since.as_secs()) as u32;
    let frac = (f64::from(clock_rate) * f64::from(since.subsec_nanos()) / 1e9 + 0.5) as u32;
    whole.wrapping_add(frac)
}

/// Offsets `base` by a signed number of RTP clock ticks.
pub fn offset_by_ticks(base: SystemTime, ticks: i32, clock_rate: u32) -> SystemTime {
    let secs = f64::from(ticks.unsigned_abs()) / f64::from(clock_rate.max(1));
    let delta = Duration::from_secs_f64(secs);
    if ticks >= 0 {
        base + delta
    } else {
        base.checked_sub(delta).unwrap_or(UNIX_EPOCH)
    }
}

/// Encodes a duration in units of 1/65536 seconds (RTCP DLSR format).
pub fn to_ntp_short(d: Duration) -> u32 {
    let secs = (d.as_secs() as u32) << 16;
    let frac = ((u64::from(d.subsec_nanos()) << 16) / 1_000_000_000) as u32;
    secs | (frac & 0xFFFF)
}
