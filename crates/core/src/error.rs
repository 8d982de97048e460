//! Error types for the RTP/RTCP transport engine.

use std::fmt;

/// Errors that can occur in the transport engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io), for socket and network failures.
/// - **Malformed packet**: [`MalformedRtp`](Self::MalformedRtp),
///   [`MalformedRtcp`](Self::MalformedRtcp),
///   [`UnexpectedPayloadType`](Self::UnexpectedPayloadType). These are
///   produced by the parsers and logged by the read loops; they never end a
///   stream on their own.
/// - **Stream lifecycle**: [`NotPlaying`](Self::NotPlaying),
///   [`NoMediaSource`](Self::NoMediaSource).
/// - **Configuration**: [`InvalidConfig`](Self::InvalidConfig).
#[derive(Debug, thiserror::Error)]
pub enum RtpError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An RTP packet failed header validation (RFC 3550 §5.1).
    #[error("malformed RTP packet: {kind}")]
    MalformedRtp { kind: RtpHeaderErrorKind },

    /// An RTCP packet or sub-packet failed validation (RFC 3550 §6).
    #[error("malformed RTCP packet: {0}")]
    MalformedRtcp(String),

    /// An RTP packet carried a payload type other than the one negotiated.
    #[error("unexpected payload type {got} (expected {expected})")]
    UnexpectedPayloadType { expected: u8, got: u8 },

    /// Pause/teardown was requested for a stream that is not playing.
    #[error("stream is not playing")]
    NotPlaying,

    /// The stream has no frame source left to play from.
    #[error("stream has no media source")]
    NoMediaSource,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Specific kind of RTP header validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpHeaderErrorKind {
    /// Fewer than the 12 fixed header bytes.
    TooShort,
    /// Version field was not 2.
    BadVersion,
    /// CSRC list runs past the end of the packet.
    TruncatedCsrcList,
    /// Header extension runs past the end of the packet.
    TruncatedExtension,
    /// Padding count is zero or exceeds the remaining payload.
    InvalidPadding,
}

impl fmt::Display for RtpHeaderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "shorter than the fixed header"),
            Self::BadVersion => write!(f, "version is not 2"),
            Self::TruncatedCsrcList => write!(f, "truncated CSRC list"),
            Self::TruncatedExtension => write!(f, "truncated header extension"),
            Self::InvalidPadding => write!(f, "invalid padding length"),
        }
    }
}

impl From<RtpHeaderErrorKind> for RtpError {
    fn from(kind: RtpHeaderErrorKind) -> Self {
        RtpError::MalformedRtp { kind }
    }
}

/// Convenience alias for `Result<T, RtpError>`.
pub type Result<T> = std::result::Result<T, RtpError>;
