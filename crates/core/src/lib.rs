pub mod error;
pub mod media;
pub mod rtcp;
pub mod session;
pub mod sink;
pub mod source;
pub mod task;
pub mod time;
pub mod transport;

pub use error::{Result, RtpError};
pub use media::{Depacketizer, FrameInfo, FrameSource, PayloadPacketizer};
pub use rtcp::{RtcpConfig, RtcpEngine, RtcpTask};
pub use session::{Destinations, StreamSink, StreamState};
pub use sink::{RtpSink, SinkConfig, UdpSink};
pub use source::{ReceivedFrame, RtpReceiver, RtpSource, SourceConfig};
