use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use rtp_engine::media::h264::{AnnexBSource, H264Depacketizer, H264Fragmenter, H264Packetizer};
use rtp_engine::media::rtp::RTP_HEADER_LEN;
use rtp_engine::media::simple::SimpleDepacketizer;
use rtp_engine::sink::spawn_sink;
use rtp_engine::transport::{FanOut, PacketWriter, Target, UdpTransport};
use rtp_engine::{
    Depacketizer, PayloadPacketizer, RtcpConfig, RtcpEngine, RtcpTask, RtpReceiver, RtpSink,
    RtpSource, SinkConfig, SourceConfig,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

#[derive(Parser)]
#[command(name = "rtp-tool", about = "Send or receive RTP streams with RTCP")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream an H.264 Annex B file to a UDP destination
    Send {
        /// Path to the .h264 file
        file: String,
        /// RTP destination (host:port); RTCP goes to port + 1
        #[arg(long, short)]
        dest: SocketAddr,
        /// Frame rate of the file
        #[arg(long, default_value_t = 30.0)]
        fps: f64,
        /// Local RTP port; RTCP binds the next port
        #[arg(long, default_value_t = 0)]
        port: u16,
        #[arg(long, default_value_t = 96)]
        payload_type: u8,
    },
    /// Receive a stream and log every reassembled frame
    Receive {
        /// Local RTP port; RTCP binds port + 1
        #[arg(long, short)]
        port: u16,
        #[arg(long, default_value_t = 96)]
        payload_type: u8,
        /// Clock rate for non-H.264 payloads; H.264 is assumed when omitted
        #[arg(long)]
        clock_rate: Option<u32>,
        /// Where to send receiver reports (host:port)
        #[arg(long)]
        rtcp_dest: Option<SocketAddr>,
        /// Reordering threshold in milliseconds
        #[arg(long, default_value_t = 100)]
        reorder_ms: u64,
    },
}

fn main() {
    tracing_subscriber::fmt::init();

    let result = match Args::parse().command {
        Command::Send {
            file,
            dest,
            fps,
            port,
            payload_type,
        } => send(&file, dest, fps, port, payload_type),
        Command::Receive {
            port,
            payload_type,
            clock_rate,
            rtcp_dest,
            reorder_ms,
        } => receive(port, payload_type, clock_rate, rtcp_dest, reorder_ms),
    };
    if let Err(e) = result {
        eprintln!("rtp-tool: {}", e);
        std::process::exit(1);
    }
}

/// Bind an RTP socket on `port` and its RTCP socket on the next port.
fn bind_pair(port: u16) -> rtp_engine::Result<(Arc<UdpTransport>, Arc<UdpTransport>)> {
    let rtp = UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    let rtcp_port = rtp.local_addr()?.port().wrapping_add(1);
    let rtcp = UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], rtcp_port)))?;
    Ok((Arc::new(rtp), Arc::new(rtcp)))
}

fn send(
    file: &str,
    dest: SocketAddr,
    fps: f64,
    port: u16,
    payload_type: u8,
) -> rtp_engine::Result<()> {
    let data = std::fs::read(file)?;
    let (rtp_socket, rtcp_socket) = bind_pair(port)?;

    let config = SinkConfig::default();
    let packetizer = H264Packetizer::new(payload_type);
    let max_payload = config.max_packet_size - RTP_HEADER_LEN - packetizer.special_header_size();
    let source = H264Fragmenter::new(AnnexBSource::new(&data, fps), max_payload);
    let sink = RtpSink::new(Box::new(source), Box::new(packetizer), &config)?;
    let state = sink.state();

    let rtp_out = Arc::new(FanOut::new(rtp_socket.clone()));
    rtp_out.add(0, Target::Udp(dest));
    let rtcp_out = Arc::new(FanOut::new(rtcp_socket.clone()));
    rtcp_out.add(
        0,
        Target::Udp(SocketAddr::new(dest.ip(), dest.port().wrapping_add(1))),
    );

    let engine = RtcpEngine::new(&RtcpConfig::default(), Some(state.clone()), None, Instant::now());
    let rtcp = RtcpTask::spawn(
        "rtcp",
        Arc::new(Mutex::new(engine)),
        rtcp_socket,
        rtcp_out.clone(),
    )?;
    rtcp.engine().lock().send_report(rtcp_out.as_ref(), SystemTime::now())?;

    let writer: Arc<dyn PacketWriter> = rtp_out;
    let task = spawn_sink("rtp", sink, writer)?;
    println!(
        "Streaming {} to {} (ssrc {:#010X}, seq {})",
        file,
        dest,
        state.ssrc(),
        state.current_seq_no()
    );
    while task.is_running() {
        std::thread::sleep(Duration::from_millis(100));
    }
    task.stop();
    rtcp.stop();
    println!(
        "Sent {} packets, {} payload bytes",
        state.packet_count(),
        state.total_octet_count()
    );
    Ok(())
}

fn receive(
    port: u16,
    payload_type: u8,
    clock_rate: Option<u32>,
    rtcp_dest: Option<SocketAddr>,
    reorder_ms: u64,
) -> rtp_engine::Result<()> {
    let (rtp_socket, rtcp_socket) = bind_pair(port)?;
    let depacketizer: Box<dyn Depacketizer> = match clock_rate {
        Some(rate) => Box::new(SimpleDepacketizer::new(payload_type, rate)),
        None => Box::new(H264Depacketizer::new(payload_type)),
    };
    let config = SourceConfig {
        reorder_threshold: Duration::from_millis(reorder_ms),
        ..SourceConfig::default()
    };
    let source = RtpSource::new(depacketizer, &config);

    let rtcp_out = Arc::new(FanOut::new(rtcp_socket.clone()));
    if let Some(addr) = rtcp_dest {
        rtcp_out.add(0, Target::Udp(addr));
    }
    let engine = RtcpEngine::new(
        &RtcpConfig::default(),
        None,
        Some(source.stats_table()),
        Instant::now(),
    );
    let rtcp = RtcpTask::spawn("rtcp", Arc::new(Mutex::new(engine)), rtcp_socket, rtcp_out)?;

    let receiver = RtpReceiver::spawn(
        "rtp",
        source,
        rtp_socket.clone(),
        config.poll_interval,
        |frame| {
            tracing::info!(
                ssrc = format_args!("{:#010X}", frame.ssrc),
                seq = frame.seq_no,
                ts = frame.rtp_timestamp,
                size = frame.data.len(),
                truncated = frame.num_truncated_bytes,
                synced = frame.synced_using_rtcp,
                "frame"
            );
        },
    )?;

    println!(
        "Receiving on {}, press Enter to stop",
        rtp_socket.local_addr()?
    );
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    rtcp.stop();
    if let Some(source) = receiver.stop() {
        let diag = source.diagnostics();
        println!(
            "{} packets, {} frames, {} discarded, {} malformed",
            diag.packets_received, diag.frames_delivered, diag.frames_discarded, diag.malformed
        );
    }
    Ok(())
}
