//! RTP/RTCP interleaved on the RTSP TCP connection (RFC 2326 §10.12).
//!
//! Each packet is framed as:
//!
//! ```text
//! +-----+---------+----------------+------------------+
//! | '$' | channel | length (16 BE) | packet bytes ... |
//! +-----+---------+----------------+------------------+
//! ```
//!
//! Channel ids are negotiated in the SETUP `Transport` header
//! (`interleaved=0-1`: RTP on 0, RTCP on 1).

use std::io::{self, BufRead, Write};
use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::Mutex;

use super::PacketWriter;
use crate::error::Result;

const FRAME_MAGIC: u8 = b'$';

/// Write one interleaved frame.
pub fn write_interleaved<W: Write>(w: &mut W, channel: u8, packet: &[u8]) -> io::Result<()> {
    let len = u16::try_from(packet.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{}-byte packet too large to interleave", packet.len()),
        )
    })?;
    let [hi, lo] = len.to_be_bytes();
    w.write_all(&[FRAME_MAGIC, channel, hi, lo])?;
    w.write_all(packet)?;
    w.flush()
}

/// Reads interleaved frames from a byte stream.
///
/// Bytes outside a `$` frame (RTSP requests or responses sharing the
/// connection) are skipped.
pub struct InterleavedReader<R> {
    inner: R,
}

impl<R: BufRead> InterleavedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next `(channel, packet)`, or `None` at end of stream.
    pub fn next_frame(&mut self) -> io::Result<Option<(u8, Vec<u8>)>> {
        let mut skipped = 0usize;
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Ok(None);
            }
            match buf.iter().position(|&b| b == FRAME_MAGIC) {
                Some(pos) => {
                    skipped += pos;
                    self.inner.consume(pos + 1);
                    break;
                }
                None => {
                    let n = buf.len();
                    skipped += n;
                    self.inner.consume(n);
                }
            }
        }
        if skipped > 0 {
            tracing::trace!(skipped, "non-interleaved bytes skipped");
        }

        let mut header = [0u8; 3];
        self.inner.read_exact(&mut header)?;
        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
        let mut packet = vec![0u8; len];
        self.inner.read_exact(&mut packet)?;
        Ok(Some((header[0], packet)))
    }
}

/// Writes one interleaved channel of a shared RTSP connection.
#[derive(Clone)]
pub struct InterleavedWriter {
    stream: Arc<Mutex<TcpStream>>,
    channel: u8,
}

impl InterleavedWriter {
    pub fn new(stream: Arc<Mutex<TcpStream>>, channel: u8) -> Self {
        Self { stream, channel }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }
}

impl PacketWriter for InterleavedWriter {
    fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock();
        write_interleaved(&mut *stream, self.channel, packet)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};
    use std::net::TcpListener;

    #[test]
    fn framing_round_trip_skips_rtsp_text() {
        let mut wire = b"RTSP/1.0 200 OK\r\nCSeq: 4\r\n\r\n".to_vec();
        write_interleaved(&mut wire, 0, &[0x80, 0x60, 0, 1]).unwrap();
        write_interleaved(&mut wire, 1, &[0x81, 0xC9]).unwrap();

        let mut reader = InterleavedReader::new(Cursor::new(wire));
        assert_eq!(
            reader.next_frame().unwrap(),
            Some((0, vec![0x80, 0x60, 0, 1]))
        );
        assert_eq!(reader.next_frame().unwrap(), Some((1, vec![0x81, 0xC9])));
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn oversized_packet_rejected() {
        let mut wire = Vec::new();
        assert!(write_interleaved(&mut wire, 0, &vec![0; 70000]).is_err());
        assert!(wire.is_empty());
    }

    #[test]
    fn writer_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let writer = InterleavedWriter::new(Arc::new(Mutex::new(server)), 2);
        writer.send_packet(b"abc").unwrap();

        let mut reader = InterleavedReader::new(BufReader::new(client));
        assert_eq!(reader.next_frame().unwrap(), Some((2, b"abc".to_vec())));
    }
}
