//! DCC Transport
//!
//! The data side of a DCC transfer: a TCP (optionally TLS) socket to the
//! peer over which raw file bytes arrive and acknowledgement integers are
//! written back. TLS here is a transport cipher only: DCC peers rarely
//! present valid certificates, so verification is disabled.

use super::SessionError;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsStream;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Threshold above which acks switch from 4 to 8 bytes.
pub const ACK_64BIT_THRESHOLD: u64 = 4 * 1024 * 1024 * 1024;

/// A connected DCC data socket (plain or TLS).
pub enum DccStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DccStream {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DccStream::Plain(s) => s.read(buf).await,
            DccStream::Tls(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            DccStream::Plain(s) => s.write_all(buf).await,
            DccStream::Tls(s) => s.write_all(buf).await,
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = match self {
            DccStream::Plain(s) => s.shutdown().await,
            DccStream::Tls(s) => s.shutdown().await,
        };
    }
}

/// Open the data connection to a DCC peer.
pub async fn connect(address: IpAddr, port: u16, use_ssl: bool) -> Result<DccStream, SessionError> {
    let target = (address, port);
    let tcp_stream = timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(target),
    )
    .await
    .map_err(|_| {
        SessionError::Timeout(format!(
            "Connection to {}:{} timed out after {}s",
            address, port, CONNECT_TIMEOUT_SECS
        ))
    })?
    .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

    if !use_ssl {
        return Ok(DccStream::Plain(tcp_stream));
    }

    // Encryption only, no peer authentication.
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| SessionError::ConnectionFailed(format!("TLS setup failed: {}", e)))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let tls_stream = connector
        .connect(&address.to_string(), tcp_stream)
        .await
        .map_err(|e| SessionError::ConnectionFailed(format!("TLS handshake failed: {}", e)))?;

    Ok(DccStream::Tls(Box::new(tls_stream)))
}

/// Encode the acknowledgement for `position` cumulative bytes: big-endian,
/// 4 bytes when the declared size is below 4 GiB, 8 bytes otherwise.
pub fn encode_ack(declared_size: u64, position: u64) -> Vec<u8> {
    if declared_size >= ACK_64BIT_THRESHOLD {
        position.to_be_bytes().to_vec()
    } else {
        (position as u32).to_be_bytes().to_vec()
    }
}

/// Detect a MIME type from a chunk's magic bytes.
pub fn detect_mime(chunk: &[u8]) -> &'static str {
    infer::get(chunk)
        .map(|t| t.mime_type())
        .unwrap_or("application/octet-stream")
}

/// Line framing for chat-type DCC connections.
///
/// Input is decoded non-strictly: undecodable bytes become U+FFFD. A peer
/// that accumulates more than 16 KiB without a newline is misbehaving and
/// the connection must be dropped.
#[derive(Debug, Default)]
pub struct ChatBuffer {
    buffer: Vec<u8>,
}

/// The peer exceeded the chat line-length limit.
#[derive(Debug, PartialEq, Eq)]
pub struct Oversize;

impl ChatBuffer {
    const MAX_BUFFER: usize = 16 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning any complete lines. `Err(Oversize)` means
    /// the connection should be dropped.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<String>, Oversize> {
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\r', '\n']).to_string());
        }

        if self.buffer.len() > Self::MAX_BUFFER {
            return Err(Oversize);
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_width_small_file() {
        let ack = encode_ack(1024, 1024);
        assert_eq!(ack, vec![0, 0, 4, 0]);
        assert_eq!(ack.len(), 4);
    }

    #[test]
    fn test_ack_width_large_file() {
        let ack = encode_ack(ACK_64BIT_THRESHOLD, 1024);
        assert_eq!(ack.len(), 8);
        assert_eq!(ack, vec![0, 0, 0, 0, 0, 0, 4, 0]);

        // just below the threshold stays 4 bytes
        assert_eq!(encode_ack(ACK_64BIT_THRESHOLD - 1, 1024).len(), 4);
    }

    #[test]
    fn test_ack_carries_cumulative_position() {
        assert_eq!(encode_ack(2048, 500 + 44), vec![0, 0, 2, 32]);
    }

    #[test]
    fn test_detect_mime_png() {
        let png = [0x89u8, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
        assert_eq!(detect_mime(&png), "image/png");
    }

    #[test]
    fn test_detect_mime_unknown() {
        assert_eq!(detect_mime(b"just some text"), "application/octet-stream");
    }

    #[test]
    fn test_chat_buffer_lines() {
        let mut buffer = ChatBuffer::new();
        assert_eq!(buffer.feed(b"hello ").unwrap(), Vec::<String>::new());
        assert_eq!(buffer.feed(b"world\r\npartial").unwrap(), vec!["hello world"]);
        assert_eq!(buffer.feed(b"\n").unwrap(), vec!["partial"]);
    }

    #[test]
    fn test_chat_buffer_lossy_decoding() {
        let mut buffer = ChatBuffer::new();
        let lines = buffer.feed(b"bad\xff\xfebytes\n").unwrap();
        assert_eq!(lines, vec!["bad\u{fffd}\u{fffd}bytes"]);
    }

    #[test]
    fn test_chat_buffer_oversize() {
        let mut buffer = ChatBuffer::new();
        let big = vec![b'a'; 16 * 1024 + 1];
        assert_eq!(buffer.feed(&big), Err(Oversize));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // port 1 on loopback is almost certainly closed
        let result = connect("127.0.0.1".parse().unwrap(), 1, false).await;
        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
    }
}
