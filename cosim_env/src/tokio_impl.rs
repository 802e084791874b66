//! Tokio stream implementation of [`FrameTransport`].

use crate::codec::{read_frame, write_frame};
use crate::error::ProtocolError;
use crate::network::FrameTransport;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frame transport over any tokio byte stream.
///
/// Reads and writes are guarded separately so a task blocked in `recv`
/// never delays a concurrent `send`.
pub struct StreamTransport {
    /// Peer label for logging
    peer: String,

    /// Read half
    reader: Mutex<BoxedReader>,

    /// Write half
    writer: Mutex<BoxedWriter>,
}

impl StreamTransport {
    /// Wraps an arbitrary reader/writer pair.
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer: peer.into(),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Wraps a connected TCP stream.
    pub fn tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp:unknown".to_string());
        // Frames are small and latency-bound
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self::new(peer, reader, writer)
    }

    /// Wraps one end of an in-memory duplex stream.
    pub fn duplex(peer: impl Into<String>, stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(peer, reader, writer)
    }

    /// Creates two connected in-memory transports.
    ///
    /// The first is labelled with `a`'s peer (`b`) and vice versa.
    pub fn in_memory_pair(a: &str, b: &str) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        (Self::duplex(b, left), Self::duplex(a, right))
    }
}

#[async_trait]
impl FrameTransport for StreamTransport {
    async fn send(&self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut **writer, &payload).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut **reader).await
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown of write half failed");
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
