//! Frame transport abstraction shared by coordinator and simulators.

use crate::error::ProtocolError;
use async_trait::async_trait;

/// A bidirectional pipe of whole frames between two peers.
///
/// # Implementations
///
/// - **TCP**: a `tokio::net::TcpStream` split into halves
/// - **In-process**: a `tokio::io::duplex` pair for simulators that run on
///   the coordinator's own runtime
///
/// # Packet Flow
///
/// ```text
/// Peer A                     Stream                     Peer B
///   |-- send(payload) ------->|                          |
///   |                         |-- [len][payload] ------->|
///   |                         |                          |-- recv() -> payload
/// ```
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    /// Sends one frame payload (the length prefix is added by the transport).
    async fn send(&self, payload: Vec<u8>) -> Result<(), ProtocolError>;

    /// Receives the next frame payload.
    ///
    /// # Returns
    /// * `Ok(Some(payload))` - A frame was received
    /// * `Ok(None)` - The peer closed the connection cleanly
    /// * `Err(_)` - The stream failed or the frame was oversized
    async fn recv(&self) -> Result<Option<Vec<u8>>, ProtocolError>;

    /// Shuts down the write half. Pending `recv` calls observe EOF once the
    /// peer closes its side.
    async fn close(&self);

    /// Human-readable peer description (for logging).
    fn peer(&self) -> String;
}
