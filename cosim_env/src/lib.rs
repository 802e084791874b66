//! Cosim Wire Protocol & Transport Layer
//!
//! This crate provides the pieces shared by the coordinator ("world") and
//! every simulator process:
//! - **Codec**: length-prefixed frames carrying `[type, id, content]` JSON
//! - **Transport**: a frame-level byte pipe (TCP or in-memory)
//! - **Endpoint**: a message-id multiplexer that lets either side issue
//!   requests while one of its own requests is still outstanding
//!
//! # Message Flow
//!
//! ```text
//! World                                  Simulator
//!   |-- [0, 1, ["step", [3, {..}], {}]] ---->|
//!   |                                        |  (mid-step)
//!   |<--- [0, 1, ["set_data", [{..}], {}]] --|
//!   |---- [1, 1, null] --------------------->|
//!   |<--- [1, 1, 4] -------------------------|
//! ```
//!
//! Message ids are scoped per direction, so both sides may use id `1` at the
//! same time without ambiguity.

mod codec;
mod endpoint;
mod error;
mod network;
mod tokio_impl;
mod types;

pub use codec::{decode, encode, read_frame, write_frame, MAX_FRAME_LEN};
pub use endpoint::{Endpoint, IncomingRequest};
pub use error::{CallError, ProtocolError};
pub use network::FrameTransport;
pub use tokio_impl::StreamTransport;
pub use types::{Call, Message, MessageId, MessageType};
