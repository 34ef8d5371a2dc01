//! Seam between the transfer engine and the underlying data channel.
//!
//! The engine only needs four operations, so they live behind a trait:
//! the production implementation wraps the WebRTC data channel (see
//! `peer::DataChannelTransport`) and tests drive the engine with an
//! in-memory recorder.

use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait DataTransport: Send + Sync {
    /// Send a UTF-8 JSON control message as a text payload.
    async fn send_text(&self, text: String) -> anyhow::Result<()>;

    /// Send a raw binary chunk.
    async fn send_binary(&self, data: Bytes) -> anyhow::Result<()>;

    /// Bytes queued locally but not yet handed to the transport. The
    /// sender throttles itself against this value.
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;
}
