//! Transport seam — where frames leave this crate.
//!
//! The authenticated, encrypted byte transport is owned by the caller. We
//! only need a way to push an encoded packet at it.

use bytes::Bytes;
use tokio::sync::mpsc;

use burrow_core::wire::{Frame, WireError};

/// Outbound half of a peer transport.
pub trait FrameSink: Send + Sync {
    /// Queue one frame for transmission. Must not block.
    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Encoded packets are pushed onto an unbounded queue; the receiving end
/// owns the socket (or, in tests, the other peer).
impl FrameSink for mpsc::UnboundedSender<Bytes> {
    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        self.send(bytes).map_err(|_| TransportError::Closed)
    }
}
