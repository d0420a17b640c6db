//! Application boundary — what the messaging core tells its embedder.

use std::path::Path;

use burrow_core::wire::{Direction, FileId, MessageId};

use crate::peer::PeerId;

/// Callbacks fired from a peer's task while its context is locked.
///
/// Implementations must not block and must not call back into the same
/// peer's handle synchronously.
pub trait EventCallbacks: Send + Sync {
    fn on_message_received(&self, peer: &PeerId, timestamp: u64, id: MessageId, text: &[u8]);

    fn on_message_acknowledged(&self, peer: &PeerId, id: MessageId, accepted: bool);

    fn on_file_received(&self, _peer: &PeerId, _file_id: FileId, _path: &Path) {}

    fn on_file_receive_failed(&self, _peer: &PeerId, _file_id: FileId, _reason: &str) {}

    fn on_file_transfer_progress(
        &self,
        _peer: &PeerId,
        _file_id: FileId,
        _direction: Direction,
        _bytes_done: u64,
        _bytes_total: u64,
    ) {
    }
}
