//! burrow-services — channels, the chat and file-transfer protocols, and the
//! per-peer conversation machinery built on them.

pub mod callbacks;
pub mod channel;
pub mod chat;
pub mod context;
pub mod conversation;
pub mod file_transfer;
pub mod peer;
pub mod peer_task;
pub mod registry;
pub mod transport;

pub use callbacks::EventCallbacks;
pub use channel::{ChannelError, ChannelInfo, ChannelListener, ChannelState, Connection, Protocol};
pub use chat::{ChatError, ChatEvent, ChatProtocol};
pub use context::PeerContext;
pub use conversation::{
    Conversation, MessageData, MessageKind, MessageStatus, Outbox, SendError,
};
pub use file_transfer::{FileTransfers, TransferError, TransferEvent, TransferStep};
pub use peer::{ConnectionPurpose, PeerId, Role};
pub use peer_task::{loopback_pair, pump_frames, PeerEvent, PeerHandle, PeerTask};
pub use registry::ConversationRegistry;
pub use transport::{FrameSink, TransportError};
