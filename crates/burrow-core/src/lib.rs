//! burrow-core — wire format, content hashing, and configuration.
//! All other Burrow crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use config::{BurrowConfig, ConversationSettings, TransferSettings};
pub use wire::{ChannelId, ContentHash, Direction, FileId, Frame, MessageId, WireError};
