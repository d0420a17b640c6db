//! Chat protocol — request/ack exchange on a chat channel.
//!
//! The opener of a chat channel sends ChatMessage; the receiver answers each
//! one with a ChatAck. Queueing and retry are the conversation's business.

use burrow_core::wire::{
    ChatAck, ChatMessage, ChatPacket, Direction, MessageId, MAX_MESSAGE_CHARS,
};

/// What an inbound chat packet means to the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Peer sent a message. `accepted` is the ack we owe it.
    Received {
        id: MessageId,
        text: String,
        timestamp: u64,
        accepted: bool,
    },
    /// Peer acknowledged one of our messages.
    Acknowledged { id: MessageId, accepted: bool },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat message received on an outbound channel")]
    MessageOnOutbound,
    #[error("chat ack received on an inbound channel")]
    AckOnInbound,
}

pub struct ChatProtocol;

impl ChatProtocol {
    /// Build the request for an outgoing message.
    pub fn message(text: &str, id: MessageId, timestamp: u64) -> ChatPacket {
        ChatPacket::ChatMessage(ChatMessage {
            text: text.to_string(),
            timestamp,
            id,
        })
    }

    pub fn ack(id: MessageId, accepted: bool) -> ChatPacket {
        ChatPacket::ChatAck(ChatAck { id, accepted })
    }

    /// Whether the receiver should accept this text.
    pub fn acceptable(text: &str) -> bool {
        !text.is_empty() && text.chars().count() <= MAX_MESSAGE_CHARS
    }

    /// Classify a decoded packet arriving on a channel of `direction`.
    ///
    /// Messages only flow from opener to acceptor, acks the other way. A packet
    /// against that flow is a protocol violation.
    pub fn handle_inbound(direction: Direction, packet: ChatPacket) -> Result<ChatEvent, ChatError> {
        match (direction, packet) {
            (Direction::Inbound, ChatPacket::ChatMessage(msg)) => {
                let accepted = Self::acceptable(&msg.text);
                if !accepted {
                    tracing::debug!(
                        id = msg.id,
                        chars = msg.text.chars().count(),
                        "rejecting chat message"
                    );
                }
                Ok(ChatEvent::Received {
                    id: msg.id,
                    text: msg.text,
                    timestamp: msg.timestamp,
                    accepted,
                })
            }
            (Direction::Outbound, ChatPacket::ChatAck(ack)) => Ok(ChatEvent::Acknowledged {
                id: ack.id,
                accepted: ack.accepted,
            }),
            (Direction::Outbound, ChatPacket::ChatMessage(_)) => Err(ChatError::MessageOnOutbound),
            (Direction::Inbound, ChatPacket::ChatAck(_)) => Err(ChatError::AckOnInbound),
        }
    }
}
