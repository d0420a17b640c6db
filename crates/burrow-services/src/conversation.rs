//! Conversation — the per-peer message queue and delivery bookkeeping.
//!
//! Messages are kept newest first. Outgoing messages start out Queued and
//! are pushed through whatever channel the [`Outbox`] currently has. They
//! come back to Queued when that channel is lost, up to a per-kind attempt
//! limit, and end Delivered or Error once the peer answers.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use burrow_core::config::ConversationSettings;
use burrow_core::wire::{Direction, MessageId, MAX_MESSAGE_CHARS};

use crate::callbacks::EventCallbacks;
use crate::peer::PeerId;

/// Entries inspected when de-duplicating and placing an inbound message.
const RECENT_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Queued,
    Sending,
    Delivered,
    Error,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    pub identifier: MessageId,
    pub kind: MessageKind,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub direction: Direction,
    pub status: MessageStatus,
    pub attempt_count: u8,
}

impl MessageData {
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Text(text) => Some(text.as_str()),
            MessageKind::File(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("message is longer than {} characters", MAX_MESSAGE_CHARS)]
    MessageTooLong,
}

/// Where queued messages go. Implemented over the live connection.
pub trait Outbox {
    /// True if a chat channel is open. May start opening one.
    fn chat_ready(&mut self) -> bool;
    /// True if a file channel is open. May start opening one.
    fn file_ready(&mut self) -> bool;
    fn send_chat(&mut self, id: MessageId, text: &str, timestamp: u64) -> anyhow::Result<()>;
    fn send_file(&mut self, id: MessageId, path: &Path) -> anyhow::Result<()>;
}

pub struct Conversation {
    peer: PeerId,
    settings: ConversationSettings,
    messages: VecDeque<MessageData>,
    last_id: MessageId,
    unread_count: usize,
    callbacks: Arc<dyn EventCallbacks>,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Conversation {
    pub fn new(
        peer: PeerId,
        settings: ConversationSettings,
        callbacks: Arc<dyn EventCallbacks>,
    ) -> Self {
        Self {
            peer,
            settings,
            messages: VecDeque::new(),
            last_id: rand::random(),
            unread_count: 0,
            callbacks,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn next_id(&mut self) -> MessageId {
        self.last_id = self.last_id.wrapping_add(1);
        self.last_id
    }

    // ── Outgoing ─────────────────────────────────────────────────────────────

    /// Queue a chat message and try to send it right away.
    pub fn send_message(
        &mut self,
        text: &str,
        outbox: &mut dyn Outbox,
    ) -> Result<MessageId, SendError> {
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(SendError::MessageTooLong);
        }
        Ok(self.enqueue(MessageKind::Text(text.to_string()), outbox))
    }

    /// Queue a file and try to start sending it right away.
    pub fn send_file(
        &mut self,
        path: &Path,
        outbox: &mut dyn Outbox,
    ) -> Result<MessageId, SendError> {
        if path.as_os_str().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        Ok(self.enqueue(MessageKind::File(path.to_path_buf()), outbox))
    }

    fn enqueue(&mut self, kind: MessageKind, outbox: &mut dyn Outbox) -> MessageId {
        let identifier = self.next_id();
        self.messages.push_front(MessageData {
            identifier,
            kind,
            timestamp: now_millis(),
            direction: Direction::Outbound,
            status: MessageStatus::Queued,
            attempt_count: 0,
        });
        self.try_send(0, outbox);
        self.prune();
        identifier
    }

    /// Push every Queued message, oldest first, through the outbox.
    pub fn send_queued(&mut self, outbox: &mut dyn Outbox) {
        for index in (0..self.messages.len()).rev() {
            if self.messages[index].status == MessageStatus::Queued {
                self.try_send(index, outbox);
            }
        }
    }

    fn try_send(&mut self, index: usize, outbox: &mut dyn Outbox) {
        let Some(message) = self.messages.get_mut(index) else {
            return;
        };
        let result = match &message.kind {
            MessageKind::Text(text) => {
                if !outbox.chat_ready() {
                    return;
                }
                outbox.send_chat(message.identifier, text, message.timestamp)
            }
            MessageKind::File(path) => {
                if !outbox.file_ready() {
                    return;
                }
                outbox.send_file(message.identifier, path)
            }
        };
        message.attempt_count = message.attempt_count.saturating_add(1);
        match result {
            Ok(()) => message.status = MessageStatus::Sending,
            Err(e) => {
                tracing::warn!(
                    peer = self.peer.short(),
                    id = message.identifier,
                    error = %e,
                    "send failed"
                );
                message.status = MessageStatus::Error;
            }
        }
    }

    /// The outbound chat channel went away. Returns true if anything was
    /// re-queued and a drain should be scheduled.
    pub fn outbound_chat_closed(&mut self) -> bool {
        let limit = self.settings.max_send_attempts;
        self.requeue_sending(|kind| matches!(kind, MessageKind::Text(_)), limit)
    }

    /// The outbound file channel went away. File transfers resume by id, so
    /// re-queueing them is cheap; they have their own attempt limit.
    pub fn outbound_file_closed(&mut self) -> bool {
        let limit = self.settings.max_file_attempts;
        self.requeue_sending(|kind| matches!(kind, MessageKind::File(_)), limit)
    }

    fn requeue_sending(&mut self, matches_kind: impl Fn(&MessageKind) -> bool, limit: u8) -> bool {
        let mut requeued = false;
        for message in self.messages.iter_mut() {
            if message.direction != Direction::Outbound
                || message.status != MessageStatus::Sending
                || !matches_kind(&message.kind)
            {
                continue;
            }
            if message.attempt_count >= limit {
                tracing::info!(
                    peer = self.peer.short(),
                    id = message.identifier,
                    attempts = message.attempt_count,
                    "giving up on message"
                );
                message.status = MessageStatus::Error;
            } else {
                message.status = MessageStatus::Queued;
                requeued = true;
            }
        }
        requeued
    }

    /// Outgoing file messages that are still waiting on the peer.
    pub fn pending_file_ids(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| {
                m.direction == Direction::Outbound
                    && matches!(m.kind, MessageKind::File(_))
                    && matches!(m.status, MessageStatus::Queued | MessageStatus::Sending)
            })
            .map(|m| m.identifier)
            .collect()
    }

    // ── Incoming ─────────────────────────────────────────────────────────────

    /// Record a message from the peer. Returns false if it was a duplicate.
    pub fn message_received(&mut self, id: MessageId, text: &str, timestamp: u64) -> bool {
        for message in self.messages.iter().take(RECENT_WINDOW) {
            if message.status == MessageStatus::Delivered {
                break;
            }
            if message.direction == Direction::Inbound
                && message.identifier == id
                && message.text() == Some(text)
            {
                tracing::debug!(peer = self.peer.short(), id, "dropping duplicate message");
                return false;
            }
        }

        self.insert_received(MessageData {
            identifier: id,
            kind: MessageKind::Text(text.to_string()),
            timestamp,
            direction: Direction::Inbound,
            status: MessageStatus::Received,
            attempt_count: 0,
        });
        self.callbacks
            .on_message_received(&self.peer, timestamp, id, text.as_bytes());
        true
    }

    /// Record a file the peer sent us.
    pub fn file_received(&mut self, id: MessageId, path: &Path) {
        self.insert_received(MessageData {
            identifier: id,
            kind: MessageKind::File(path.to_path_buf()),
            timestamp: now_millis(),
            direction: Direction::Inbound,
            status: MessageStatus::Received,
            attempt_count: 0,
        });
        self.callbacks.on_file_received(&self.peer, id, path);
    }

    /// Inbound messages go above the newest block of unacknowledged sends,
    /// since the peer had not seen those yet.
    fn insert_received(&mut self, message: MessageData) {
        let row = self
            .messages
            .iter()
            .take(RECENT_WINDOW)
            .position(|m| !matches!(m.status, MessageStatus::Sending | MessageStatus::Queued))
            .unwrap_or(0);
        self.messages.insert(row, message);
        self.unread_count += 1;
        self.prune();
    }

    /// The peer acknowledged one of our chat messages.
    pub fn message_acknowledged(&mut self, id: MessageId, accepted: bool) -> bool {
        self.acknowledge(id, accepted, |kind| matches!(kind, MessageKind::Text(_)))
    }

    /// An outgoing file transfer ended, delivered or not.
    pub fn file_acknowledged(&mut self, id: MessageId, accepted: bool) -> bool {
        self.acknowledge(id, accepted, |kind| matches!(kind, MessageKind::File(_)))
    }

    fn acknowledge(
        &mut self,
        id: MessageId,
        accepted: bool,
        matches_kind: impl Fn(&MessageKind) -> bool,
    ) -> bool {
        let Some(message) = self.messages.iter_mut().find(|m| {
            m.direction == Direction::Outbound && m.identifier == id && matches_kind(&m.kind)
        }) else {
            tracing::debug!(peer = self.peer.short(), id, "ack for unknown message");
            return false;
        };
        message.status = if accepted {
            MessageStatus::Delivered
        } else {
            MessageStatus::Error
        };
        self.callbacks
            .on_message_acknowledged(&self.peer, id, accepted);
        true
    }

    // ── Housekeeping ─────────────────────────────────────────────────────────

    fn prune(&mut self) {
        let limit = self.settings.history_limit;
        if self.messages.len() > limit {
            tracing::trace!(
                peer = self.peer.short(),
                dropped = self.messages.len() - limit,
                "pruning history"
            );
            self.messages.truncate(limit);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.unread_count = 0;
    }

    pub fn unread_count(&self) -> usize {
        self.unread_count
    }

    pub fn reset_unread_count(&mut self) {
        self.unread_count = 0;
    }

    /// Snapshot, newest first.
    pub fn messages(&self) -> Vec<MessageData> {
        self.messages.iter().cloned().collect()
    }

    pub fn message(&self, id: MessageId) -> Option<&MessageData> {
        self.messages.iter().find(|m| m.identifier == id)
    }
}
