//! Peer context — everything we know about one peer, behind one lock.
//!
//! The context owns the live [`Connection`] (if any), the [`Conversation`],
//! and the [`FileTransfers`]. It is the channel listener for its connection
//! and translates channel traffic into conversation and transfer updates.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use burrow_core::config::BurrowConfig;
use burrow_core::wire::{ChatPacket, Direction, Envelope, FilePacket, Frame, MessageId};

use crate::callbacks::EventCallbacks;
use crate::channel::{ChannelError, ChannelInfo, ChannelListener, Connection, Protocol};
use crate::chat::{ChatEvent, ChatProtocol};
use crate::conversation::{Conversation, MessageData, Outbox, SendError};
use crate::file_transfer::{FileTransfers, TransferEvent, TransferStep};
use crate::peer::{ConnectionPurpose, PeerId, Role};
use crate::peer_task::PeerEvent;
use crate::transport::FrameSink;

pub struct PeerContext {
    connection: Option<Connection>,
    state: PeerState,
}

/// Everything except the connection, so the connection can be borrowed
/// mutably while this acts as its listener.
struct PeerState {
    peer: PeerId,
    conversation: Conversation,
    transfers: FileTransfers,
    callbacks: Arc<dyn EventCallbacks>,
    scheduler: mpsc::UnboundedSender<PeerEvent>,
    drain_scheduled: bool,
}

impl PeerContext {
    pub fn new(
        peer: PeerId,
        config: &BurrowConfig,
        callbacks: Arc<dyn EventCallbacks>,
        scheduler: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            connection: None,
            state: PeerState {
                conversation: Conversation::new(
                    peer.clone(),
                    config.conversation.clone(),
                    callbacks.clone(),
                ),
                transfers: FileTransfers::new(peer.clone(), config.transfer.clone()),
                peer,
                callbacks,
                scheduler,
                drain_scheduled: false,
            },
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.state.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// A transport to the peer is up. Replaces any previous connection.
    pub fn connected(&mut self, purpose: ConnectionPurpose, role: Role, sink: Arc<dyn FrameSink>) {
        self.disconnected();
        tracing::info!(peer = self.state.peer.short(), ?purpose, ?role, "peer connected");
        self.connection = Some(Connection::new(self.state.peer.clone(), purpose, role, sink));
        self.send_queued();
    }

    pub fn disconnected(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            tracing::info!(peer = self.state.peer.short(), "peer disconnected");
            conn.invalidate_all(&mut self.state);
        }
    }

    /// Drop the connection and any half-received files.
    pub fn shutdown(&mut self) {
        self.disconnected();
        self.state.transfers.abandon_incoming();
    }

    pub fn handle_frame(&mut self, frame: Frame) {
        match self.connection.as_mut() {
            Some(conn) => conn.handle_frame(frame, &mut self.state),
            None => tracing::debug!(
                peer = self.state.peer.short(),
                channel = frame.channel,
                "frame without a connection, dropping"
            ),
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    pub fn send_message(&mut self, text: &str) -> Result<MessageId, SendError> {
        let mut outbox = ConnectionOutbox::new(self.connection.as_mut(), &mut self.state.transfers);
        self.state.conversation.send_message(text, &mut outbox)
    }

    pub fn send_file(&mut self, path: &Path) -> Result<MessageId, SendError> {
        let mut outbox = ConnectionOutbox::new(self.connection.as_mut(), &mut self.state.transfers);
        self.state.conversation.send_file(path, &mut outbox)
    }

    /// Deferred drain of the queue.
    pub fn send_queued(&mut self) {
        self.state.drain_scheduled = false;
        let mut outbox = ConnectionOutbox::new(self.connection.as_mut(), &mut self.state.transfers);
        self.state.conversation.send_queued(&mut outbox);
    }

    /// Periodic transfer housekeeping.
    pub fn sweep(&mut self, now: Instant) {
        let channel = self
            .connection
            .as_ref()
            .and_then(|conn| conn.opened_channel(Protocol::FileTransfer, Direction::Outbound));
        let step = self.state.transfers.sweep(now, channel.is_some());
        if let (Some(conn), Some(channel)) = (self.connection.as_mut(), channel) {
            for packet in &step.packets {
                if let Err(e) = conn.send_packet(channel, Direction::Outbound, packet) {
                    tracing::debug!(error = %e, "failed to resend file packet");
                }
            }
        }
        self.state.apply_transfer_events(step.events);
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn messages(&self) -> Vec<MessageData> {
        self.state.conversation.messages()
    }

    pub fn unread_count(&self) -> usize {
        self.state.conversation.unread_count()
    }

    pub fn reset_unread_count(&mut self) {
        self.state.conversation.reset_unread_count();
    }

    pub fn clear(&mut self) {
        self.state.conversation.clear();
    }
}

impl PeerState {
    /// Post a drain to the peer's event queue instead of recursing into the
    /// conversation from a channel callback.
    fn schedule_drain(&mut self) {
        if self.drain_scheduled {
            return;
        }
        self.drain_scheduled = true;
        if self.scheduler.send(PeerEvent::SendQueued).is_err() {
            tracing::debug!(peer = self.peer.short(), "peer task gone, drain not scheduled");
        }
    }

    fn apply_transfer_events(&mut self, events: Vec<TransferEvent>) {
        for event in events {
            match event {
                TransferEvent::Delivered { file_id } => {
                    self.conversation.file_acknowledged(file_id, true);
                }
                TransferEvent::SendFailed { file_id, reason } => {
                    tracing::warn!(peer = self.peer.short(), file_id, %reason, "file send failed");
                    self.transfers.cancel_outgoing(file_id);
                    self.conversation.file_acknowledged(file_id, false);
                }
                TransferEvent::Received { file_id, path, .. } => {
                    self.conversation.file_received(file_id, &path);
                }
                TransferEvent::ReceiveFailed { file_id, reason } => {
                    self.callbacks
                        .on_file_receive_failed(&self.peer, file_id, &reason);
                }
                TransferEvent::Progress {
                    file_id,
                    direction,
                    bytes_done,
                    bytes_total,
                } => {
                    self.callbacks.on_file_transfer_progress(
                        &self.peer,
                        file_id,
                        direction,
                        bytes_done,
                        bytes_total,
                    );
                }
            }
        }
    }

    fn handle_chat(
        &mut self,
        conn: &mut Connection,
        channel: ChannelInfo,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let packet = ChatPacket::from_bytes(payload)?;
        let event = ChatProtocol::handle_inbound(channel.direction, packet)
            .map_err(|e| ChannelError::ProtocolViolation(e.to_string()))?;
        match event {
            ChatEvent::Received {
                id,
                text,
                timestamp,
                accepted,
            } => {
                if accepted {
                    self.conversation.message_received(id, &text, timestamp);
                }
                conn.send_packet(channel, Direction::Inbound, &ChatProtocol::ack(id, accepted))?;
            }
            ChatEvent::Acknowledged { id, accepted } => {
                self.conversation.message_acknowledged(id, accepted);
            }
        }
        Ok(())
    }

    fn handle_file(
        &mut self,
        conn: &mut Connection,
        channel: ChannelInfo,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let packet = FilePacket::from_bytes(payload)?;
        let TransferStep { packets, events } = self
            .transfers
            .handle_inbound(channel.direction, packet, Instant::now())
            .map_err(|e| ChannelError::ProtocolViolation(e.to_string()))?;
        // replies travel back on the channel the request came in on
        for reply in &packets {
            conn.send_packet(channel, channel.direction, reply)?;
        }
        self.apply_transfer_events(events);
        Ok(())
    }
}

impl ChannelListener for PeerState {
    fn on_opened(&mut self, conn: &mut Connection, channel: ChannelInfo) {
        if channel.direction != Direction::Outbound {
            return;
        }
        let mut outbox = ConnectionOutbox::new(Some(conn), &mut self.transfers);
        self.conversation.send_queued(&mut outbox);
    }

    fn on_invalidated(&mut self, _conn: &mut Connection, channel: ChannelInfo) {
        if channel.direction != Direction::Outbound {
            return;
        }
        let requeued = match channel.protocol {
            Protocol::Chat => self.conversation.outbound_chat_closed(),
            Protocol::FileTransfer => {
                let requeued = self.conversation.outbound_file_closed();
                let pending = self.conversation.pending_file_ids();
                self.transfers.retain_outgoing(&pending);
                requeued
            }
        };
        if requeued {
            self.schedule_drain();
        }
    }

    fn on_message(
        &mut self,
        conn: &mut Connection,
        channel: ChannelInfo,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        match channel.protocol {
            Protocol::Chat => self.handle_chat(conn, channel, payload),
            Protocol::FileTransfer => self.handle_file(conn, channel, payload),
        }
    }
}

/// [`Outbox`] over the live connection. Asking whether a channel is ready
/// starts opening it if none exists.
struct ConnectionOutbox<'a> {
    conn: Option<&'a mut Connection>,
    transfers: &'a mut FileTransfers,
}

impl<'a> ConnectionOutbox<'a> {
    fn new(conn: Option<&'a mut Connection>, transfers: &'a mut FileTransfers) -> Self {
        Self { conn, transfers }
    }

    fn ready(&mut self, protocol: Protocol) -> bool {
        let Some(conn) = self.conn.as_deref_mut() else {
            return false;
        };
        if !conn.is_connected() {
            return false;
        }
        if conn.opened_channel(protocol, Direction::Outbound).is_some() {
            return true;
        }
        if conn.find_channel(protocol, Direction::Outbound).is_none() {
            if let Err(e) = conn.open_channel(protocol) {
                tracing::debug!(protocol = protocol.name(), error = %e, "cannot open channel");
            }
        }
        false
    }

    fn channel(&mut self, protocol: Protocol) -> anyhow::Result<(&mut Connection, ChannelInfo)> {
        let conn = self
            .conn
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("not connected"))?;
        let channel = conn
            .opened_channel(protocol, Direction::Outbound)
            .ok_or_else(|| anyhow::anyhow!("no open {} channel", protocol.name()))?;
        Ok((conn, channel))
    }
}

impl Outbox for ConnectionOutbox<'_> {
    fn chat_ready(&mut self) -> bool {
        self.ready(Protocol::Chat)
    }

    fn file_ready(&mut self) -> bool {
        self.ready(Protocol::FileTransfer)
    }

    fn send_chat(&mut self, id: MessageId, text: &str, timestamp: u64) -> anyhow::Result<()> {
        let (conn, channel) = self.channel(Protocol::Chat)?;
        conn.send_packet(channel, Direction::Outbound, &ChatProtocol::message(text, id, timestamp))?;
        Ok(())
    }

    fn send_file(&mut self, id: MessageId, path: &Path) -> anyhow::Result<()> {
        let packet = self.transfers.send_file_with_id(id, path, Instant::now())?;
        let (conn, channel) = self.channel(Protocol::FileTransfer)?;
        conn.send_packet(channel, Direction::Outbound, &packet)?;
        Ok(())
    }
}
