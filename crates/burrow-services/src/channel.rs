//! Channels — typed logical streams multiplexed over one peer connection.
//!
//! A channel is opened by one side (Outbound for it) and accepted by the
//! other (Inbound for it). A connection hosts at most one channel per
//! (protocol, direction). The opener asks over the control channel; the
//! receiver authorizes and answers with a ChannelResult.
//!
//! State changes are reported through [`ChannelListener`]. The listener is
//! handed the connection back so it can send in response without the
//! connection holding a reference to its observer.

use std::collections::HashMap;
use std::sync::Arc;

use burrow_core::wire::{
    ChannelId, ChannelResult, CloseChannel, CommonError, ControlPacket, Direction, Envelope,
    Frame, OpenChannel, WireError, CHAT_PROTOCOL, CONTROL_CHANNEL, FILE_PROTOCOL,
};

use crate::peer::{ConnectionPurpose, PeerId, Role};
use crate::transport::{FrameSink, TransportError};

/// Application protocols that can run on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Chat,
    FileTransfer,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chat => CHAT_PROTOCOL,
            Self::FileTransfer => FILE_PROTOCOL,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            CHAT_PROTOCOL => Some(Self::Chat),
            FILE_PROTOCOL => Some(Self::FileTransfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open request sent, waiting for the peer's ChannelResult.
    Opening,
    Opened,
}

/// Identity of a channel as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub protocol: Protocol,
    pub direction: Direction,
}

struct Channel {
    info: ChannelInfo,
    state: ChannelState,
}

/// Observer for channel lifecycle and traffic.
pub trait ChannelListener {
    /// The channel is usable in both directions.
    fn on_opened(&mut self, conn: &mut Connection, channel: ChannelInfo);

    /// The channel was rejected, closed, or lost with its connection.
    fn on_invalidated(&mut self, conn: &mut Connection, channel: ChannelInfo);

    /// A payload arrived on an opened channel. An error is treated as a
    /// protocol violation and closes the channel.
    fn on_message(
        &mut self,
        conn: &mut Connection,
        channel: ChannelInfo,
        payload: &[u8],
    ) -> Result<(), ChannelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{} channel already exists in direction {direction:?}", protocol.name())]
    AlreadyOpen {
        protocol: Protocol,
        direction: Direction,
    },
    #[error("connection purpose {purpose:?} does not allow {} channels", protocol.name())]
    Unauthorized {
        protocol: Protocol,
        purpose: ConnectionPurpose,
    },
    #[error("no free channel ids")]
    IdsExhausted,
    #[error("channel {0} is not open")]
    NotOpen(ChannelId),
    #[error("connection is closed")]
    Disconnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// One authenticated connection to a peer and the channels running on it.
pub struct Connection {
    peer: PeerId,
    purpose: ConnectionPurpose,
    role: Role,
    sink: Arc<dyn FrameSink>,
    channels: HashMap<ChannelId, Channel>,
    next_id: ChannelId,
    connected: bool,
}

impl Connection {
    pub fn new(
        peer: PeerId,
        purpose: ConnectionPurpose,
        role: Role,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let next_id = match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        };
        Self {
            peer,
            purpose,
            role,
            sink,
            channels: HashMap::new(),
            next_id,
            connected: true,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn purpose(&self) -> ConnectionPurpose {
        self.purpose
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Any channel for (protocol, direction), opened or still opening.
    pub fn find_channel(&self, protocol: Protocol, direction: Direction) -> Option<ChannelInfo> {
        self.find(protocol, direction).map(|c| c.info)
    }

    /// The channel for (protocol, direction) if it has finished opening.
    pub fn opened_channel(&self, protocol: Protocol, direction: Direction) -> Option<ChannelInfo> {
        self.find(protocol, direction)
            .filter(|c| c.state == ChannelState::Opened)
            .map(|c| c.info)
    }

    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channels.get(&id).map(|c| c.state)
    }

    fn find(&self, protocol: Protocol, direction: Direction) -> Option<&Channel> {
        self.channels
            .values()
            .find(|c| c.info.protocol == protocol && c.info.direction == direction)
    }

    // ── Opening ──────────────────────────────────────────────────────────────

    /// Ask the peer to open an outbound channel for `protocol`.
    ///
    /// The channel starts in `Opening`; the listener hears `on_opened` or
    /// `on_invalidated` once the peer answers.
    pub fn open_channel(&mut self, protocol: Protocol) -> Result<ChannelId, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Disconnected);
        }
        self.allow_outbound(protocol)?;

        let id = self.allocate_id()?;
        self.send_control(&ControlPacket::OpenChannel(OpenChannel {
            channel_id: id,
            protocol: protocol.name().to_string(),
            direction: Direction::Outbound,
        }))?;
        self.channels.insert(
            id,
            Channel {
                info: ChannelInfo {
                    id,
                    protocol,
                    direction: Direction::Outbound,
                },
                state: ChannelState::Opening,
            },
        );
        tracing::debug!(
            peer = self.peer.short(),
            channel = id,
            protocol = protocol.name(),
            "requested outbound channel"
        );
        Ok(id)
    }

    /// Local precondition for opening. Failing it means our own code asked
    /// for something it should never ask for, so it is logged as a bug.
    fn allow_outbound(&self, protocol: Protocol) -> Result<(), ChannelError> {
        if self.find(protocol, Direction::Outbound).is_some() {
            tracing::error!(
                peer = self.peer.short(),
                protocol = protocol.name(),
                "BUG: rejecting outbound request, a channel of this type is already open"
            );
            return Err(ChannelError::AlreadyOpen {
                protocol,
                direction: Direction::Outbound,
            });
        }
        if self.purpose != ConnectionPurpose::KnownContact {
            tracing::error!(
                peer = self.peer.short(),
                protocol = protocol.name(),
                purpose = ?self.purpose,
                "BUG: rejecting outbound request for connection with unexpected purpose"
            );
            return Err(ChannelError::Unauthorized {
                protocol,
                purpose: self.purpose,
            });
        }
        Ok(())
    }

    /// Authorization for a peer's open request.
    fn allow_inbound(&self, protocol: Protocol) -> Result<(), CommonError> {
        if self.purpose != ConnectionPurpose::KnownContact {
            tracing::debug!(
                peer = self.peer.short(),
                protocol = protocol.name(),
                purpose = ?self.purpose,
                "rejecting channel request from connection that is not a known contact"
            );
            return Err(CommonError::Unauthorized);
        }
        if self.find(protocol, Direction::Inbound).is_some() {
            tracing::debug!(
                peer = self.peer.short(),
                protocol = protocol.name(),
                "rejecting channel request, one is already open"
            );
            return Err(CommonError::Failed);
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> Result<ChannelId, ChannelError> {
        // ids of our parity, skipping 0 and anything in use
        for _ in 0..(u16::MAX / 2) {
            let candidate = self.next_id;
            self.next_id = match self.next_id.checked_add(2) {
                Some(n) => n,
                None => match self.role {
                    Role::Initiator => 1,
                    Role::Responder => 2,
                },
            };
            if !self.channels.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ChannelError::IdsExhausted)
    }

    fn is_peer_channel_id(&self, id: ChannelId) -> bool {
        match self.role {
            Role::Initiator => id % 2 == 0,
            Role::Responder => id % 2 == 1,
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Send an envelope on an opened channel.
    ///
    /// `required` is the direction the protocol allows this packet on.
    /// Anything else is a defect in the caller.
    pub fn send_packet<E: Envelope>(
        &mut self,
        channel: ChannelInfo,
        required: Direction,
        packet: &E,
    ) -> Result<(), ChannelError> {
        assert_eq!(
            channel.direction, required,
            "BUG: attempted to send {} packet on a channel of the wrong direction",
            channel.protocol.name()
        );
        if !self.connected {
            return Err(ChannelError::Disconnected);
        }
        match self.channels.get(&channel.id) {
            Some(c) if c.state == ChannelState::Opened => {}
            _ => return Err(ChannelError::NotOpen(channel.id)),
        }
        let payload = packet.to_bytes()?;
        self.sink.send_frame(&Frame::new(channel.id, payload))?;
        Ok(())
    }

    fn send_control(&self, packet: &ControlPacket) -> Result<(), ChannelError> {
        let payload = packet.to_bytes()?;
        self.sink
            .send_frame(&Frame::new(CONTROL_CHANNEL, payload))?;
        Ok(())
    }

    // ── Closing ──────────────────────────────────────────────────────────────

    /// Close a channel locally and tell the peer.
    pub fn close_channel(&mut self, id: ChannelId, listener: &mut dyn ChannelListener) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        if self.connected {
            if let Err(e) = self.send_control(&ControlPacket::CloseChannel(CloseChannel {
                channel_id: id,
            })) {
                tracing::debug!(channel = id, error = %e, "failed to send channel close");
            }
        }
        tracing::debug!(
            peer = self.peer.short(),
            channel = id,
            protocol = channel.info.protocol.name(),
            "channel closed"
        );
        listener.on_invalidated(self, channel.info);
    }

    /// The transport is gone: every channel is invalidated.
    pub fn invalidate_all(&mut self, listener: &mut dyn ChannelListener) {
        self.connected = false;
        let mut lost: Vec<ChannelInfo> = self.channels.drain().map(|(_, c)| c.info).collect();
        lost.sort_by_key(|c| c.id);
        for info in lost {
            listener.on_invalidated(self, info);
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Route one inbound frame.
    pub fn handle_frame(&mut self, frame: Frame, listener: &mut dyn ChannelListener) {
        if frame.channel == CONTROL_CHANNEL {
            match ControlPacket::from_bytes(&frame.payload) {
                Ok(packet) => self.handle_control(packet, listener),
                Err(e) => {
                    tracing::warn!(
                        peer = self.peer.short(),
                        error = %e,
                        "malformed control packet, dropping connection"
                    );
                    self.invalidate_all(listener);
                }
            }
            return;
        }

        let info = match self.channels.get(&frame.channel) {
            Some(c) if c.state == ChannelState::Opened => c.info,
            Some(_) => {
                tracing::warn!(channel = frame.channel, "packet on channel that is not open yet");
                return;
            }
            None => {
                tracing::debug!(channel = frame.channel, "packet for unknown channel, dropping");
                return;
            }
        };

        if let Err(e) = listener.on_message(self, info, &frame.payload) {
            tracing::warn!(
                peer = self.peer.short(),
                channel = info.id,
                protocol = info.protocol.name(),
                error = %e,
                "closing channel"
            );
            self.close_channel(info.id, listener);
        }
    }

    fn handle_control(&mut self, packet: ControlPacket, listener: &mut dyn ChannelListener) {
        match packet {
            ControlPacket::OpenChannel(request) => self.handle_open_request(request, listener),
            ControlPacket::ChannelResult(result) => self.handle_channel_result(result, listener),
            ControlPacket::CloseChannel(close) => {
                if let Some(channel) = self.channels.remove(&close.channel_id) {
                    tracing::debug!(
                        peer = self.peer.short(),
                        channel = close.channel_id,
                        "peer closed channel"
                    );
                    listener.on_invalidated(self, channel.info);
                }
            }
        }
    }

    fn handle_open_request(&mut self, request: OpenChannel, listener: &mut dyn ChannelListener) {
        let id = request.channel_id;
        let verdict = match Protocol::from_name(&request.protocol) {
            None => Err(CommonError::UnknownType),
            Some(_)
                if request.direction != Direction::Outbound
                    || id == CONTROL_CHANNEL
                    || !self.is_peer_channel_id(id)
                    || self.channels.contains_key(&id) =>
            {
                Err(CommonError::BadUsage)
            }
            Some(protocol) => self.allow_inbound(protocol).map(|_| protocol),
        };

        let protocol = match verdict {
            Ok(p) => p,
            Err(error) => {
                tracing::debug!(
                    peer = self.peer.short(),
                    channel = id,
                    protocol = %request.protocol,
                    ?error,
                    "rejected channel request"
                );
                let reply = ControlPacket::ChannelResult(ChannelResult {
                    channel_id: id,
                    opened: false,
                    common_error: Some(error),
                });
                if let Err(e) = self.send_control(&reply) {
                    tracing::debug!(error = %e, "failed to send channel rejection");
                }
                return;
            }
        };

        let reply = ControlPacket::ChannelResult(ChannelResult {
            channel_id: id,
            opened: true,
            common_error: None,
        });
        if let Err(e) = self.send_control(&reply) {
            tracing::warn!(error = %e, "failed to accept channel request");
            return;
        }

        let info = ChannelInfo {
            id,
            protocol,
            direction: Direction::Inbound,
        };
        self.channels.insert(
            id,
            Channel {
                info,
                state: ChannelState::Opened,
            },
        );
        tracing::debug!(
            peer = self.peer.short(),
            channel = id,
            protocol = protocol.name(),
            "inbound channel opened"
        );
        listener.on_opened(self, info);
    }

    fn handle_channel_result(&mut self, result: ChannelResult, listener: &mut dyn ChannelListener) {
        let id = result.channel_id;
        let pending = matches!(
            self.channels.get(&id),
            Some(c) if c.state == ChannelState::Opening && c.info.direction == Direction::Outbound
        );
        if !pending {
            tracing::warn!(channel = id, "channel result for a channel we are not opening");
            return;
        }

        if result.opened {
            let Some(channel) = self.channels.get_mut(&id) else {
                return;
            };
            channel.state = ChannelState::Opened;
            let info = channel.info;
            tracing::debug!(
                peer = self.peer.short(),
                channel = id,
                protocol = info.protocol.name(),
                "outbound channel opened"
            );
            listener.on_opened(self, info);
        } else if let Some(channel) = self.channels.remove(&id) {
            tracing::info!(
                peer = self.peer.short(),
                channel = id,
                protocol = channel.info.protocol.name(),
                error = ?result.common_error,
                "peer rejected channel"
            );
            listener.on_invalidated(self, channel.info);
        }
    }
}
