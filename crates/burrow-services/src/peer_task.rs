//! Peer task — the single event loop that drives one peer's context.
//!
//! Transport events, inbound frames, and deferred drains all arrive on one
//! queue and are handled one at a time, so no two protocol callbacks for the
//! same peer ever run concurrently.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, Mutex};

use burrow_core::config::BurrowConfig;
use burrow_core::wire::{Frame, MessageId};

use crate::callbacks::EventCallbacks;
use crate::context::PeerContext;
use crate::conversation::{MessageData, SendError};
use crate::peer::{ConnectionPurpose, PeerId, Role};
use crate::transport::FrameSink;

pub enum PeerEvent {
    Connected {
        purpose: ConnectionPurpose,
        role: Role,
        sink: Arc<dyn FrameSink>,
    },
    Disconnected,
    Frame(Frame),
    /// Drain the outgoing queue. Posted instead of draining from inside a
    /// channel callback.
    SendQueued,
}

pub struct PeerTask {
    context: Arc<Mutex<PeerContext>>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    shutdown: broadcast::Receiver<()>,
    sweep_interval: Duration,
}

impl PeerTask {
    /// Spawn the task for `peer` on the current runtime.
    pub fn spawn(
        peer: PeerId,
        config: &BurrowConfig,
        callbacks: Arc<dyn EventCallbacks>,
        shutdown: broadcast::Receiver<()>,
    ) -> PeerHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = Arc::new(Mutex::new(PeerContext::new(
            peer.clone(),
            config,
            callbacks,
            events_tx.clone(),
        )));
        let task = PeerTask {
            context: context.clone(),
            events: events_rx,
            shutdown,
            sweep_interval: config.transfer.sweep_interval(),
        };
        tokio::spawn(task.run());
        PeerHandle {
            peer,
            context,
            events: events_tx,
        }
    }

    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    let mut context = self.context.lock().await;
                    tracing::info!(peer = context.peer().short(), "peer task shutting down");
                    context.shutdown();
                    return;
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    self.handle(event).await;
                }

                _ = sweep.tick() => {
                    self.context.lock().await.sweep(Instant::now());
                }
            }
        }
    }

    async fn handle(&self, event: PeerEvent) {
        let mut context = self.context.lock().await;
        match event {
            PeerEvent::Connected {
                purpose,
                role,
                sink,
            } => context.connected(purpose, role, sink),
            PeerEvent::Disconnected => context.disconnected(),
            PeerEvent::Frame(frame) => context.handle_frame(frame),
            PeerEvent::SendQueued => context.send_queued(),
        }
    }
}

/// Application handle to a peer's task. Cheap to clone.
#[derive(Clone)]
pub struct PeerHandle {
    peer: PeerId,
    context: Arc<Mutex<PeerContext>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerHandle {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub async fn send_message(&self, text: &str) -> Result<MessageId, SendError> {
        self.context.lock().await.send_message(text)
    }

    pub async fn send_file(&self, path: &Path) -> Result<MessageId, SendError> {
        self.context.lock().await.send_file(path)
    }

    pub async fn messages(&self) -> Vec<MessageData> {
        self.context.lock().await.messages()
    }

    pub async fn unread_count(&self) -> usize {
        self.context.lock().await.unread_count()
    }

    pub async fn reset_unread_count(&self) {
        self.context.lock().await.reset_unread_count();
    }

    pub async fn clear(&self) {
        self.context.lock().await.clear();
    }

    pub async fn is_connected(&self) -> bool {
        self.context.lock().await.is_connected()
    }

    /// The transport to this peer is up.
    pub fn connected(&self, purpose: ConnectionPurpose, role: Role, sink: Arc<dyn FrameSink>) {
        self.post(PeerEvent::Connected {
            purpose,
            role,
            sink,
        });
    }

    pub fn disconnected(&self) {
        self.post(PeerEvent::Disconnected);
    }

    pub fn deliver_frame(&self, frame: Frame) {
        self.post(PeerEvent::Frame(frame));
    }

    fn post(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(peer = self.peer.short(), "peer task has exited");
        }
    }
}

/// Read raw transport bytes, split them into frames, and feed them to
/// `handle` until the transport closes or sends garbage. A clean close is
/// left for the transport owner to report.
pub async fn pump_frames(mut rx: mpsc::UnboundedReceiver<Bytes>, handle: PeerHandle) {
    let mut buf = BytesMut::new();
    while let Some(bytes) = rx.recv().await {
        buf.extend_from_slice(&bytes);
        loop {
            match Frame::decode(&buf) {
                Ok(Some((frame, used))) => {
                    buf.advance(used);
                    handle.deliver_frame(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = handle.peer().short(), error = %e, "bad frame, dropping connection");
                    handle.disconnected();
                    return;
                }
            }
        }
    }
    tracing::debug!(peer = handle.peer().short(), "transport closed");
}

/// Connect two local peers over in-memory queues. `initiator` is the side
/// that dialed; both see each other as known contacts.
pub fn loopback_pair(initiator: &PeerHandle, responder: &PeerHandle) {
    let (to_responder, from_initiator) = mpsc::unbounded_channel::<Bytes>();
    let (to_initiator, from_responder) = mpsc::unbounded_channel::<Bytes>();

    initiator.connected(ConnectionPurpose::KnownContact, Role::Initiator, Arc::new(to_responder));
    responder.connected(ConnectionPurpose::KnownContact, Role::Responder, Arc::new(to_initiator));

    tokio::spawn(pump_frames(from_initiator, responder.clone()));
    tokio::spawn(pump_frames(from_responder, initiator.clone()));
}
