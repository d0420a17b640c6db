//! Burrow integration test harness.
//!
//! Tests here drive real peer tasks on a tokio runtime. Peers talk over
//! in-memory queues, either to each other (`Pair`) or to a test acting as the
//! remote side by hand (`ManualLink`).
//!
//!   cargo test --test integration
//!
//! Each test gets its own scratch directory for staging and downloads.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use burrow_core::config::BurrowConfig;
use burrow_core::wire::{
    ChannelResult, ControlPacket, Direction, Envelope, FileId, Frame, MessageId, CONTROL_CHANNEL,
};
use burrow_services::{
    loopback_pair, ConnectionPurpose, EventCallbacks, PeerHandle, PeerId, PeerTask, Role,
};

mod failures;
mod files;
mod messaging;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const ALICE: &str = "alicexxxxxxxxxxx.onion";
pub const BOB: &str = "bobxxxxxxxxxxxxx.onion";

/// Everything a peer reported through its callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Received(MessageId, String),
    Acked(MessageId, bool),
    FileReceived(FileId, PathBuf),
    FileFailed(FileId),
    Progress(FileId, Direction, u64),
}

#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn has(&self, event: &Seen) -> bool {
        self.seen.lock().unwrap().contains(event)
    }

    pub fn received_file(&self, file_id: FileId) -> Option<PathBuf> {
        self.seen().into_iter().find_map(|e| match e {
            Seen::FileReceived(id, path) if id == file_id => Some(path),
            _ => None,
        })
    }

    fn push(&self, event: Seen) {
        self.seen.lock().unwrap().push(event);
    }
}

impl EventCallbacks for Recorder {
    fn on_message_received(&self, _peer: &PeerId, _ts: u64, id: MessageId, text: &[u8]) {
        self.push(Seen::Received(id, String::from_utf8_lossy(text).into_owned()));
    }

    fn on_message_acknowledged(&self, _peer: &PeerId, id: MessageId, accepted: bool) {
        self.push(Seen::Acked(id, accepted));
    }

    fn on_file_received(&self, _peer: &PeerId, file_id: FileId, path: &std::path::Path) {
        self.push(Seen::FileReceived(file_id, path.to_path_buf()));
    }

    fn on_file_receive_failed(&self, _peer: &PeerId, file_id: FileId, _reason: &str) {
        self.push(Seen::FileFailed(file_id));
    }

    fn on_file_transfer_progress(
        &self,
        _peer: &PeerId,
        file_id: FileId,
        direction: Direction,
        bytes_done: u64,
        _bytes_total: u64,
    ) {
        self.push(Seen::Progress(file_id, direction, bytes_done));
    }
}

/// Poll `check` until it holds. Panics after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll an async query until it returns true.
pub async fn wait_until_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Per-test directory tree, removed on drop.
pub struct Scratch {
    pub root: PathBuf,
}

impl Scratch {
    pub fn new(test: &str) -> Self {
        let root = std::env::temp_dir().join(format!("burrow-it-{}-{}", test, std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    /// Config for the peer called `name`, with its own staging and downloads.
    pub fn config(&self, name: &str) -> BurrowConfig {
        let mut config = BurrowConfig::default();
        config.transfer.staging_root = self.root.join(name).join("staging");
        config.transfer.downloads_dir = self.root.join(name).join("downloads");
        config
    }

    pub fn file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

/// Alice's view of Bob and Bob's view of Alice, each with its own task.
pub struct Pair {
    pub alice: PeerHandle,
    pub bob: PeerHandle,
    pub alice_seen: Arc<Recorder>,
    pub bob_seen: Arc<Recorder>,
    shutdown: broadcast::Sender<()>,
}

impl Pair {
    pub fn spawn(alice_config: &BurrowConfig, bob_config: &BurrowConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let alice_seen = Arc::new(Recorder::default());
        let bob_seen = Arc::new(Recorder::default());
        let alice = PeerTask::spawn(
            PeerId::new(BOB),
            alice_config,
            alice_seen.clone(),
            shutdown.subscribe(),
        );
        let bob = PeerTask::spawn(
            PeerId::new(ALICE),
            bob_config,
            bob_seen.clone(),
            shutdown.subscribe(),
        );
        Self {
            alice,
            bob,
            alice_seen,
            bob_seen,
            shutdown,
        }
    }

    pub fn connect(&self) {
        loopback_pair(&self.alice, &self.bob);
    }

    pub fn disconnect(&self) {
        self.alice.disconnected();
        self.bob.disconnected();
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// A connection where the test plays the remote peer by hand.
pub struct ManualLink {
    rx: mpsc::UnboundedReceiver<Bytes>,
    handle: PeerHandle,
}

impl ManualLink {
    /// Connect `handle` to us. The peer under test dials (odd channel ids).
    pub fn connect(handle: &PeerHandle, purpose: ConnectionPurpose) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        handle.connected(purpose, Role::Initiator, Arc::new(tx));
        Self {
            rx,
            handle: handle.clone(),
        }
    }

    pub async fn next_frame(&mut self) -> Frame {
        let bytes = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("transport closed");
        let (frame, _) = Frame::decode(&bytes).unwrap().unwrap();
        frame
    }

    pub async fn next_control(&mut self) -> ControlPacket {
        let frame = self.next_frame().await;
        assert_eq!(frame.channel, CONTROL_CHANNEL, "expected a control packet");
        ControlPacket::from_bytes(&frame.payload).unwrap()
    }

    /// Expect an open request and accept it. Returns the channel id.
    pub async fn accept_channel(&mut self, protocol: &str) -> u16 {
        match self.next_control().await {
            ControlPacket::OpenChannel(open) => {
                assert_eq!(open.protocol, protocol);
                self.send(
                    CONTROL_CHANNEL,
                    &ControlPacket::ChannelResult(ChannelResult {
                        channel_id: open.channel_id,
                        opened: true,
                        common_error: None,
                    }),
                );
                open.channel_id
            }
            other => panic!("expected open request, got {other:?}"),
        }
    }

    pub fn send<E: Envelope>(&self, channel: u16, packet: &E) {
        self.handle
            .deliver_frame(Frame::new(channel, packet.to_bytes().unwrap()));
    }

    /// True if nothing arrives within a short grace period.
    pub async fn is_quiet(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(200), self.rx.recv())
            .await
            .is_err()
    }
}
