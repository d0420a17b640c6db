//! burrow-loopback — two Burrow peers in one process.
//!
//! Alice and Bob are wired together over in-memory queues. Alice sends Bob a
//! chat message and, if a path is given, a file; the run ends once Bob has
//! everything and Alice has seen the acknowledgements.
//!
//!   RUST_LOG=debug burrow-loopback [FILE]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use burrow_core::config::BurrowConfig;
use burrow_core::wire::{Direction, FileId, MessageId};
use burrow_services::{loopback_pair, ConversationRegistry, EventCallbacks, PeerId};

const ALICE: &str = "alicealicealicealicealicealicealicealicealicealicealice.onion";
const BOB: &str = "bobbobbobbobbobbobbobbobbobbobbobbobbobbobbobbobbobbobbob.onion";

/// What the run is waiting for.
#[derive(Debug)]
enum Outcome {
    Acknowledged(MessageId, bool),
    FileReceived(PathBuf),
    FileFailed(String),
}

/// Logs every event and forwards the ones `main` waits on.
struct Node {
    name: &'static str,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl EventCallbacks for Node {
    fn on_message_received(&self, peer: &PeerId, timestamp: u64, id: MessageId, text: &[u8]) {
        tracing::info!(
            node = self.name,
            from = peer.short(),
            id,
            timestamp,
            text = %String::from_utf8_lossy(text),
            "message received"
        );
    }

    fn on_message_acknowledged(&self, peer: &PeerId, id: MessageId, accepted: bool) {
        tracing::info!(node = self.name, to = peer.short(), id, accepted, "message acknowledged");
        let _ = self.outcomes.send(Outcome::Acknowledged(id, accepted));
    }

    fn on_file_received(&self, peer: &PeerId, file_id: FileId, path: &Path) {
        tracing::info!(
            node = self.name,
            from = peer.short(),
            file_id,
            path = %path.display(),
            "file received"
        );
        let _ = self.outcomes.send(Outcome::FileReceived(path.to_path_buf()));
    }

    fn on_file_receive_failed(&self, peer: &PeerId, file_id: FileId, reason: &str) {
        tracing::warn!(node = self.name, from = peer.short(), file_id, reason, "file receive failed");
        let _ = self.outcomes.send(Outcome::FileFailed(reason.to_string()));
    }

    fn on_file_transfer_progress(
        &self,
        _peer: &PeerId,
        file_id: FileId,
        direction: Direction,
        bytes_done: u64,
        bytes_total: u64,
    ) {
        tracing::debug!(node = self.name, file_id, ?direction, bytes_done, bytes_total, "progress");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = BurrowConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BurrowConfig::default()
    });
    let file = std::env::args().nth(1).map(PathBuf::from);
    tracing::info!(
        downloads = %config.transfer.downloads_dir.display(),
        staging = %config.transfer.staging_root.display(),
        "burrow-loopback starting"
    );

    let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
    let alice = ConversationRegistry::new(
        config.clone(),
        Arc::new(Node {
            name: "alice",
            outcomes: outcomes_tx.clone(),
        }),
    );
    let bob = ConversationRegistry::new(
        config,
        Arc::new(Node {
            name: "bob",
            outcomes: outcomes_tx,
        }),
    );

    let to_bob = alice.get_or_spawn(&PeerId::new(BOB));
    let to_alice = bob.get_or_spawn(&PeerId::new(ALICE));

    // queued first, delivered once the link comes up
    let message_id = to_bob
        .send_message("hello from alice")
        .await
        .context("failed to queue message")?;
    let file_id = match &file {
        Some(path) => Some(
            to_bob
                .send_file(path)
                .await
                .context("failed to queue file")?,
        ),
        None => None,
    };

    loopback_pair(&to_bob, &to_alice);

    let mut message_acked = false;
    let mut file_acked = file_id.is_none();
    let mut file_received = file_id.is_none();
    let wait = async {
        while !(message_acked && file_acked && file_received) {
            match outcomes.recv().await {
                Some(Outcome::Acknowledged(id, accepted)) => {
                    if !accepted {
                        anyhow::bail!("message {id} was refused");
                    }
                    if id == message_id {
                        message_acked = true;
                    } else if Some(id) == file_id {
                        file_acked = true;
                    }
                }
                Some(Outcome::FileReceived(path)) => {
                    println!("bob saved {}", path.display());
                    file_received = true;
                }
                Some(Outcome::FileFailed(reason)) => anyhow::bail!("file transfer failed: {reason}"),
                None => anyhow::bail!("event stream closed"),
            }
        }
        Ok(())
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .context("timed out waiting for delivery")??;

    for message in to_alice.messages().await {
        println!("bob has {:?} message {} ({:?})", message.direction, message.identifier, message.kind);
    }

    alice.shutdown();
    bob.shutdown();
    // let peer tasks clean up staging before the runtime goes away
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
