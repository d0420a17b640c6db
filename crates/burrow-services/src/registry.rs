//! Conversation registry — one peer task per peer, created on first use.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use burrow_core::config::BurrowConfig;

use crate::callbacks::EventCallbacks;
use crate::peer::PeerId;
use crate::peer_task::{PeerHandle, PeerTask};

/// Shared across all tasks. Cloning shares the same table.
#[derive(Clone)]
pub struct ConversationRegistry {
    peers: Arc<DashMap<PeerId, PeerHandle>>,
    config: Arc<BurrowConfig>,
    callbacks: Arc<dyn EventCallbacks>,
    shutdown: broadcast::Sender<()>,
}

impl ConversationRegistry {
    pub fn new(config: BurrowConfig, callbacks: Arc<dyn EventCallbacks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            peers: Arc::new(DashMap::new()),
            config: Arc::new(config),
            callbacks,
            shutdown,
        }
    }

    /// Handle for `peer`, spawning its task if this is the first time we
    /// hear of it. Must be called from within a tokio runtime.
    pub fn get_or_spawn(&self, peer: &PeerId) -> PeerHandle {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| {
                tracing::debug!(peer = peer.short(), "starting peer task");
                PeerTask::spawn(
                    peer.clone(),
                    &self.config,
                    self.callbacks.clone(),
                    self.shutdown.subscribe(),
                )
            })
            .clone()
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerHandle> {
        self.peers.get(peer).map(|entry| entry.value().clone())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Stop every peer task.
    pub fn shutdown(&self) {
        tracing::info!(peers = self.peers.len(), "shutting down conversations");
        let _ = self.shutdown.send(());
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::wire::MessageId;

    struct Quiet;

    impl EventCallbacks for Quiet {
        fn on_message_received(&self, _: &PeerId, _: u64, _: MessageId, _: &[u8]) {}
        fn on_message_acknowledged(&self, _: &PeerId, _: MessageId, _: bool) {}
    }

    #[tokio::test]
    async fn peers_are_spawned_once() {
        let registry = ConversationRegistry::new(BurrowConfig::default(), Arc::new(Quiet));
        assert!(registry.is_empty());

        let peer = PeerId::new("someone.onion");
        let first = registry.get_or_spawn(&peer);
        first.send_message("queued").await.unwrap();

        let second = registry.get_or_spawn(&peer);
        assert_eq!(registry.len(), 1);
        // same context behind both handles
        assert_eq!(second.messages().await.len(), 1);
        assert!(registry.get(&PeerId::new("nobody.onion")).is_none());

        registry.shutdown();
        assert!(registry.is_empty());
    }
}
