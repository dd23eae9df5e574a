//! Active-peer registry
//!
//! The set of peers currently usable for routing. Routing and dispatch only
//! ever take the read lock; the write lock is taken by each peer's own state
//! machine when it transitions into or out of OPEN. A peer must be removed
//! before its connection context is destroyed so a concurrent reader never
//! observes a peer about to lose its transport.

use tokio::sync::RwLock;

use crate::error::{AgentError, AgentResult};
use crate::peer::PeerHandle;

/// Read-write-locked set of open peers
#[derive(Default)]
pub struct ActivePeers {
    peers: RwLock<Vec<PeerHandle>>,
}

impl ActivePeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer entering OPEN. A peer must never appear twice.
    pub async fn insert(&self, handle: PeerHandle) -> AgentResult<()> {
        let mut peers = self.peers.write().await;
        if peers.contains(&handle) {
            return Err(AgentError::Protocol(format!(
                "peer {handle} already in the active set"
            )));
        }
        peers.push(handle);
        Ok(())
    }

    /// Remove a peer leaving OPEN. Returns whether it was present.
    pub async fn remove(&self, handle: PeerHandle) -> bool {
        let mut peers = self.peers.write().await;
        match peers.iter().position(|h| *h == handle) {
            Some(pos) => {
                peers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether the peer is currently usable for routing
    pub async fn contains(&self, handle: PeerHandle) -> bool {
        self.peers.read().await.contains(&handle)
    }

    /// Snapshot of the active set, for routing decisions
    pub async fn snapshot(&self) -> Vec<PeerHandle> {
        self.peers.read().await.clone()
    }

    /// Number of peers usable for routing
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether no peer is usable for routing
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
