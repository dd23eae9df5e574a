//! Global message queues
//!
//! Handoff points to the external routing and extension layers:
//! - incoming: decoded application messages from peers (handshake-internal
//!   messages never appear here), consumed by routing/dictionary
//! - outgoing: messages needing peer assignment, produced by routing and by
//!   failover, consumed by per-peer outbound queues
//! - local: messages for extension consumption
//!
//! All three are bounded; producers wait for space rather than dropping.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{AgentError, AgentResult};
use crate::message::Message;
use crate::peer::PeerHandle;

/// One message on the global outgoing queue, optionally carrying a routing
/// decision. Failover reinjects with the decision cleared.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub msg: Message,
    pub preferred: Option<PeerHandle>,
}

/// The three global queues, created at subsystem init
pub struct GlobalQueues {
    incoming_tx: mpsc::Sender<Message>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    outgoing_tx: mpsc::Sender<OutboundMessage>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    local_tx: mpsc::Sender<Message>,
    local_rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl GlobalQueues {
    /// Initialize the queue subsystem with the given per-queue depth
    pub fn new(depth: usize) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(depth);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(depth);
        let (local_tx, local_rx) = mpsc::channel(depth);
        Self {
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            local_tx,
            local_rx: Mutex::new(Some(local_rx)),
        }
    }

    /// Sender side of the incoming queue
    pub fn incoming_sender(&self) -> mpsc::Sender<Message> {
        self.incoming_tx.clone()
    }

    /// Sender side of the outgoing queue
    pub fn outgoing_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outgoing_tx.clone()
    }

    /// Sender side of the local queue
    pub fn local_sender(&self) -> mpsc::Sender<Message> {
        self.local_tx.clone()
    }

    /// Hand the incoming consumer end to the routing layer (once)
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Message>> {
        self.incoming_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Hand the outgoing consumer end to the routing layer (once)
    pub fn take_outgoing(&self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.outgoing_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Hand the local consumer end to the extension layer (once)
    pub fn take_local(&self) -> Option<mpsc::Receiver<Message>> {
        self.local_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Post a decoded application message to the incoming queue
    pub async fn post_incoming(&self, msg: Message) -> AgentResult<()> {
        self.incoming_tx
            .send(msg)
            .await
            .map_err(|_| AgentError::QueueClosed)
    }

    /// Post a message needing peer assignment to the outgoing queue
    pub async fn post_outgoing(&self, out: OutboundMessage) -> AgentResult<()> {
        self.outgoing_tx
            .send(out)
            .await
            .map_err(|_| AgentError::QueueClosed)
    }

    /// Post a message for extension consumption
    pub async fn post_local(&self, msg: Message) -> AgentResult<()> {
        self.local_tx
            .send(msg)
            .await
            .map_err(|_| AgentError::QueueClosed)
    }

    /// Tear the queue subsystem down: consumers not yet handed out are
    /// dropped, so producers start failing with QueueClosed once the
    /// handed-out receivers are gone too.
    pub fn fini(&self) {
        self.incoming_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.outgoing_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.local_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_post_and_take_incoming() {
        let queues = GlobalQueues::new(8);
        let mut rx = queues.take_incoming().unwrap();
        assert!(queues.take_incoming().is_none());

        queues
            .post_incoming(Message::request(318, 16777251, Bytes::new()))
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.header.command_code, 318);
    }

    #[tokio::test]
    async fn test_outgoing_preserves_order() {
        let queues = GlobalQueues::new(8);
        let mut rx = queues.take_outgoing().unwrap();

        for i in 0..4u32 {
            let mut msg = Message::request(272, 4, Bytes::new());
            msg.header.end_to_end_id = i;
            queues
                .post_outgoing(OutboundMessage {
                    msg,
                    preferred: None,
                })
                .await
                .unwrap();
        }
        for i in 0..4u32 {
            assert_eq!(rx.recv().await.unwrap().msg.header.end_to_end_id, i);
        }
    }

    #[tokio::test]
    async fn test_fini_closes_unclaimed_queues() {
        let queues = GlobalQueues::new(8);
        queues.fini();
        let err = queues
            .post_incoming(Message::request(318, 0, Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::QueueClosed));
    }
}
