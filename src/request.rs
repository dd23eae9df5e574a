//! Sent-request store and failover
//!
//! Per-peer table of requests sent and not yet answered, keyed by their
//! hop-by-hop id. One mutex guards all access; it is the ordering boundary
//! between an answer being matched and a failover drain: either the fetch
//! completes first and failover does not see that entry, or failover removes
//! it first and the fetch reports not-found.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::{AgentError, AgentResult};
use crate::message::Message;
use crate::queues::OutboundMessage;

struct SentRequest {
    msg: Message,
    sent_at: Instant,
}

/// Outstanding requests awaiting answers, ordered by hop-by-hop id.
///
/// Ids are issued strictly increasing per peer, so iteration order is
/// original send order.
#[derive(Default)]
pub struct SentRequestStore {
    inner: Mutex<BTreeMap<u32, SentRequest>>,
}

impl SentRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request awaiting its answer.
    ///
    /// A duplicate id must not happen under correct single-writer id
    /// assignment and is reported as an error.
    pub fn store(&self, hop_by_hop: u32, msg: Message) -> AgentResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.contains_key(&hop_by_hop) {
            return Err(AgentError::DuplicateRequest(hop_by_hop));
        }
        inner.insert(
            hop_by_hop,
            SentRequest {
                msg,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Atomically remove and return the request matching an inbound answer.
    pub fn fetch(&self, hop_by_hop: u32) -> AgentResult<Message> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.remove(&hop_by_hop) {
            Some(entry) => Ok(entry.msg),
            None => Err(AgentError::RequestNotFound(hop_by_hop)),
        }
    }

    /// Drain every outstanding request and reinject it into the global
    /// outbound path in original send order, stripped of this peer's
    /// routing decision. Returns the number of requests reinjected.
    pub async fn failover(&self, outgoing: &mpsc::Sender<OutboundMessage>) -> usize {
        let drained: Vec<SentRequest> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let map = std::mem::take(&mut *inner);
            map.into_values().collect()
        };

        let mut count = 0;
        for entry in drained {
            let mut msg = entry.msg;
            msg.header.set_retransmit();
            log::debug!(
                "failing over request hbh={} after {:?} in flight",
                msg.header.hop_by_hop_id,
                entry.sent_at.elapsed()
            );
            if outgoing
                .send(OutboundMessage {
                    msg,
                    preferred: None,
                })
                .await
                .is_err()
            {
                log::warn!("outgoing queue closed during failover, dropping request");
                break;
            }
            count += 1;
        }
        count
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether any request is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn req(hbh: u32) -> Message {
        let mut msg = Message::request(272, 4, Bytes::new());
        msg.header.hop_by_hop_id = hbh;
        msg
    }

    #[test]
    fn test_store_then_fetch_empties_slot() {
        let store = SentRequestStore::new();
        store.store(7, req(7)).unwrap();
        assert_eq!(store.len(), 1);

        let fetched = store.fetch(7).unwrap();
        assert_eq!(fetched.header.hop_by_hop_id, 7);
        assert!(store.is_empty());

        // A repeated fetch with the same id fails as not-found
        let err = store.fetch(7).unwrap_err();
        assert!(matches!(err, AgentError::RequestNotFound(7)));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = SentRequestStore::new();
        store.store(1, req(1)).unwrap();
        let err = store.store(1, req(1)).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateRequest(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_fetch_unknown_id() {
        let store = SentRequestStore::new();
        assert!(matches!(
            store.fetch(99),
            Err(AgentError::RequestNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_failover_preserves_send_order_and_empties_store() {
        let store = SentRequestStore::new();
        for hbh in [10u32, 11, 12] {
            store.store(hbh, req(hbh)).unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        let count = store.failover(&tx).await;
        assert_eq!(count, 3);
        assert!(store.is_empty());

        for expected in [10u32, 11, 12] {
            let out = rx.recv().await.unwrap();
            assert_eq!(out.msg.header.hop_by_hop_id, expected);
            assert!(out.preferred.is_none());
            assert!(out.msg.header.flags & crate::message::cmd_flags::RETRANSMIT != 0);
        }
    }

    #[tokio::test]
    async fn test_failover_on_empty_store() {
        let store = SentRequestStore::new();
        let (tx, _rx) = mpsc::channel(4);
        assert_eq!(store.failover(&tx).await, 0);
    }

    proptest! {
        /// Store-then-fetch returns the original request for any id set
        #[test]
        fn prop_store_fetch_roundtrip(ids in prop::collection::btree_set(any::<u32>(), 1..64)) {
            let store = SentRequestStore::new();
            for &id in &ids {
                store.store(id, req(id)).unwrap();
            }
            prop_assert_eq!(store.len(), ids.len());
            for &id in &ids {
                let msg = store.fetch(id).unwrap();
                prop_assert_eq!(msg.header.hop_by_hop_id, id);
            }
            prop_assert!(store.is_empty());
        }
    }
}
