//! Per-peer outgoing sender task
//!
//! Drains the peer's outbound queue. Requests get the next hop-by-hop id
//! from the peer's single-writer counter and a tracking entry in the
//! sent-request store before they hit the wire; answers are sent as-is. A
//! send failure is not retried locally: it raises a connection-error event
//! for the state machine and parks the task.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::event::PeerEvent;
use crate::message::Message;
use crate::peer::PeerEntry;
use crate::transport::Connection;

/// Control handle for a running sender task
pub(crate) struct SenderHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<mpsc::Receiver<Message>>,
}

impl SenderHandle {
    /// Signal the task to stop and recover the outbound queue receiver so a
    /// later sender instance can continue draining it.
    pub(crate) async fn stop(self) -> Option<mpsc::Receiver<Message>> {
        let _ = self.stop.send(true);
        self.task.await.ok()
    }
}

/// Start the sending task for an open connection
pub(crate) fn start(
    entry: Arc<PeerEntry>,
    conn: Arc<Mutex<Connection>>,
    out_rx: mpsc::Receiver<Message>,
) -> SenderHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut out_rx = out_rx;
        loop {
            let msg = tokio::select! {
                _ = stop_rx.changed() => break,
                maybe = out_rx.recv() => match maybe {
                    Some(msg) => msg,
                    // Queue gone: the peer is being released
                    None => break,
                },
            };

            let mut msg = msg;
            if msg.header.is_request() {
                let hbh = entry.next_hop_by_hop();
                msg.header.hop_by_hop_id = hbh;
                if msg.header.end_to_end_id == 0 {
                    msg.header.end_to_end_id = hbh;
                }
                if let Err(e) = entry.sr.store(hbh, msg.clone()) {
                    log::error!(
                        "{}: failed to track request hbh={hbh}: {e}",
                        entry.config.identity
                    );
                    continue;
                }
            }

            let result = conn.lock().await.send(&msg).await;
            if let Err(e) = result {
                log::warn!(
                    "{}: send failed, raising connection error: {e}",
                    entry.config.identity
                );
                let _ = entry.post_event(PeerEvent::ConnError).await;
                break;
            }
        }
        out_rx
    });

    SenderHandle {
        stop: stop_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, PeerConfig};
    use crate::peer::PeerTable;
    use crate::transport::{Listener, TransportKind};
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn open_pair() -> (Connection, Connection) {
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let listener = Listener::bind_tcp(addr).await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut client =
            Connection::connect(TransportKind::Tcp, &[listen_addr], Duration::from_secs(5))
                .await
                .unwrap();
        let mut server = accept.await.unwrap();
        client.start_clear(false).unwrap();
        server.start_clear(false).unwrap();
        (client, server)
    }

    fn entry_for_test(table: &PeerTable) -> Arc<PeerEntry> {
        let handle = table
            .allocate(
                PeerConfig {
                    identity: "hss.example.com".into(),
                    realm: "example.com".into(),
                    ..Default::default()
                },
                "test",
                None,
                None,
            )
            .unwrap();
        table.lookup(handle).unwrap()
    }

    #[tokio::test]
    async fn test_requests_get_increasing_ids_and_tracking() {
        let table = PeerTable::new(&AgentConfig::default());
        let entry = entry_for_test(&table);
        let (client, mut server) = open_pair().await;

        let out_rx = entry.out_rx.lock().unwrap().take().unwrap();
        let conn = Arc::new(Mutex::new(client));
        let sender = start(entry.clone(), conn, out_rx);

        for _ in 0..3 {
            entry
                .enqueue(Message::request(272, 4, Bytes::new()))
                .await
                .unwrap();
        }

        let mut last = None;
        for _ in 0..3 {
            let msg = server.recv(Duration::from_secs(5)).await.unwrap();
            let hbh = msg.header.hop_by_hop_id;
            if let Some(prev) = last {
                assert_eq!(hbh, u32::wrapping_add(prev, 1));
            }
            // Each request is tracked under its assigned id
            assert!(entry.sr.fetch(hbh).is_ok());
            last = Some(hbh);
        }

        assert!(sender.stop().await.is_some());
    }

    #[tokio::test]
    async fn test_answers_are_not_tracked() {
        let table = PeerTable::new(&AgentConfig::default());
        let entry = entry_for_test(&table);
        let (client, mut server) = open_pair().await;

        let out_rx = entry.out_rx.lock().unwrap().take().unwrap();
        let conn = Arc::new(Mutex::new(client));
        let sender = start(entry.clone(), conn, out_rx);

        let mut req = Message::request(272, 4, Bytes::new());
        req.header.hop_by_hop_id = 55;
        let answer = Message::answer_to(&req, Bytes::new());
        entry.enqueue(answer).await.unwrap();

        let got = server.recv(Duration::from_secs(5)).await.unwrap();
        assert!(got.header.is_answer());
        // The answer must keep the request's hop-by-hop id
        assert_eq!(got.header.hop_by_hop_id, 55);
        assert!(entry.sr.is_empty());

        assert!(sender.stop().await.is_some());
    }

    #[tokio::test]
    async fn test_send_failure_raises_conn_error() {
        let table = PeerTable::new(&AgentConfig::default());
        let entry = entry_for_test(&table);
        let (client, mut server) = open_pair().await;
        server.destroy().await;

        let mut events = entry.events_rx.lock().unwrap().take().unwrap();
        let out_rx = entry.out_rx.lock().unwrap().take().unwrap();
        let conn = Arc::new(Mutex::new(client));
        let sender = start(entry.clone(), conn, out_rx);

        // The first writes after the close may still land in the kernel
        // buffer; keep sending until the reset surfaces as a ConnError
        let mut raised = false;
        for _ in 0..50 {
            let _ = entry
                .enqueue(Message::request(272, 4, Bytes::new()))
                .await;
            if let Ok(Some(ev)) =
                tokio::time::timeout(Duration::from_millis(100), events.recv()).await
            {
                assert_eq!(ev.name(), "ConnError");
                raised = true;
                break;
            }
        }
        assert!(raised, "send failure never raised a connection error");
        // Failed requests stay tracked for failover
        assert!(!entry.sr.is_empty());

        // The task parked itself; the receiver is recoverable
        assert!(sender.stop().await.is_some());
    }
}
