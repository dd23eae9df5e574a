//! Process-wide agent context
//!
//! Owns every subsystem of the connection core: the peer table, the
//! active-peer registry, the expiry manager, the global queues and the
//! listening sockets. The routing and dictionary layers sit outside and
//! interact through the global queues and the dictionary adapter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::caps::{Capabilities, DictionaryAdapter};
use crate::config::{AgentConfig, PeerConfig};
use crate::error::{AgentError, AgentResult, ResultCode};
use crate::event::PeerEvent;
use crate::expiry::ExpiryManager;
use crate::message::Message;
use crate::peer::{
    ConnectCallback, PeerHandle, PeerTable, ValidateCallback,
};
use crate::psm;
use crate::queues::GlobalQueues;
use crate::registry::ActivePeers;
use crate::servers::Servers;
use crate::transport::{Connection, TlsMaterial};

/// Inactivity lifetime granted to dynamically discovered peers
const DYNAMIC_PEER_LIFETIME: Duration = Duration::from_secs(3600);

/// Shared state of the connection core, one per agent process
pub struct AgentCore {
    pub config: AgentConfig,
    pub local_caps: Capabilities,
    pub dict: Arc<dyn DictionaryAdapter>,
    pub table: PeerTable,
    pub actives: ActivePeers,
    pub expiry: ExpiryManager,
    pub queues: GlobalQueues,
    pub tls: TlsMaterial,
    /// Validates peers arriving on unrecognized inbound connections;
    /// without one, unknown peers are refused outright
    pub validator: Option<ValidateCallback>,
}

/// Top-level handle tying the subsystems together
pub struct AgentContext {
    core: Arc<AgentCore>,
    servers: Mutex<Option<Servers>>,
}

impl AgentContext {
    /// Initialize the queue, peer, expiry and TLS subsystems.
    ///
    /// `applications` is the locally supported application id set advertised
    /// during capabilities exchange. Must be called within a tokio runtime.
    pub fn new(
        config: AgentConfig,
        dict: Arc<dyn DictionaryAdapter>,
        applications: Vec<u32>,
        validator: Option<ValidateCallback>,
    ) -> AgentResult<Self> {
        let tls = match &config.tls {
            Some(tls_config) => TlsMaterial::from_config(tls_config)?,
            None => TlsMaterial::default(),
        };

        let local_caps = Capabilities {
            origin_host: config.identity.clone(),
            origin_realm: config.realm.clone(),
            host_addresses: config.addresses.clone(),
            vendor_id: 0,
            product_name: env!("CARGO_PKG_NAME").to_string(),
            applications,
            inband_security: config.tls.is_some(),
        };

        let core = Arc::new(AgentCore {
            table: PeerTable::new(&config),
            actives: ActivePeers::new(),
            expiry: ExpiryManager::new(),
            queues: GlobalQueues::new(config.global_queue_depth),
            tls,
            local_caps,
            dict,
            validator,
            config,
        });
        core.expiry.start();

        Ok(Self {
            core,
            servers: Mutex::new(None),
        })
    }

    /// Shared core, for components that outlive this handle
    pub fn core(&self) -> Arc<AgentCore> {
        self.core.clone()
    }

    /// Global queues to and from the routing/extension layers
    pub fn queues(&self) -> &GlobalQueues {
        &self.core.queues
    }

    /// Allocate a configured peer and start its state machine
    pub fn add_peer(
        &self,
        config: PeerConfig,
        validate_cb: Option<ValidateCallback>,
        connect_cb: Option<ConnectCallback>,
    ) -> AgentResult<PeerHandle> {
        let handle = self
            .core
            .table
            .allocate(config, "configuration", validate_cb, connect_cb)?;
        psm::begin(&self.core, handle)?;
        Ok(handle)
    }

    /// Gracefully terminate one peer (disconnect handshake + failover)
    pub async fn terminate_peer(&self, handle: PeerHandle) -> AgentResult<()> {
        psm::terminate(&self.core, handle).await
    }

    /// Abort one peer without waiting for protocol exchanges
    pub async fn abort_peer(&self, handle: PeerHandle) -> AgentResult<()> {
        psm::abort(&self.core, handle).await
    }

    /// Release a terminated peer's slot, joining its tasks
    pub async fn release_peer(&self, handle: PeerHandle) -> AgentResult<()> {
        self.core.table.release(handle).await
    }

    /// Queue an application message on a peer's outbound queue.
    ///
    /// Used by the routing layer after it picked the peer.
    pub async fn send_to_peer(&self, handle: PeerHandle, msg: Message) -> AgentResult<()> {
        let entry = self.core.table.lookup(handle)?;
        entry.enqueue(msg).await
    }

    /// Start the listening sockets; returns the bound addresses
    pub async fn start_servers(&self) -> AgentResult<Vec<std::net::SocketAddr>> {
        {
            let servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
            if servers.is_some() {
                return Err(AgentError::Protocol("servers already started".into()));
            }
        }

        let started = Servers::start(self.core.clone()).await?;
        let addrs = started.local_addrs().to_vec();
        *self.servers.lock().unwrap_or_else(|e| e.into_inner()) = Some(started);
        Ok(addrs)
    }

    /// Stop accepting new connections
    pub fn stop_servers(&self) {
        let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut servers) = servers.take() {
            servers.stop();
        }
    }

    /// Hand an externally accepted connection and its CER to the peer layer
    pub async fn handle_new_inbound_connection(
        &self,
        cer: Message,
        conn: Connection,
    ) -> AgentResult<()> {
        handle_new_incoming(&self.core, cer, conn).await
    }

    /// Log a one-line summary of every peer
    pub fn dump_peers(&self) {
        self.core.table.dump_list();
    }

    /// Terminate every peer, join their tasks, stop all subsystems
    pub async fn shutdown(&self) {
        self.stop_servers();

        let handles = self.core.table.handles();
        for handle in &handles {
            if let Err(e) = psm::terminate(&self.core, *handle).await {
                log::warn!("{handle}: terminate failed at shutdown: {e}");
            }
        }
        for handle in handles {
            if let Err(e) = self.core.table.release(handle).await {
                log::warn!("{handle}: release failed at shutdown: {e}");
            }
        }

        self.core.expiry.shutdown().await;
        self.core.queues.fini();
    }
}

/// Match an inbound CER to a configured peer, or allocate a new peer that
/// must pass validation before it is trusted.
pub(crate) async fn handle_new_incoming(
    core: &Arc<AgentCore>,
    cer: Message,
    mut conn: Connection,
) -> AgentResult<()> {
    let remote = match core.dict.decode_capabilities(&cer) {
        Ok(remote) => remote,
        Err(e) => {
            refuse(core, &cer, &mut conn, ResultCode::UnableToComply).await;
            return Err(e);
        }
    };

    if let Some(handle) = core.table.find_by_identity(&remote.origin_host) {
        return core
            .table
            .post_event(
                handle,
                PeerEvent::Incoming {
                    cer,
                    conn,
                    validate: false,
                },
            )
            .await;
    }

    if core.validator.is_none() {
        log::info!(
            "refusing connection from unknown peer '{}'",
            remote.origin_host
        );
        refuse(core, &cer, &mut conn, ResultCode::UnknownPeer).await;
        return Err(AgentError::Protocol(format!(
            "unknown peer {}",
            remote.origin_host
        )));
    }

    let peer_config = PeerConfig {
        identity: remote.origin_host.clone(),
        realm: remote.origin_realm.clone(),
        transport: conn.proto(),
        addresses: conn.remote_endpoints().to_vec(),
        initiator: false,
        use_tls: conn.is_tls(),
        lifetime: Some(DYNAMIC_PEER_LIFETIME),
        ..Default::default()
    };
    let dbg_origin = format!("inbound connection {}", conn.id());
    let handle = core.table.allocate(
        peer_config,
        &dbg_origin,
        core.validator.clone(),
        None,
    )?;
    psm::begin_with(core, handle, true)?;
    core.table
        .post_event(
            handle,
            PeerEvent::Incoming {
                cer,
                conn,
                validate: true,
            },
        )
        .await
}

async fn refuse(core: &Arc<AgentCore>, cer: &Message, conn: &mut Connection, code: ResultCode) {
    let mut cea = Message::answer_to(
        cer,
        core.dict.encode_capabilities(&core.local_caps, Some(code)),
    );
    cea.header.set_error();
    if let Err(e) = conn.send(&cea).await {
        log::debug!("could not send error CEA: {e}");
    }
    conn.destroy().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::testdict::TestDictionary;
    use crate::peer::PeerState;
    use crate::transport::TransportKind;
    use bytes::Bytes;
    use std::net::{IpAddr, SocketAddr};

    const S6A: u32 = 16777251;

    fn agent_config(identity: &str) -> AgentConfig {
        AgentConfig {
            identity: identity.to_string(),
            realm: "example.com".to_string(),
            addresses: vec![IpAddr::from([127, 0, 0, 1])],
            port: 0,
            timer_tc: Duration::from_millis(200),
            timer_tw: Duration::from_millis(150),
            cea_timeout: Duration::from_millis(500),
            dpr_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn context(identity: &str) -> AgentContext {
        let _ = env_logger::builder().is_test(true).try_init();
        AgentContext::new(
            agent_config(identity),
            Arc::new(TestDictionary),
            vec![S6A],
            None,
        )
        .unwrap()
    }

    fn peer_config(identity: &str, addr: SocketAddr) -> PeerConfig {
        PeerConfig {
            identity: identity.to_string(),
            realm: "example.com".to_string(),
            transport: TransportKind::Tcp,
            addresses: vec![addr],
            initiator: true,
            ..Default::default()
        }
    }

    fn responder_config(identity: &str) -> PeerConfig {
        PeerConfig {
            identity: identity.to_string(),
            realm: "example.com".to_string(),
            initiator: false,
            ..Default::default()
        }
    }

    async fn wait_until<F>(what: &str, mut cond: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    /// Initiator connects, capabilities match, peer reaches OPEN and shows
    /// up in the registry on both sides.
    #[tokio::test]
    async fn test_initiator_reaches_open() {
        let server = context("server.example.com");
        server
            .add_peer(responder_config("client.example.com"), None, None)
            .unwrap();
        let addrs = server.start_servers().await.unwrap();

        let client = context("client.example.com");
        let handle = client
            .add_peer(peer_config("server.example.com", addrs[0]), None, None)
            .unwrap();

        let entry = client.core.table.lookup(handle).unwrap();
        wait_until("client peer OPEN", || entry.state() == PeerState::Open).await;
        assert!(client.core.actives.contains(handle).await);
        assert_eq!(client.core.actives.len().await, 1);

        let server_handle = server
            .core
            .table
            .find_by_identity("client.example.com")
            .unwrap();
        let server_entry = server.core.table.lookup(server_handle).unwrap();
        wait_until("server peer OPEN", || {
            server_entry.state() == PeerState::Open
        })
        .await;
        assert!(server.core.actives.contains(server_handle).await);

        // Negotiated capabilities were kept on both sides
        assert_eq!(
            entry.info().remote_caps.unwrap().origin_host,
            "server.example.com"
        );

        client.shutdown().await;
        server.shutdown().await;
    }

    /// An OPEN peer with outstanding requests is abruptly disconnected: it
    /// leaves the registry, the requests reappear on the global outbound
    /// queue in original order, and the peer needs its configured watchdog
    /// round-trips after reconnecting before the problem flag clears.
    #[tokio::test]
    async fn test_abrupt_disconnect_failover_and_reopen() {
        let server = context("server.example.com");
        let server_peer = server
            .add_peer(responder_config("client.example.com"), None, None)
            .unwrap();
        let addrs = server.start_servers().await.unwrap();

        let client = context("client.example.com");
        let mut outgoing = client.queues().take_outgoing().unwrap();
        let handle = client
            .add_peer(peer_config("server.example.com", addrs[0]), None, None)
            .unwrap();

        let entry = client.core.table.lookup(handle).unwrap();
        wait_until("client peer OPEN", || entry.state() == PeerState::Open).await;

        // Three requests in flight, no answers coming
        for i in 0..3u32 {
            let mut msg = Message::request(316, S6A, Bytes::new());
            msg.header.end_to_end_id = 1000 + i;
            client.send_to_peer(handle, msg).await.unwrap();
        }
        wait_until("requests tracked", || entry.sr.len() == 3).await;

        // Abrupt remote teardown
        server.abort_peer(server_peer).await.unwrap();

        // Exactly the three requests reappear, oldest first, unrouted
        let mut last_e2e = 999;
        for _ in 0..3 {
            let out = tokio::time::timeout(Duration::from_secs(5), outgoing.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(out.preferred.is_none());
            assert_eq!(out.msg.header.end_to_end_id, last_e2e + 1);
            last_e2e = out.msg.header.end_to_end_id;
        }
        assert!(entry.sr.is_empty());

        // Registry removal precedes the failover we just observed
        assert!(!client.core.actives.contains(handle).await);
        wait_until("connection problem flagged", || entry.flags().cnx_problem).await;

        // Let the remote accept again, then watch the reopen rounds clear
        // the connection-problem flag
        server.release_peer(server_peer).await.unwrap();
        server
            .add_peer(responder_config("client.example.com"), None, None)
            .unwrap();

        wait_until("problem flag cleared after reopen rounds", || {
            entry.state() == PeerState::Open && !entry.flags().cnx_problem
        })
        .await;
        assert!(client.core.actives.contains(handle).await);

        client.shutdown().await;
        server.shutdown().await;
    }

    /// Liveness probes flow at idle cadence without any application traffic;
    /// the peer stays OPEN and is never expired.
    #[tokio::test]
    async fn test_watchdog_keeps_idle_peer_open() {
        let server = context("server.example.com");
        server
            .add_peer(responder_config("client.example.com"), None, None)
            .unwrap();
        let addrs = server.start_servers().await.unwrap();

        let client = context("client.example.com");
        let handle = client
            .add_peer(peer_config("server.example.com", addrs[0]), None, None)
            .unwrap();
        let entry = client.core.table.lookup(handle).unwrap();
        wait_until("client peer OPEN", || entry.state() == PeerState::Open).await;

        let before = entry.info().last_activity;
        // At Tw = 150ms this spans two watchdog rounds
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(entry.state(), PeerState::Open);
        assert!(client.core.actives.contains(handle).await);
        assert!(
            entry.info().last_activity > before,
            "watchdog answers should have refreshed activity"
        );
        assert!(!client.core.expiry.contains(handle));

        client.shutdown().await;
        server.shutdown().await;
    }

    /// A remote that accepts the transport connection but never answers the
    /// capabilities exchange must not reach OPEN.
    #[tokio::test]
    async fn test_silent_remote_never_reaches_open() {
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        tokio::spawn(async move {
            // accept and hold the socket without ever speaking
            let mut held = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                held.push(stream);
            }
        });

        let client = context("client.example.com");
        let handle = client
            .add_peer(peer_config("server.example.com", addr), None, None)
            .unwrap();
        let entry = client.core.table.lookup(handle).unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_ne!(entry.state(), PeerState::Open);
        assert!(!client.core.actives.contains(handle).await);

        client.shutdown().await;
    }

    /// Unknown inbound peers are validated through the agent callback;
    /// acceptance creates a dynamic peer, rejection answers an error CEA.
    #[tokio::test]
    async fn test_unknown_peer_validation() {
        let accepting: ValidateCallback = Arc::new(|info| {
            info.identity.ends_with(".example.com")
        });
        let server = AgentContext::new(
            agent_config("server.example.com"),
            Arc::new(TestDictionary),
            vec![S6A],
            Some(accepting),
        )
        .unwrap();
        let addrs = server.start_servers().await.unwrap();

        let client = context("client.example.com");
        let handle = client
            .add_peer(peer_config("server.example.com", addrs[0]), None, None)
            .unwrap();
        let entry = client.core.table.lookup(handle).unwrap();
        wait_until("client peer OPEN", || entry.state() == PeerState::Open).await;

        // The server allocated a dynamic peer for us
        let server_handle = server
            .core
            .table
            .find_by_identity("client.example.com")
            .unwrap();
        assert!(server.core.actives.contains(server_handle).await);
        // Dynamic peers carry an inactivity lifetime
        assert!(server.core.expiry.contains(server_handle));

        client.shutdown().await;
        server.shutdown().await;
    }

    /// Without a validator, unknown inbound peers are refused with an error
    /// CEA and the initiator records a terminal negotiation failure.
    #[tokio::test]
    async fn test_unknown_peer_refused_without_validator() {
        let server = context("server.example.com");
        let addrs = server.start_servers().await.unwrap();

        let client = context("client.example.com");
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let connect_cb: ConnectCallback = Box::new(move |_info, result| {
            let _ = result_tx.send(result.is_ok());
        });
        let handle = client
            .add_peer(
                peer_config("server.example.com", addrs[0]),
                None,
                Some(connect_cb),
            )
            .unwrap();

        let succeeded = tokio::time::timeout(Duration::from_secs(5), result_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!succeeded);

        let entry = client.core.table.lookup(handle).unwrap();
        assert_eq!(entry.state(), PeerState::Closed);
        assert!(!client.core.actives.contains(handle).await);
        assert!(server.core.table.find_by_identity("client.example.com").is_none());

        client.shutdown().await;
        server.shutdown().await;
    }

    /// Graceful shutdown completes the disconnect handshake and releases
    /// every peer exactly once.
    #[tokio::test]
    async fn test_graceful_shutdown() {
        let server = context("server.example.com");
        server
            .add_peer(responder_config("client.example.com"), None, None)
            .unwrap();
        let addrs = server.start_servers().await.unwrap();

        let client = context("client.example.com");
        let handle = client
            .add_peer(peer_config("server.example.com", addrs[0]), None, None)
            .unwrap();
        let entry = client.core.table.lookup(handle).unwrap();
        wait_until("client peer OPEN", || entry.state() == PeerState::Open).await;

        tokio::time::timeout(Duration::from_secs(5), client.shutdown())
            .await
            .expect("shutdown must complete");
        assert!(client.core.table.handles().is_empty());
        assert!(client.core.actives.is_empty().await);

        tokio::time::timeout(Duration::from_secs(5), server.shutdown())
            .await
            .expect("shutdown must complete");
    }

    /// Application answers are matched against the sent-request store;
    /// unmatched answers are dropped without affecting the peer.
    #[tokio::test]
    async fn test_request_answer_matching() {
        let server = context("server.example.com");
        let server_peer = server
            .add_peer(responder_config("client.example.com"), None, None)
            .unwrap();
        let addrs = server.start_servers().await.unwrap();

        let client = context("client.example.com");
        let mut incoming = client.queues().take_incoming().unwrap();
        let handle = client
            .add_peer(peer_config("server.example.com", addrs[0]), None, None)
            .unwrap();
        let entry = client.core.table.lookup(handle).unwrap();
        wait_until("client peer OPEN", || entry.state() == PeerState::Open).await;

        // Server side echoes application requests as answers
        let server_core = server.core();
        let mut server_incoming = server.queues().take_incoming().unwrap();
        tokio::spawn(async move {
            while let Some(req) = server_incoming.recv().await {
                let answer = Message::answer_to(&req, Bytes::new());
                let server_entry = server_core.table.lookup(server_peer).unwrap();
                let _ = server_entry.enqueue(answer).await;
            }
        });

        client
            .send_to_peer(handle, Message::request(316, S6A, Bytes::new()))
            .await
            .unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(answer.header.is_answer());
        assert_eq!(answer.header.command_code, 316);
        // The matching request was consumed from the store
        assert!(entry.sr.is_empty());
        assert_eq!(entry.state(), PeerState::Open);

        client.shutdown().await;
        server.shutdown().await;
    }
}
