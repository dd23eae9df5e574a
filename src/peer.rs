//! Peer objects and the peer table
//!
//! Peers live in an arena indexed by checked handles (slot index plus
//! generation). The generation is bumped when a slot is released, so any
//! externally held handle to a freed peer fails its validity check instead
//! of reaching a recycled slot.
//!
//! The mutable protocol state of a peer (current state, flags, negotiated
//! capabilities) is written only by its own state machine task; other
//! components read consistent snapshots through the entry's internal lock.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::caps::Capabilities;
use crate::config::{AgentConfig, PeerConfig};
use crate::error::{AgentError, AgentResult};
use crate::event::PeerEvent;
use crate::message::Message;
use crate::request::SentRequestStore;

/// Checked handle to a peer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

impl PeerHandle {
    #[cfg(test)]
    pub(crate) fn for_tests(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}.{}", self.index, self.generation)
    }
}

/// Peer connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No connection, no attempt in progress
    Closed,
    /// Outbound attempt in progress
    Connecting,
    /// Accepted socket, no CER seen yet
    WaitInboundCer,
    /// Initiator: CER sent, waiting for CEA
    WaitCea,
    /// Acting responder: waiting for an incoming CER
    WaitCer,
    /// Capabilities exchanged, connection is operational
    Open,
    /// Disconnect handshake in progress (DPR sent)
    Closing,
    /// Reconnected after a failure, extra watchdog rounds required
    Reopen,
    /// Final state, resources released
    Terminated,
}

impl PeerState {
    /// State name for logs
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Closed => "CLOSED",
            PeerState::Connecting => "CONNECTING",
            PeerState::WaitInboundCer => "WAIT_INBOUND_CER",
            PeerState::WaitCea => "WAIT_CEA",
            PeerState::WaitCer => "WAIT_CER",
            PeerState::Open => "OPEN",
            PeerState::Closing => "CLOSING",
            PeerState::Reopen => "REOPEN",
            PeerState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flags influencing the peer state machine
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFlags {
    /// The local peer is responder on the current connection
    pub responder: bool,
    /// A DWR was sent and not answered yet
    pub dw_pending: bool,
    /// The peer lost its connection; watchdog rounds must complete before
    /// it is trusted again
    pub cnx_problem: bool,
    /// Remaining watchdog round-trips after a re-established connection
    pub reopen_left: u8,
}

/// Snapshot of a peer for callbacks and diagnostics
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub handle: PeerHandle,
    pub identity: String,
    pub realm: String,
    pub state: PeerState,
    pub flags: PeerFlags,
    pub last_activity: Instant,
    pub remote_caps: Option<Capabilities>,
}

/// Callback validating a negotiated peer before it is trusted
pub type ValidateCallback = Arc<dyn Fn(&PeerInfo) -> bool + Send + Sync>;

/// Callback invoked once with the outcome of the initial connection
pub type ConnectCallback = Box<dyn FnOnce(&PeerInfo, AgentResult<()>) + Send>;

pub(crate) struct PeerShared {
    pub state: PeerState,
    pub flags: PeerFlags,
    pub last_activity: Instant,
    pub caps: Option<Capabilities>,
    pub in_active: bool,
    pub in_expiry: bool,
}

/// One allocated peer: identity, queues, tasks, sent-request store
pub struct PeerEntry {
    handle: PeerHandle,
    pub config: PeerConfig,
    /// Origin of this peer object, for debug
    pub dbg_origin: String,
    events_tx: mpsc::Sender<PeerEvent>,
    out_tx: mpsc::Sender<Message>,
    pub(crate) events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    pub(crate) out_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    /// Next hop-by-hop id; single writer is the sending path
    hbh: AtomicU32,
    pub sr: Arc<SentRequestStore>,
    pub(crate) shared: Mutex<PeerShared>,
    pub(crate) validate_cb: Option<ValidateCallback>,
    pub(crate) connect_cb: Mutex<Option<ConnectCallback>>,
    pub(crate) psm_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerEntry {
    /// This peer's checked handle
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    /// Issue the next hop-by-hop id. Strictly increasing per peer lifetime.
    pub fn next_hop_by_hop(&self) -> u32 {
        self.hbh.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Sender side of the event queue
    pub fn events_sender(&self) -> mpsc::Sender<PeerEvent> {
        self.events_tx.clone()
    }

    /// Post one event to this peer's state machine, in arrival order
    pub async fn post_event(&self, event: PeerEvent) -> AgentResult<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| AgentError::QueueClosed)
    }

    /// Enqueue an outbound application message for the sending task
    pub async fn enqueue(&self, msg: Message) -> AgentResult<()> {
        self.out_tx
            .send(msg)
            .await
            .map_err(|_| AgentError::QueueClosed)
    }

    /// Current state
    pub fn state(&self) -> PeerState {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Current flags
    pub fn flags(&self) -> PeerFlags {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).flags
    }

    /// Consistent snapshot for callbacks and diagnostics
    pub fn info(&self) -> PeerInfo {
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        PeerInfo {
            handle: self.handle,
            identity: self.config.identity.clone(),
            realm: self.config.realm.clone(),
            state: shared.state,
            flags: shared.flags,
            last_activity: shared.last_activity,
            remote_caps: shared.caps.clone(),
        }
    }

    /// Log everything known about this peer
    pub fn dump(&self) {
        let info = self.info();
        log::info!(
            "{} {} realm={} state={} dw_pending={} cnx_problem={} reopen_left={} \
             outstanding={} origin={}",
            info.handle,
            info.identity,
            info.realm,
            info.state,
            info.flags.dw_pending,
            info.flags.cnx_problem,
            info.flags.reopen_left,
            self.sr.len(),
            self.dbg_origin,
        );
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<PeerEntry>>,
}

/// Arena of allocated peers with checked handles
pub struct PeerTable {
    slots: RwLock<Vec<Slot>>,
    event_depth: usize,
    out_depth: usize,
}

/// Pseudo-random initial value for the hop-by-hop counter
fn initial_hbh() -> u32 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    // Mix bits for better distribution
    nanos.wrapping_mul(2654435761)
}

impl PeerTable {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            event_depth: config.event_queue_depth,
            out_depth: config.outbound_queue_depth,
        }
    }

    /// Allocate a peer object. Fails only on resource exhaustion.
    pub fn allocate(
        &self,
        config: PeerConfig,
        dbg_origin: &str,
        validate_cb: Option<ValidateCallback>,
        connect_cb: Option<ConnectCallback>,
    ) -> AgentResult<PeerHandle> {
        let (events_tx, events_rx) = mpsc::channel(self.event_depth);
        let (out_tx, out_rx) = mpsc::channel(self.out_depth);

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let index = match slots.iter().position(|s| s.entry.is_none()) {
            Some(index) => index,
            None => {
                if slots.len() >= u32::MAX as usize {
                    return Err(AgentError::ResourceExhausted("peer table full".into()));
                }
                slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                slots.len() - 1
            }
        };

        let handle = PeerHandle {
            index: index as u32,
            generation: slots[index].generation,
        };

        let entry = Arc::new(PeerEntry {
            handle,
            config,
            dbg_origin: dbg_origin.to_string(),
            events_tx,
            out_tx,
            events_rx: Mutex::new(Some(events_rx)),
            out_rx: Mutex::new(Some(out_rx)),
            hbh: AtomicU32::new(initial_hbh()),
            sr: Arc::new(SentRequestStore::new()),
            shared: Mutex::new(PeerShared {
                state: PeerState::Closed,
                flags: PeerFlags::default(),
                last_activity: Instant::now(),
                caps: None,
                in_active: false,
                in_expiry: false,
            }),
            validate_cb,
            connect_cb: Mutex::new(connect_cb),
            psm_task: Mutex::new(None),
        });

        slots[index].entry = Some(entry);
        Ok(handle)
    }

    /// Dereference a handle, asserting its validity
    pub fn lookup(&self, handle: PeerHandle) -> AgentResult<Arc<PeerEntry>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let slot = slots
            .get(handle.index as usize)
            .ok_or(AgentError::StalePeer)?;
        if slot.generation != handle.generation {
            return Err(AgentError::StalePeer);
        }
        slot.entry.clone().ok_or(AgentError::StalePeer)
    }

    /// Find a configured peer by its Diameter identity
    pub fn find_by_identity(&self, identity: &str) -> Option<PeerHandle> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.iter().find_map(|slot| {
            slot.entry
                .as_ref()
                .filter(|e| e.config.identity == identity)
                .map(|e| e.handle)
        })
    }

    /// Post one event to a peer's state machine
    pub async fn post_event(&self, handle: PeerHandle, event: PeerEvent) -> AgentResult<()> {
        let entry = self.lookup(handle)?;
        entry.post_event(event).await
    }

    /// Handles of all allocated peers
    pub fn handles(&self) -> Vec<PeerHandle> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|e| e.handle))
            .collect()
    }

    /// Release a peer slot after its state machine has terminated.
    ///
    /// Joins the state machine task so the connection and sending task are
    /// known to be released, then invalidates every outstanding handle.
    pub async fn release(&self, handle: PeerHandle) -> AgentResult<()> {
        let entry = self.lookup(handle)?;
        let task = {
            let mut psm_task = entry.psm_task.lock().unwrap_or_else(|e| e.into_inner());
            psm_task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let slot = slots
            .get_mut(handle.index as usize)
            .ok_or(AgentError::StalePeer)?;
        if slot.generation != handle.generation || slot.entry.is_none() {
            return Err(AgentError::StalePeer);
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Log a one-line summary of every allocated peer
    pub fn dump_list(&self) {
        for handle in self.handles() {
            if let Ok(entry) = self.lookup(handle) {
                entry.dump();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table() -> PeerTable {
        PeerTable::new(&AgentConfig::default())
    }

    fn peer_config(identity: &str) -> PeerConfig {
        PeerConfig {
            identity: identity.to_string(),
            realm: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allocate_lookup_release() {
        let table = table();
        let handle = table
            .allocate(peer_config("hss.example.com"), "config", None, None)
            .unwrap();

        let entry = table.lookup(handle).unwrap();
        assert_eq!(entry.config.identity, "hss.example.com");
        assert_eq!(entry.state(), PeerState::Closed);

        table.release(handle).await.unwrap();
        assert!(matches!(table.lookup(handle), Err(AgentError::StalePeer)));
    }

    #[tokio::test]
    async fn test_released_slot_reuse_invalidates_old_handle() {
        let table = table();
        let first = table
            .allocate(peer_config("a.example.com"), "config", None, None)
            .unwrap();
        table.release(first).await.unwrap();

        let second = table
            .allocate(peer_config("b.example.com"), "config", None, None)
            .unwrap();

        // Same slot, new generation: the stale handle must not resolve
        assert!(matches!(table.lookup(first), Err(AgentError::StalePeer)));
        let entry = table.lookup(second).unwrap();
        assert_eq!(entry.config.identity, "b.example.com");
    }

    #[tokio::test]
    async fn test_find_by_identity() {
        let table = table();
        let handle = table
            .allocate(peer_config("hss.example.com"), "config", None, None)
            .unwrap();

        assert_eq!(table.find_by_identity("hss.example.com"), Some(handle));
        assert_eq!(table.find_by_identity("unknown.example.com"), None);
    }

    #[tokio::test]
    async fn test_post_event_preserves_fifo() {
        let table = table();
        let handle = table
            .allocate(peer_config("hss.example.com"), "config", None, None)
            .unwrap();
        let entry = table.lookup(handle).unwrap();
        let mut rx = entry.events_rx.lock().unwrap().take().unwrap();

        table.post_event(handle, PeerEvent::DumpAll).await.unwrap();
        table
            .post_event(handle, PeerEvent::ConnError)
            .await
            .unwrap();
        table.post_event(handle, PeerEvent::Timeout).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "DumpAll");
        assert_eq!(rx.recv().await.unwrap().name(), "ConnError");
        assert_eq!(rx.recv().await.unwrap().name(), "Timeout");
    }

    #[test]
    fn test_hop_by_hop_strictly_increases() {
        let table = table();
        let handle = table
            .allocate(peer_config("hss.example.com"), "config", None, None)
            .unwrap();
        let entry = table.lookup(handle).unwrap();

        let mut last = entry.next_hop_by_hop();
        for _ in 0..1000 {
            let next = entry.next_hop_by_hop();
            assert_eq!(next, last.wrapping_add(1));
            last = next;
        }
    }

    proptest! {
        /// Handles from different generations of the same slot never collide
        #[test]
        fn prop_generation_disambiguates(generations in 1..20u32) {
            let table = table();
            let mut handles = Vec::new();
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            for i in 0..generations {
                let h = table
                    .allocate(peer_config(&format!("p{i}.example.com")), "test", None, None)
                    .unwrap();
                handles.push(h);
                rt.block_on(table.release(h)).unwrap();
            }
            for h in handles {
                prop_assert!(matches!(table.lookup(h), Err(AgentError::StalePeer)));
            }
        }
    }
}
