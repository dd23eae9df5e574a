//! Peer state machine
//!
//! One task per peer drives the RFC 6733 connection lifecycle:
//!
//! ```text
//!   Closed -> Connecting -> WaitCea -> Open        (initiator)
//!   Closed -> WaitCer / WaitInboundCer -> Open     (responder)
//!   Open -> Closing -> Terminated                  (DPR sent)
//!   Open -> Closed/Connecting -> ... -> Reopen     (connection problem)
//!   any  -> Terminated                             (administrative)
//! ```
//!
//! Every transition is driven by dequeuing one event from the peer's event
//! queue or by the current state's deadline expiring. The task exclusively
//! owns the connection context until it is destroyed; while OPEN, the
//! sending task borrows it through a shared lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::caps;
use crate::context::AgentCore;
use crate::error::{AgentError, AgentResult, ResultCode};
use crate::event::PeerEvent;
use crate::message::{base_cmd, DisconnectCause, Message};
use crate::peer::{PeerEntry, PeerHandle, PeerState};
use crate::sender::{self, SenderHandle};
use crate::transport::Connection;

/// Spawn the state machine task for an allocated peer
pub fn begin(core: &Arc<AgentCore>, handle: PeerHandle) -> AgentResult<()> {
    begin_with(core, handle, false)
}

/// Spawn the state machine task; `inbound` marks a peer created for an
/// already-accepted connection whose CER event is about to arrive.
pub(crate) fn begin_with(
    core: &Arc<AgentCore>,
    handle: PeerHandle,
    inbound: bool,
) -> AgentResult<()> {
    let entry = core.table.lookup(handle)?;
    let events = {
        let mut events_rx = entry.events_rx.lock().unwrap_or_else(|e| e.into_inner());
        events_rx
            .take()
            .ok_or_else(|| AgentError::Protocol(format!("{handle} state machine already started")))?
    };

    let task = tokio::spawn(run(core.clone(), entry.clone(), events, inbound));
    *entry.psm_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    Ok(())
}

/// Request a graceful termination: disconnect handshake, failover, release
pub async fn terminate(core: &Arc<AgentCore>, handle: PeerHandle) -> AgentResult<()> {
    match core
        .table
        .post_event(handle, PeerEvent::Terminate { abort: false })
        .await
    {
        Ok(()) => Ok(()),
        // Already terminated: the request is idempotent
        Err(AgentError::QueueClosed) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Request an immediate termination without waiting for in-progress
/// protocol exchanges
pub async fn abort(core: &Arc<AgentCore>, handle: PeerHandle) -> AgentResult<()> {
    match core
        .table
        .post_event(handle, PeerEvent::Terminate { abort: true })
        .await
    {
        Ok(()) => Ok(()),
        Err(AgentError::QueueClosed) => Ok(()),
        Err(e) => Err(e),
    }
}

struct Psm {
    core: Arc<AgentCore>,
    entry: Arc<PeerEntry>,
    events: mpsc::Receiver<PeerEvent>,
    /// Events put aside while flushing a destroyed connection's leftovers
    pending: VecDeque<PeerEvent>,
    conn: Option<Arc<Mutex<Connection>>>,
    sender: Option<SenderHandle>,
    deadline: Option<tokio::time::Instant>,
    /// Consecutive unanswered watchdog probes
    dw_miss: u32,
    /// Administrative terminate in progress
    terminating: bool,
}

async fn run(
    core: Arc<AgentCore>,
    entry: Arc<PeerEntry>,
    events: mpsc::Receiver<PeerEvent>,
    inbound: bool,
) {
    let mut psm = Psm {
        core,
        entry,
        events,
        pending: VecDeque::new(),
        conn: None,
        sender: None,
        deadline: None,
        dw_miss: 0,
        terminating: false,
    };

    if psm.entry.config.initiator {
        psm.connect_attempt().await;
    } else if inbound {
        psm.set_state(PeerState::WaitInboundCer);
        psm.deadline = Some(psm.after(psm.core.config.incnx_timeout));
    } else {
        psm.set_state(PeerState::WaitCer);
    }

    loop {
        if psm.state() == PeerState::Terminated {
            break;
        }

        let event = if let Some(ev) = psm.pending.pop_front() {
            Some(ev)
        } else {
            match psm.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, psm.events.recv()).await {
                        Ok(Some(ev)) => Some(ev),
                        // Queue closed underneath us: the peer was released
                        Ok(None) => break,
                        Err(_) => None,
                    }
                }
                None => match psm.events.recv().await {
                    Some(ev) => Some(ev),
                    None => break,
                },
            }
        };

        match event {
            Some(ev) => {
                log::trace!("{}: event {}", psm.entry.handle(), ev.name());
                psm.dispatch(ev).await;
            }
            None => {
                psm.deadline = None;
                psm.on_state_timeout().await;
            }
        }
    }

    psm.finalize().await;
}

impl Psm {
    fn handle(&self) -> PeerHandle {
        self.entry.handle()
    }

    fn state(&self) -> PeerState {
        self.entry.state()
    }

    fn set_state(&self, next: PeerState) {
        let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
        if shared.state != next {
            log::debug!(
                "{} '{}': {} -> {}",
                self.entry.handle(),
                self.entry.config.identity,
                shared.state,
                next
            );
            shared.state = next;
        }
    }

    fn after(&self, d: std::time::Duration) -> tokio::time::Instant {
        tokio::time::Instant::now() + d
    }

    fn timer_tc(&self) -> std::time::Duration {
        self.entry.config.timer_tc.unwrap_or(self.core.config.timer_tc)
    }

    fn timer_tw(&self) -> std::time::Duration {
        self.entry.config.timer_tw.unwrap_or(self.core.config.timer_tw)
    }

    fn mark_activity(&self, refresh_expiry: bool) {
        let lifetime = self.entry.config.lifetime;
        {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.last_activity = Instant::now();
            if refresh_expiry && lifetime.is_some() {
                shared.in_expiry = true;
            }
        }
        if refresh_expiry {
            if let Some(lifetime) = lifetime {
                self.core.expiry.update(
                    self.handle(),
                    Instant::now() + lifetime,
                    self.entry.events_sender(),
                );
            }
        }
    }

    fn fire_connect_cb(&self, result: AgentResult<()>) {
        let cb = {
            let mut connect_cb = self
                .entry
                .connect_cb
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            connect_cb.take()
        };
        if let Some(cb) = cb {
            cb(&self.entry.info(), result);
        }
    }

    fn build_base_request(&self, code: u32, payload: Bytes) -> Message {
        let mut msg = Message::request(code, 0, payload);
        let hbh = self.entry.next_hop_by_hop();
        msg.header.hop_by_hop_id = hbh;
        msg.header.end_to_end_id = hbh;
        msg
    }

    async fn send_direct(&self, msg: &Message) -> AgentResult<()> {
        match &self.conn {
            Some(conn) => conn.lock().await.send(msg).await,
            None => Err(AgentError::ConnectionClosed),
        }
    }

    /// Destroy the current connection and discard its queued leftovers.
    ///
    /// The reader task may have posted events between the fault we are
    /// reacting to and the destroy; they belong to the dead connection and
    /// must not be attributed to a later one.
    async fn destroy_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.lock().await.destroy().await;
        }
        while let Ok(ev) = self.events.try_recv() {
            match ev {
                PeerEvent::ConnMessage(_) | PeerEvent::ConnError => {
                    log::debug!(
                        "{}: discarding stale {} from a previous connection",
                        self.handle(),
                        ev.name()
                    );
                }
                other => self.pending.push_back(other),
            }
        }
    }

    async fn stop_sender(&mut self) {
        if let Some(handle) = self.sender.take() {
            if let Some(rx) = handle.stop().await {
                let mut out_rx = self.entry.out_rx.lock().unwrap_or_else(|e| e.into_inner());
                *out_rx = Some(rx);
            }
        }
    }

    fn start_sender(&mut self) {
        let rx = {
            let mut out_rx = self.entry.out_rx.lock().unwrap_or_else(|e| e.into_inner());
            out_rx.take()
        };
        match (rx, &self.conn) {
            (Some(rx), Some(conn)) => {
                self.sender = Some(sender::start(self.entry.clone(), conn.clone(), rx));
            }
            (rx, _) => {
                if let Some(rx) = rx {
                    let mut out_rx =
                        self.entry.out_rx.lock().unwrap_or_else(|e| e.into_inner());
                    *out_rx = Some(rx);
                }
                log::error!("{}: cannot start sender without a connection", self.handle());
            }
        }
    }

    async fn failover(&self) {
        let count = self
            .entry
            .sr
            .failover(&self.core.queues.outgoing_sender())
            .await;
        if count > 0 {
            log::info!(
                "{} '{}': {count} outstanding requests failed over",
                self.handle(),
                self.entry.config.identity
            );
        }
    }

    async fn leave_registry(&self) {
        let was_member = {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            let was = shared.in_active;
            shared.in_active = false;
            was
        };
        if was_member {
            self.core.actives.remove(self.handle()).await;
        }
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::DumpAll => self.entry.dump(),
            PeerEvent::Terminate { abort } => self.on_terminate(abort).await,
            PeerEvent::ConnMessage(msg) => self.on_message(msg).await,
            PeerEvent::ConnError => self.on_conn_error().await,
            PeerEvent::EndpointChange(eps) => {
                log::info!("{}: remote endpoints changed to {eps:?}", self.handle());
                if let Some(conn) = &self.conn {
                    conn.lock().await.update_remote_endpoints(eps);
                }
            }
            PeerEvent::Incoming {
                cer,
                conn,
                validate,
            } => self.on_incoming(cer, conn, validate).await,
            PeerEvent::Timeout => self.on_expired().await,
        }
    }

    async fn on_terminate(&mut self, abort: bool) {
        self.terminating = true;
        let graceful = !abort
            && matches!(self.state(), PeerState::Open | PeerState::Reopen)
            && self.conn.is_some();

        if graceful {
            self.leave_registry().await;
            self.stop_sender().await;
            let dpr = self.build_base_request(
                base_cmd::DISCONNECT_PEER,
                self.core.dict.encode_disconnect(DisconnectCause::Rebooting),
            );
            match self.send_direct(&dpr).await {
                Ok(()) => {
                    self.set_state(PeerState::Closing);
                    self.deadline = Some(self.after(self.core.config.dpr_timeout));
                }
                Err(_) => self.teardown(PeerState::Terminated).await,
            }
        } else {
            self.teardown(PeerState::Terminated).await;
        }
    }

    async fn on_conn_error(&mut self) {
        match self.state() {
            PeerState::Open | PeerState::Reopen | PeerState::Closing => {
                self.connection_failure().await;
            }
            PeerState::WaitCea => self.attempt_failed_transient().await,
            other => {
                log::debug!("{}: connection error ignored in {other}", self.handle());
            }
        }
    }

    /// The peer's inactivity lifetime expired
    async fn on_expired(&mut self) {
        log::info!(
            "{} '{}': inactivity lifetime expired, terminating",
            self.handle(),
            self.entry.config.identity
        );
        self.on_terminate(false).await;
    }

    async fn on_message(&mut self, msg: Message) {
        match self.state() {
            PeerState::WaitCea => self.on_wait_cea_message(msg).await,
            PeerState::Open | PeerState::Reopen | PeerState::Closing => {
                if msg.is_base() {
                    self.on_base_message(msg).await;
                } else {
                    self.on_app_message(msg).await;
                }
            }
            other => {
                log::debug!(
                    "{}: message cmd={} ignored in {other}",
                    self.handle(),
                    msg.header.command_code
                );
            }
        }
    }

    async fn on_base_message(&mut self, msg: Message) {
        let is_request = msg.header.is_request();
        match (msg.header.command_code, is_request) {
            (base_cmd::DEVICE_WATCHDOG, true) => {
                let dwa = Message::answer_to(
                    &msg,
                    self.core.dict.encode_watchdog(Some(ResultCode::Success)),
                );
                if self.send_direct(&dwa).await.is_err() {
                    self.connection_failure().await;
                    return;
                }
                // Traffic seen; the watchdog deadline restarts unless we are
                // waiting for our own answer. The expiry deadline does not.
                self.mark_activity(false);
                if !self.entry.flags().dw_pending {
                    self.deadline = Some(self.after(self.timer_tw()));
                }
            }
            (base_cmd::DEVICE_WATCHDOG, false) => self.on_watchdog_answer().await,
            (base_cmd::DISCONNECT_PEER, true) => self.on_dpr(msg).await,
            (base_cmd::DISCONNECT_PEER, false) => self.on_dpa().await,
            (base_cmd::CAPABILITIES_EXCHANGE, _) => {
                log::warn!(
                    "{}: unexpected capabilities exchange in {}, ignored",
                    self.handle(),
                    self.state()
                );
            }
            _ => unreachable!("is_base covers exactly three commands"),
        }
    }

    async fn on_app_message(&mut self, msg: Message) {
        if msg.header.is_answer() {
            match self.entry.sr.fetch(msg.header.hop_by_hop_id) {
                Ok(_request) => {
                    self.mark_activity(true);
                    if self.core.queues.post_incoming(msg).await.is_err() {
                        log::warn!("{}: incoming queue closed, answer dropped", self.handle());
                    }
                }
                Err(_) => {
                    // Unmatched or duplicate answer: logged and dropped
                    log::warn!(
                        "{}: no outstanding request for answer hbh={}, dropped",
                        self.handle(),
                        msg.header.hop_by_hop_id
                    );
                }
            }
        } else {
            self.mark_activity(true);
            if self.core.queues.post_incoming(msg).await.is_err() {
                log::warn!("{}: incoming queue closed, request dropped", self.handle());
            }
        }
        if !self.entry.flags().dw_pending && matches!(self.state(), PeerState::Open) {
            self.deadline = Some(self.after(self.timer_tw()));
        }
    }

    // ------------------------------------------------------------------
    // Outbound attempt
    // ------------------------------------------------------------------

    async fn connect_attempt(&mut self) {
        self.set_state(PeerState::Connecting);
        let cfg = &self.entry.config;

        let mut conn = match Connection::connect(
            cfg.transport,
            &cfg.addresses,
            self.core.config.connect_timeout,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                log::info!(
                    "{} '{}': connection attempt failed: {e}",
                    self.handle(),
                    cfg.identity
                );
                self.set_state(PeerState::Closed);
                self.deadline = Some(self.after(self.timer_tc()));
                return;
            }
        };

        conn.set_hostname(&cfg.identity);

        let started = if cfg.use_tls {
            conn.handshake(false, &self.core.tls, self.core.config.connect_timeout)
                .await
        } else {
            conn.start_clear(false)
        };
        if let Err(e) = started {
            // Negotiation failures are terminal for the attempt
            log::warn!(
                "{} '{}': handshake failed: {e}",
                self.handle(),
                cfg.identity
            );
            conn.destroy().await;
            self.set_state(PeerState::Closed);
            self.deadline = None;
            self.fire_connect_cb(Err(e));
            return;
        }

        if let Err(e) = conn.set_alt_queue(self.entry.events_sender()) {
            log::error!("{}: cannot redirect receive path: {e}", self.handle());
            conn.destroy().await;
            self.set_state(PeerState::Closed);
            self.deadline = Some(self.after(self.timer_tc()));
            return;
        }

        {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.flags.responder = false;
        }
        self.conn = Some(Arc::new(Mutex::new(conn)));

        let cer = self.build_base_request(
            base_cmd::CAPABILITIES_EXCHANGE,
            self.core.dict.encode_capabilities(&self.core.local_caps, None),
        );
        if self.send_direct(&cer).await.is_err() {
            self.attempt_failed_transient().await;
            return;
        }

        self.set_state(PeerState::WaitCea);
        self.deadline = Some(self.after(self.core.config.cea_timeout));
    }

    /// Transient failure of an outbound attempt: tear down and retry at Tc
    async fn attempt_failed_transient(&mut self) {
        self.destroy_conn().await;
        if self.terminating {
            self.teardown(PeerState::Terminated).await;
            return;
        }
        self.set_state(PeerState::Closed);
        self.deadline = Some(self.after(self.timer_tc()));
    }

    async fn on_wait_cea_message(&mut self, msg: Message) {
        let expected_cea = msg.header.command_code == base_cmd::CAPABILITIES_EXCHANGE
            && msg.header.is_answer();
        if !expected_cea {
            log::warn!(
                "{}: expected CEA, got cmd={} request={}",
                self.handle(),
                msg.header.command_code,
                msg.header.is_request()
            );
            self.attempt_failed_transient().await;
            return;
        }

        let result = self
            .core
            .dict
            .result_code(&msg)
            .map(ResultCode::from)
            .unwrap_or(ResultCode::UnableToComply);
        if !result.is_success() {
            log::warn!(
                "{} '{}': CEA refused with {result:?}",
                self.handle(),
                self.entry.config.identity
            );
            self.negotiation_failed(AgentError::CapabilityMismatch {
                code: result,
                reason: "remote refused capabilities exchange".into(),
            })
            .await;
            return;
        }

        let remote = match self.core.dict.decode_capabilities(&msg) {
            Ok(remote) => remote,
            Err(e) => {
                self.negotiation_failed(e).await;
                return;
            }
        };

        let merged = match caps::merge(
            &self.core.local_caps,
            remote,
            Some(&self.entry.config.identity),
        ) {
            Ok(merged) => merged,
            Err(e) => {
                self.negotiation_failed(e).await;
                return;
            }
        };

        {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.caps = Some(merged);
        }
        self.enter_open().await;
    }

    /// Negotiation failures are terminal for the attempt, not auto-retried
    async fn negotiation_failed(&mut self, error: AgentError) {
        log::warn!(
            "{} '{}': negotiation failed: {error}",
            self.handle(),
            self.entry.config.identity
        );
        self.destroy_conn().await;
        if self.terminating {
            self.teardown(PeerState::Terminated).await;
        } else {
            self.set_state(PeerState::Closed);
            self.deadline = None;
            self.fire_connect_cb(Err(error));
        }
    }

    // ------------------------------------------------------------------
    // Inbound handshake
    // ------------------------------------------------------------------

    async fn on_incoming(&mut self, cer: Message, mut conn: Connection, validate: bool) {
        let adoptable = self.conn.is_none()
            && matches!(
                self.state(),
                PeerState::Closed | PeerState::WaitCer | PeerState::WaitInboundCer
            );
        if !adoptable {
            log::info!(
                "{} '{}': refusing additional inbound connection in {}",
                self.handle(),
                self.entry.config.identity,
                self.state()
            );
            self.refuse_cer(&cer, &mut conn, ResultCode::UnableToComply)
                .await;
            return;
        }

        let remote = match self.core.dict.decode_capabilities(&cer) {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("{}: undecodable CER: {e}", self.handle());
                self.refuse_cer(&cer, &mut conn, ResultCode::UnableToComply)
                    .await;
                if validate {
                    self.teardown(PeerState::Terminated).await;
                }
                return;
            }
        };

        let expected = if validate {
            None
        } else {
            Some(self.entry.config.identity.as_str())
        };
        let merged = match caps::merge(&self.core.local_caps, remote, expected) {
            Ok(merged) => merged,
            Err(AgentError::CapabilityMismatch { code, reason }) => {
                log::warn!(
                    "{} '{}': capabilities mismatch: {reason}",
                    self.handle(),
                    self.entry.config.identity
                );
                self.refuse_cer(&cer, &mut conn, code).await;
                if validate {
                    self.teardown(PeerState::Terminated).await;
                } else {
                    self.set_state(PeerState::Closed);
                    self.deadline = None;
                }
                return;
            }
            Err(e) => {
                log::warn!("{}: merge failed: {e}", self.handle());
                self.refuse_cer(&cer, &mut conn, ResultCode::UnableToComply)
                    .await;
                return;
            }
        };

        {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.caps = Some(merged);
            shared.flags.responder = true;
        }

        // A new peer must be validated before it is trusted
        if validate {
            let accepted = match &self.entry.validate_cb {
                Some(cb) => cb(&self.entry.info()),
                None => false,
            };
            if !accepted {
                log::info!(
                    "{} '{}': peer rejected by validation",
                    self.handle(),
                    self.entry.config.identity
                );
                self.refuse_cer(&cer, &mut conn, ResultCode::UnknownPeer).await;
                self.teardown(PeerState::Terminated).await;
                return;
            }
        }

        if let Err(e) = conn.set_alt_queue(self.entry.events_sender()) {
            log::error!("{}: cannot redirect receive path: {e}", self.handle());
            conn.destroy().await;
            return;
        }

        self.conn = Some(Arc::new(Mutex::new(conn)));

        let cea = Message::answer_to(
            &cer,
            self.core
                .dict
                .encode_capabilities(&self.core.local_caps, Some(ResultCode::Success)),
        );
        if self.send_direct(&cea).await.is_err() {
            self.attempt_failed_transient().await;
            return;
        }

        self.enter_open().await;
    }

    async fn refuse_cer(&self, cer: &Message, conn: &mut Connection, code: ResultCode) {
        let mut cea = Message::answer_to(
            cer,
            self.core
                .dict
                .encode_capabilities(&self.core.local_caps, Some(code)),
        );
        cea.header.set_error();
        if let Err(e) = conn.send(&cea).await {
            log::debug!("{}: could not send error CEA: {e}", self.handle());
        }
        conn.destroy().await;
    }

    // ------------------------------------------------------------------
    // Open / watchdog / reopen
    // ------------------------------------------------------------------

    /// Capabilities are exchanged; either trust the peer right away or, after
    /// a connection problem, demand the configured watchdog round-trips first.
    async fn enter_open(&mut self) {
        let cnx_problem = self.entry.flags().cnx_problem;
        if cnx_problem {
            {
                let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
                shared.flags.reopen_left = self.core.config.reopen_rounds;
            }
            self.set_state(PeerState::Reopen);
            self.dw_miss = 0;
            if self.send_watchdog().await.is_err() {
                self.connection_failure().await;
                return;
            }
            self.deadline = Some(self.after(self.timer_tw()));
            return;
        }

        self.set_state(PeerState::Open);
        {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.flags.dw_pending = false;
            shared.in_active = true;
        }
        self.dw_miss = 0;
        if let Err(e) = self.core.actives.insert(self.handle()).await {
            log::error!("{}: {e}", self.handle());
        }
        self.start_sender();
        self.mark_activity(true);
        self.fire_connect_cb(Ok(()));
        self.deadline = Some(self.after(self.timer_tw()));
    }

    async fn send_watchdog(&mut self) -> AgentResult<()> {
        let dwr = self.build_base_request(
            base_cmd::DEVICE_WATCHDOG,
            self.core.dict.encode_watchdog(None),
        );
        self.send_direct(&dwr).await?;
        let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.flags.dw_pending = true;
        Ok(())
    }

    async fn on_watchdog_answer(&mut self) {
        self.dw_miss = 0;
        let reopen_done = {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.flags.dw_pending = false;
            shared.last_activity = Instant::now();
            if shared.state == PeerState::Reopen {
                shared.flags.reopen_left = shared.flags.reopen_left.saturating_sub(1);
                if shared.flags.reopen_left == 0 {
                    shared.flags.cnx_problem = false;
                    Some(true)
                } else {
                    Some(false)
                }
            } else {
                None
            }
        };

        match reopen_done {
            // Stable again: promote to OPEN
            Some(true) => self.enter_open().await,
            // More round-trips required; probe again right away
            Some(false) => {
                if self.send_watchdog().await.is_err() {
                    self.connection_failure().await;
                    return;
                }
                self.deadline = Some(self.after(self.timer_tw()));
            }
            None => {
                self.deadline = Some(self.after(self.timer_tw()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Disconnect handshake
    // ------------------------------------------------------------------

    async fn on_dpr(&mut self, dpr: Message) {
        let cause = self.core.dict.disconnect_cause(&dpr);
        log::info!(
            "{} '{}': DPR received (cause {cause:?})",
            self.handle(),
            self.entry.config.identity
        );

        let dpa = Message::answer_to(
            &dpr,
            self.core
                .dict
                .encode_disconnect_answer(ResultCode::Success),
        );
        let _ = self.send_direct(&dpa).await;

        self.leave_registry().await;
        self.stop_sender().await;
        self.destroy_conn().await;
        self.failover().await;
        {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.flags.dw_pending = false;
        }

        if self.terminating || cause == Some(DisconnectCause::DoNotWantToTalkToYou) {
            self.teardown(PeerState::Terminated).await;
        } else if self.entry.config.initiator {
            // Remote is rebooting or busy: retry at the next Tc tick
            self.set_state(PeerState::Closed);
            self.deadline = Some(self.after(self.timer_tc()));
        } else {
            self.set_state(PeerState::Closed);
            self.deadline = None;
        }
    }

    async fn on_dpa(&mut self) {
        if self.state() != PeerState::Closing {
            log::debug!("{}: stray DPA ignored", self.handle());
            return;
        }
        self.destroy_conn().await;
        self.failover().await;
        self.teardown(PeerState::Terminated).await;
    }

    // ------------------------------------------------------------------
    // Failure and teardown
    // ------------------------------------------------------------------

    /// Transport failure while connected: failover and reconnect per policy
    async fn connection_failure(&mut self) {
        log::warn!(
            "{} '{}': connection failed in {}",
            self.handle(),
            self.entry.config.identity,
            self.state()
        );

        // Removal from the registry always precedes connection destruction
        self.leave_registry().await;
        self.stop_sender().await;
        self.destroy_conn().await;
        self.failover().await;

        {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.flags.dw_pending = false;
            shared.flags.cnx_problem = true;
            shared.flags.reopen_left = self.core.config.reopen_rounds;
        }
        self.dw_miss = 0;

        if self.terminating {
            self.teardown(PeerState::Terminated).await;
        } else if self.entry.config.initiator {
            self.connect_attempt().await;
        } else {
            self.set_state(PeerState::Closed);
            self.deadline = None;
        }
    }

    /// Release everything this peer owns. Safe to call more than once.
    async fn teardown(&mut self, final_state: PeerState) {
        self.leave_registry().await;
        self.stop_sender().await;
        self.destroy_conn().await;
        self.failover().await;

        let in_expiry = {
            let mut shared = self.entry.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.flags.dw_pending = false;
            let was = shared.in_expiry;
            shared.in_expiry = false;
            was
        };
        if in_expiry {
            self.core.expiry.remove(self.handle());
        }

        self.fire_connect_cb(Err(AgentError::ConnectionClosed));
        self.set_state(final_state);
        self.deadline = None;
    }

    async fn finalize(&mut self) {
        self.teardown(PeerState::Terminated).await;
        self.events.close();
    }

    // ------------------------------------------------------------------
    // State deadlines
    // ------------------------------------------------------------------

    async fn on_state_timeout(&mut self) {
        match self.state() {
            PeerState::Closed => {
                if self.entry.config.initiator && !self.terminating {
                    self.connect_attempt().await;
                }
            }
            PeerState::WaitCea => {
                log::info!(
                    "{} '{}': no CEA within the deadline",
                    self.handle(),
                    self.entry.config.identity
                );
                self.attempt_failed_transient().await;
            }
            PeerState::WaitInboundCer => {
                log::info!(
                    "{}: no capabilities exchange on inbound connection",
                    self.handle()
                );
                self.teardown(PeerState::Terminated).await;
            }
            PeerState::Open | PeerState::Reopen => self.on_watchdog_tick().await,
            PeerState::Closing => {
                log::info!(
                    "{} '{}': no DPA within the deadline",
                    self.handle(),
                    self.entry.config.identity
                );
                self.destroy_conn().await;
                self.failover().await;
                self.teardown(PeerState::Terminated).await;
            }
            PeerState::Connecting | PeerState::WaitCer | PeerState::Terminated => {}
        }
    }

    async fn on_watchdog_tick(&mut self) {
        let dw_pending = self.entry.flags().dw_pending;
        if dw_pending {
            self.dw_miss += 1;
            if self.dw_miss >= 2 || self.state() == PeerState::Reopen {
                // Second consecutive missed probe forces disconnection; an
                // unstable reopening peer gets no second chance
                log::warn!(
                    "{} '{}': watchdog answers missing, disconnecting",
                    self.handle(),
                    self.entry.config.identity
                );
                self.connection_failure().await;
                return;
            }
            log::info!(
                "{} '{}': watchdog unanswered, probing once more",
                self.handle(),
                self.entry.config.identity
            );
        }
        if self.send_watchdog().await.is_err() {
            self.connection_failure().await;
            return;
        }
        self.deadline = Some(self.after(self.timer_tw()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_are_stable() {
        assert_eq!(PeerState::Open.name(), "OPEN");
        assert_eq!(PeerState::WaitInboundCer.name(), "WAIT_INBOUND_CER");
        assert_eq!(PeerState::Reopen.name(), "REOPEN");
        assert_eq!(PeerState::Terminated.name(), "TERMINATED");
    }
}
