//! Listening-socket subsystem
//!
//! One task per listening transport. An accepted connection gets a bounded
//! window to present its CER; the first message is then handed to the peer
//! layer, which matches it to a configured peer or allocates a new one
//! pending validation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::context::{self, AgentCore};
use crate::error::{AgentError, AgentResult};
use crate::message::base_cmd;
use crate::transport::{Connection, Listener};

/// Running listener tasks
pub struct Servers {
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl Servers {
    /// Bind and start every configured listening socket
    pub(crate) async fn start(core: Arc<AgentCore>) -> AgentResult<Servers> {
        let mut tasks = Vec::new();
        let mut local_addrs = Vec::new();

        for ip in &core.config.addresses {
            let listener = Listener::bind_tcp(SocketAddr::new(*ip, core.config.port)).await?;
            let addr = listener.local_addr()?;
            log::info!("listening on {addr} ({})", listener.kind());
            local_addrs.push(addr);
            tasks.push(tokio::spawn(accept_loop(core.clone(), listener, false)));

            if core.config.tls.is_some() {
                let listener =
                    Listener::bind_tcp(SocketAddr::new(*ip, core.config.port_tls)).await?;
                let addr = listener.local_addr()?;
                log::info!("listening on {addr} ({}/TLS)", listener.kind());
                local_addrs.push(addr);
                tasks.push(tokio::spawn(accept_loop(core.clone(), listener, true)));
            }
        }

        if !core.config.no_sctp {
            match Listener::bind_sctp(core.config.port, &core.config.addresses) {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    log::info!("listening on {addr} ({})", listener.kind());
                    local_addrs.push(addr);
                    tasks.push(tokio::spawn(accept_loop(core.clone(), listener, false)));
                }
                Err(AgentError::TransportUnavailable(reason)) => {
                    log::debug!("SCTP listener skipped: {reason}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Servers { tasks, local_addrs })
    }

    /// Addresses the agent is actually listening on
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting new connections. Established peers are unaffected.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Servers {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(core: Arc<AgentCore>, listener: Listener, tls: bool) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                tokio::spawn(handle_accepted(core.clone(), conn, tls));
            }
            Err(e) => {
                log::warn!("failed to accept connection: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_accepted(core: Arc<AgentCore>, mut conn: Connection, tls: bool) {
    let origin = conn.id();

    let started = if tls {
        conn.handshake(true, &core.tls, core.config.connect_timeout)
            .await
    } else {
        conn.start_clear(false)
    };
    if let Err(e) = started {
        log::info!("{origin}: inbound handshake failed: {e}");
        conn.destroy().await;
        return;
    }

    let first = match conn.recv(core.config.incnx_timeout).await {
        Ok(msg) => msg,
        Err(e) => {
            log::info!("{origin}: no capabilities exchange received: {e}");
            conn.destroy().await;
            return;
        }
    };

    if first.header.command_code != base_cmd::CAPABILITIES_EXCHANGE || !first.header.is_request() {
        log::warn!(
            "{origin}: first message was cmd={} request={}, expected CER",
            first.header.command_code,
            first.header.is_request()
        );
        conn.destroy().await;
        return;
    }

    if let Err(e) = context::handle_new_incoming(&core, first, conn).await {
        log::info!("{origin}: inbound connection rejected: {e}");
    }
}
