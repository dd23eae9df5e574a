//! Agent and per-peer configuration types

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::transport::TransportKind;

/// Process-wide agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Diameter Identity of the local peer (FQDN)
    pub identity: String,

    /// Diameter realm of the local peer
    pub realm: String,

    /// Local bind addresses for listening sockets
    pub addresses: Vec<IpAddr>,

    /// Local port for cleartext Diameter (default: 3868)
    pub port: u16,

    /// Local port for Diameter/TLS (default: 5658)
    pub port_tls: u16,

    /// Disable the use of SCTP
    pub no_sctp: bool,

    /// Tc timer: delay before retrying a failed outbound connection
    pub timer_tc: Duration,

    /// Tw timer: device watchdog cadence while a peer is open
    pub timer_tw: Duration,

    /// Deadline for establishing a transport connection
    pub connect_timeout: Duration,

    /// Deadline for receiving a CER after accepting an inbound connection
    pub incnx_timeout: Duration,

    /// Deadline for receiving a CEA after sending a CER
    pub cea_timeout: Duration,

    /// Deadline for receiving a DPA after sending a DPR
    pub dpr_timeout: Duration,

    /// Watchdog round-trips required before a reopened peer is trusted again
    pub reopen_rounds: u8,

    /// Per-peer event queue depth
    pub event_queue_depth: usize,

    /// Per-peer outbound queue depth
    pub outbound_queue_depth: usize,

    /// Global incoming/outgoing/local queue depth
    pub global_queue_depth: usize,

    /// TLS credential material, when the agent should offer or accept TLS
    pub tls: Option<TlsConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            realm: String::new(),
            addresses: vec![IpAddr::from([0, 0, 0, 0])],
            port: crate::DIAMETER_PORT,
            port_tls: crate::DIAMETER_TLS_PORT,
            no_sctp: false,
            timer_tc: Duration::from_secs(30),
            timer_tw: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            incnx_timeout: Duration::from_secs(20),
            cea_timeout: Duration::from_secs(10),
            dpr_timeout: Duration::from_secs(15),
            reopen_rounds: 3,
            event_queue_depth: 64,
            outbound_queue_depth: 128,
            global_queue_depth: 1024,
            tls: None,
        }
    }
}

/// TLS credential material, treated as opaque paths to PEM files
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Certificate chain file
    pub cert_path: String,

    /// Private key file
    pub key_path: String,

    /// CA bundle used to verify the remote peer (None: webpki roots)
    pub ca_path: Option<String>,

    /// Require a client certificate on accepted TLS connections
    pub require_client_cert: bool,
}

/// Per-peer connection configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Diameter Identity of the remote peer
    pub identity: String,

    /// Diameter realm of the remote peer
    pub realm: String,

    /// Transport to use for outbound attempts
    pub transport: TransportKind,

    /// Candidate remote endpoints, tried in order
    pub addresses: Vec<SocketAddr>,

    /// Whether the local peer initiates the connection
    pub initiator: bool,

    /// Negotiate TLS after the transport connection is established
    pub use_tls: bool,

    /// Tc override for this peer (None: agent default)
    pub timer_tc: Option<Duration>,

    /// Tw override for this peer (None: agent default)
    pub timer_tw: Option<Duration>,

    /// Inactivity lifetime; expired peers are terminated. Configured peers
    /// normally have no lifetime, dynamically discovered peers do.
    pub lifetime: Option<Duration>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            realm: String::new(),
            transport: TransportKind::Tcp,
            addresses: Vec::new(),
            initiator: true,
            use_tls: false,
            timer_tc: None,
            timer_tw: None,
            lifetime: None,
        }
    }
}
