//! Diameter agent connection and session management core
//!
//! Implements the peer-facing half of a Diameter node per RFC 6733:
//! - per-peer state machine driving capabilities exchange (CER/CEA), device
//!   watchdog liveness (DWR/DWA) and the disconnect handshake (DPR/DPA)
//! - transport-agnostic connection contexts over TCP (optionally TLS) and
//!   kernel SCTP
//! - sent-request tracking with failover, so no in-flight request is
//!   silently lost when a peer connection fails
//! - the active-peer registry, peer expiry timers and the global queues
//!   feeding the routing and extension layers
//!
//! AVP encoding and the dictionary of protocol objects live outside this
//! crate, behind the [`caps::DictionaryAdapter`] trait; routing policy
//! consumes the global queues.

pub mod caps;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod expiry;
pub mod message;
pub mod peer;
pub mod psm;
pub mod queues;
pub mod registry;
pub mod request;
#[cfg(feature = "kernel-sctp")]
pub mod sctp;
pub mod sender;
pub mod servers;
pub mod tls;
pub mod transport;

pub use caps::{Capabilities, DictionaryAdapter};
pub use config::{AgentConfig, PeerConfig, TlsConfig};
pub use context::{AgentContext, AgentCore};
pub use error::{AgentError, AgentResult, ResultCode};
pub use event::PeerEvent;
pub use message::{base_cmd, cmd_flags, DisconnectCause, Header, Message};
pub use peer::{PeerFlags, PeerHandle, PeerInfo, PeerState, PeerTable};
pub use queues::{GlobalQueues, OutboundMessage};
pub use registry::ActivePeers;
pub use request::SentRequestStore;
pub use transport::{ConnRole, Connection, Listener, TlsMaterial, TransportKind};

/// Diameter protocol version
pub const DIAMETER_VERSION: u8 = 1;

/// Default Diameter port
pub const DIAMETER_PORT: u16 = 3868;

/// Default Diameter/TLS port
pub const DIAMETER_TLS_PORT: u16 = 5658;
