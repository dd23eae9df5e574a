//! Peer event codespace
//!
//! Every interaction with a peer state machine goes through its event queue;
//! events are processed strictly in arrival order.

use std::net::SocketAddr;

use crate::message::Message;
use crate::transport::Connection;

/// Events delivered to a peer state machine
#[derive(Debug)]
pub enum PeerEvent {
    /// Dump all info about this peer in the debug log
    DumpAll,

    /// Request to terminate this peer: disconnect, requeue all messages.
    /// `abort` skips waiting for in-progress protocol exchanges.
    Terminate { abort: bool },

    /// The connection has received a message
    ConnMessage(Message),

    /// The connection has encountered an error (disconnected)
    ConnError,

    /// Endpoints of the connection have changed (multihomed transport)
    EndpointChange(Vec<SocketAddr>),

    /// A new inbound connection has been matched to this peer
    Incoming {
        /// The CER received on the connection
        cer: Message,
        /// The connection context carrying it
        conn: Connection,
        /// The peer is new and must be validated before a success CEA
        validate: bool,
    },

    /// The peer's inactivity deadline has expired
    Timeout,
}

impl PeerEvent {
    /// Event-kind name for logs
    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::DumpAll => "DumpAll",
            PeerEvent::Terminate { .. } => "Terminate",
            PeerEvent::ConnMessage(_) => "ConnMessage",
            PeerEvent::ConnError => "ConnError",
            PeerEvent::EndpointChange(_) => "EndpointChange",
            PeerEvent::Incoming { .. } => "Incoming",
            PeerEvent::Timeout => "Timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(PeerEvent::DumpAll.name(), "DumpAll");
        assert_eq!(PeerEvent::Terminate { abort: false }.name(), "Terminate");
        assert_eq!(PeerEvent::ConnError.name(), "ConnError");
        assert_eq!(PeerEvent::Timeout.name(), "Timeout");
    }
}
