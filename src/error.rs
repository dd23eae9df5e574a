//! Agent error types

use thiserror::Error;

/// Error type for the connection/session core
#[derive(Error, Debug)]
pub enum AgentError {
    // Transient transport faults
    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("Connection attempt failed: {0}")]
    ConnectFailed(String),

    #[error("Receive deadline expired")]
    RecvTimeout,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    // Negotiation errors
    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("TLS handshake refused: {0}")]
    HandshakeRefused(String),

    #[error("Invalid credential material: {0}")]
    BadCredentials(String),

    #[error("Capability mismatch ({code:?}): {reason}")]
    CapabilityMismatch { code: ResultCode, reason: String },

    // Resource errors
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // Invariant violations
    #[error("Stale or invalid peer handle")]
    StalePeer,

    // Sent-request store
    #[error("Duplicate outstanding request for hop-by-hop id {0}")]
    DuplicateRequest(u32),

    #[error("No outstanding request for hop-by-hop id {0}")]
    RequestNotFound(u32),

    #[error("Queue closed")]
    QueueClosed,

    #[error("Transport not available: {0}")]
    TransportUnavailable(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Transient transport faults are handled by a state transition and
    /// failover; everything else is terminal for the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::ConnectTimeout
                | AgentError::ConnectFailed(_)
                | AgentError::RecvTimeout
                | AgentError::ConnectionClosed
                | AgentError::MalformedFrame(_)
                | AgentError::Io(_)
        )
    }
}

/// Result type for the connection/session core
pub type AgentResult<T> = Result<T, AgentError>;

/// Diameter Result-Code values the core emits or interprets (RFC 6733)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 2001,
    LimitedSuccess = 2002,
    TooBusy = 3004,
    UnknownPeer = 3010,
    NoCommonApplication = 5010,
    UnsupportedVersion = 5011,
    UnableToComply = 5012,
    NoCommonSecurity = 5017,
}

impl ResultCode {
    /// Check if result code indicates success
    pub fn is_success(&self) -> bool {
        let code = *self as u32;
        (2000..3000).contains(&code)
    }
}

impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            2001 => ResultCode::Success,
            2002 => ResultCode::LimitedSuccess,
            3004 => ResultCode::TooBusy,
            3010 => ResultCode::UnknownPeer,
            5010 => ResultCode::NoCommonApplication,
            5011 => ResultCode::UnsupportedVersion,
            5017 => ResultCode::NoCommonSecurity,
            _ => ResultCode::UnableToComply,
        }
    }
}
