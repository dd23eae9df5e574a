//! Diameter message header codec and opaque-payload message type
//!
//! Message format (RFC 6733):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |                 Message Length                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | command flags |                  Command-Code                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Application-ID                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Hop-by-Hop Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      End-to-End Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  AVPs ...
//! +-+-+-+-+-+-+-+-+-+-+-+-
//! ```
//!
//! AVP encoding belongs to the dictionary collaborator; the payload past the
//! header is carried as opaque bytes here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{AgentError, AgentResult};
use crate::DIAMETER_VERSION;

/// Diameter message header size
pub const HEADER_SIZE: usize = 20;

/// Command flags
pub mod cmd_flags {
    /// Request bit
    pub const REQUEST: u8 = 0x80;
    /// Proxiable bit
    pub const PROXIABLE: u8 = 0x40;
    /// Error bit
    pub const ERROR: u8 = 0x20;
    /// Potentially re-transmitted bit
    pub const RETRANSMIT: u8 = 0x10;
}

/// Base protocol command codes handled inside the peer state machine
pub mod base_cmd {
    /// CER/CEA
    pub const CAPABILITIES_EXCHANGE: u32 = 257;
    /// DWR/DWA
    pub const DEVICE_WATCHDOG: u32 = 280;
    /// DPR/DPA
    pub const DISCONNECT_PEER: u32 = 282;
}

/// Diameter message header
#[derive(Debug, Clone)]
pub struct Header {
    /// Protocol version (always 1)
    pub version: u8,
    /// Message length including header
    pub length: u32,
    /// Command flags
    pub flags: u8,
    /// Command code
    pub command_code: u32,
    /// Application ID
    pub application_id: u32,
    /// Hop-by-Hop identifier
    pub hop_by_hop_id: u32,
    /// End-to-End identifier
    pub end_to_end_id: u32,
}

impl Header {
    /// Create a new request header
    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: HEADER_SIZE as u32,
            flags: cmd_flags::REQUEST,
            command_code,
            application_id,
            hop_by_hop_id: 0,
            end_to_end_id: 0,
        }
    }

    /// Create an answer header from a request, echoing its identifiers
    pub fn new_answer(request: &Header) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: HEADER_SIZE as u32,
            flags: request.flags & !(cmd_flags::REQUEST | cmd_flags::RETRANSMIT),
            command_code: request.command_code,
            application_id: request.application_id,
            hop_by_hop_id: request.hop_by_hop_id,
            end_to_end_id: request.end_to_end_id,
        }
    }

    /// Check if this is a request
    pub fn is_request(&self) -> bool {
        self.flags & cmd_flags::REQUEST != 0
    }

    /// Check if this is an answer
    pub fn is_answer(&self) -> bool {
        !self.is_request()
    }

    /// Check if the error bit is set
    pub fn is_error(&self) -> bool {
        self.flags & cmd_flags::ERROR != 0
    }

    /// Set the error bit
    pub fn set_error(&mut self) {
        self.flags |= cmd_flags::ERROR;
    }

    /// Set the potentially-retransmitted bit
    pub fn set_retransmit(&mut self) {
        self.flags |= cmd_flags::RETRANSMIT;
    }

    /// Encode header into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        // Length is 3 bytes
        buf.put_u8(((self.length >> 16) & 0xFF) as u8);
        buf.put_u16((self.length & 0xFFFF) as u16);
        buf.put_u8(self.flags);
        // Command code is 3 bytes
        buf.put_u8(((self.command_code >> 16) & 0xFF) as u8);
        buf.put_u16((self.command_code & 0xFFFF) as u16);
        buf.put_u32(self.application_id);
        buf.put_u32(self.hop_by_hop_id);
        buf.put_u32(self.end_to_end_id);
    }

    /// Decode header from bytes
    pub fn decode(buf: &mut Bytes) -> AgentResult<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(AgentError::MalformedFrame(format!(
                "need {} header bytes, have {}",
                HEADER_SIZE,
                buf.remaining()
            )));
        }

        let version = buf.get_u8();
        if version != DIAMETER_VERSION {
            return Err(AgentError::MalformedFrame(format!(
                "unsupported Diameter version {version}"
            )));
        }

        let len_high = buf.get_u8() as u32;
        let len_low = buf.get_u16() as u32;
        let length = (len_high << 16) | len_low;

        let flags = buf.get_u8();

        let code_high = buf.get_u8() as u32;
        let code_low = buf.get_u16() as u32;
        let command_code = (code_high << 16) | code_low;

        Ok(Self {
            version,
            length,
            flags,
            command_code,
            application_id: buf.get_u32(),
            hop_by_hop_id: buf.get_u32(),
            end_to_end_id: buf.get_u32(),
        })
    }
}

/// One framed Diameter message: parsed header, opaque AVP payload
#[derive(Debug, Clone)]
pub struct Message {
    /// Parsed header
    pub header: Header,
    /// AVP bytes, owned by the dictionary collaborator
    pub payload: Bytes,
}

impl Message {
    /// Create a request with the given payload
    pub fn request(command_code: u32, application_id: u32, payload: Bytes) -> Self {
        Self {
            header: Header::new_request(command_code, application_id),
            payload,
        }
    }

    /// Create an answer to a request with the given payload
    pub fn answer_to(request: &Message, payload: Bytes) -> Self {
        Self {
            header: Header::new_answer(&request.header),
            payload,
        }
    }

    /// Check whether this is a base protocol message (handshake-internal)
    pub fn is_base(&self) -> bool {
        matches!(
            self.header.command_code,
            base_cmd::CAPABILITIES_EXCHANGE | base_cmd::DEVICE_WATCHDOG | base_cmd::DISCONNECT_PEER
        )
    }

    /// Encode the full message, fixing up the length field
    pub fn encode(&self) -> Bytes {
        let total = HEADER_SIZE + self.payload.len();
        let mut buf = BytesMut::with_capacity(total);
        let mut header = self.header.clone();
        header.length = total as u32;
        header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a full message from one complete frame
    pub fn decode(mut frame: Bytes) -> AgentResult<Self> {
        let header = Header::decode(&mut frame)?;
        if header.length as usize != HEADER_SIZE + frame.remaining() {
            return Err(AgentError::MalformedFrame(format!(
                "length field {} does not match frame size {}",
                header.length,
                HEADER_SIZE + frame.remaining()
            )));
        }
        Ok(Self {
            header,
            payload: frame,
        })
    }
}

/// Disconnect cause values for DPR (RFC 6733 Section 5.4.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectCause {
    Rebooting = 0,
    Busy = 1,
    DoNotWantToTalkToYou = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut hdr = Header::new_request(base_cmd::CAPABILITIES_EXCHANGE, 0);
        hdr.hop_by_hop_id = 0xdeadbeef;
        hdr.end_to_end_id = 42;
        hdr.length = HEADER_SIZE as u32;

        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = Header::decode(&mut bytes).unwrap();
        assert_eq!(decoded.command_code, base_cmd::CAPABILITIES_EXCHANGE);
        assert_eq!(decoded.hop_by_hop_id, 0xdeadbeef);
        assert_eq!(decoded.end_to_end_id, 42);
        assert!(decoded.is_request());
    }

    #[test]
    fn test_message_roundtrip_with_payload() {
        let payload = Bytes::from_static(b"opaque avps");
        let msg = Message::request(base_cmd::DEVICE_WATCHDOG, 0, payload.clone());

        let wire = msg.encode();
        assert_eq!(wire.len(), HEADER_SIZE + payload.len());

        let decoded = Message::decode(wire).unwrap();
        assert_eq!(decoded.header.command_code, base_cmd::DEVICE_WATCHDOG);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_answer_echoes_identifiers() {
        let mut req = Message::request(282, 0, Bytes::new());
        req.header.hop_by_hop_id = 7;
        req.header.end_to_end_id = 9;
        req.header.set_retransmit();

        let ans = Message::answer_to(&req, Bytes::new());
        assert!(ans.header.is_answer());
        assert!(!ans.header.is_error());
        assert_eq!(ans.header.flags & cmd_flags::RETRANSMIT, 0);
        assert_eq!(ans.header.hop_by_hop_id, 7);
        assert_eq!(ans.header.end_to_end_id, 9);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let msg = Message::request(257, 0, Bytes::new());
        let mut wire = BytesMut::from(&msg.encode()[..]);
        wire[0] = 2;
        let err = Message::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, AgentError::MalformedFrame(_)));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let msg = Message::request(257, 0, Bytes::from_static(b"abcd"));
        let wire = msg.encode();
        // Truncate the frame below the advertised length
        let truncated = wire.slice(0..wire.len() - 2);
        let err = Message::decode(truncated).unwrap_err();
        assert!(matches!(err, AgentError::MalformedFrame(_)));
    }

    #[test]
    fn test_base_command_classification() {
        assert!(Message::request(257, 0, Bytes::new()).is_base());
        assert!(Message::request(280, 0, Bytes::new()).is_base());
        assert!(Message::request(282, 0, Bytes::new()).is_base());
        assert!(!Message::request(318, 16777251, Bytes::new()).is_base());
    }
}
