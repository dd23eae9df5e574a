//! Peer capability state and the capabilities-exchange merge
//!
//! The decoded content of CER/CEA messages is owned by the dictionary
//! collaborator; this module only defines the negotiated capability state the
//! core keeps per peer and the merge rules applied when a CER or CEA arrives.

use std::net::IpAddr;

use bytes::Bytes;

use crate::error::{AgentError, AgentResult, ResultCode};
use crate::message::{DisconnectCause, Message};

/// Capability set advertised by one peer in a CER or CEA
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Origin-Host (FQDN)
    pub origin_host: String,

    /// Origin-Realm
    pub origin_realm: String,

    /// Host-IP-Address entries
    pub host_addresses: Vec<IpAddr>,

    /// Vendor-Id
    pub vendor_id: u32,

    /// Product-Name
    pub product_name: String,

    /// Supported application ids (Auth + Acct + vendor-specific)
    pub applications: Vec<u32>,

    /// Inband-Security-Id announced TLS support
    pub inband_security: bool,
}

impl Capabilities {
    /// Application ids supported by both capability sets
    pub fn common_applications(&self, other: &Capabilities) -> Vec<u32> {
        self.applications
            .iter()
            .copied()
            .filter(|app| other.applications.contains(app))
            .collect()
    }
}

/// Merge a remote capability set against the local one.
///
/// Returns the negotiated state stored on the peer, or a
/// [`AgentError::CapabilityMismatch`] carrying the Result-Code to place in
/// the error answer. An expected identity of `Some(..)` additionally pins
/// the remote Origin-Host to the configured value.
pub fn merge(
    local: &Capabilities,
    remote: Capabilities,
    expected_identity: Option<&str>,
) -> AgentResult<Capabilities> {
    if remote.origin_host.is_empty() || remote.origin_realm.is_empty() {
        return Err(AgentError::CapabilityMismatch {
            code: ResultCode::UnableToComply,
            reason: "missing Origin-Host or Origin-Realm".into(),
        });
    }

    if remote.origin_host == local.origin_host {
        return Err(AgentError::CapabilityMismatch {
            code: ResultCode::UnknownPeer,
            reason: format!("remote identity {} is our own", remote.origin_host),
        });
    }

    if let Some(expected) = expected_identity {
        if remote.origin_host != expected {
            return Err(AgentError::CapabilityMismatch {
                code: ResultCode::UnknownPeer,
                reason: format!(
                    "identity {} does not match configured {expected}",
                    remote.origin_host
                ),
            });
        }
    }

    let common = local.common_applications(&remote);
    if common.is_empty() {
        return Err(AgentError::CapabilityMismatch {
            code: ResultCode::NoCommonApplication,
            reason: format!(
                "no common application (local {:?}, remote {:?})",
                local.applications, remote.applications
            ),
        });
    }

    Ok(Capabilities {
        applications: common,
        inband_security: local.inband_security && remote.inband_security,
        ..remote
    })
}

/// Boundary to the message/dictionary collaborator.
///
/// The core never encodes or decodes AVPs itself; it hands opaque payloads
/// across this trait. Implementations live outside this crate (a test
/// dictionary lives in [`testdict`]).
pub trait DictionaryAdapter: Send + Sync {
    /// Decode the capability set carried by a CER or CEA
    fn decode_capabilities(&self, msg: &Message) -> AgentResult<Capabilities>;

    /// Encode a CER payload (`result` None) or CEA payload (`result` Some)
    fn encode_capabilities(&self, caps: &Capabilities, result: Option<ResultCode>) -> Bytes;

    /// Encode a DWR payload (`result` None) or DWA payload (`result` Some)
    fn encode_watchdog(&self, result: Option<ResultCode>) -> Bytes;

    /// Encode a DPR payload
    fn encode_disconnect(&self, cause: DisconnectCause) -> Bytes;

    /// Encode a DPA payload
    fn encode_disconnect_answer(&self, result: ResultCode) -> Bytes;

    /// Extract the Result-Code from an answer payload, if present
    fn result_code(&self, msg: &Message) -> Option<u32>;

    /// Extract the Disconnect-Cause from a DPR payload, if present
    fn disconnect_cause(&self, msg: &Message) -> Option<DisconnectCause>;
}

/// Minimal dictionary used by the test suites in this crate.
///
/// Payload layout is a private fixture format, not Diameter AVP encoding:
/// a one-byte tag followed by tag-specific fields.
#[cfg(test)]
pub(crate) mod testdict {
    use bytes::{Buf, BufMut, Bytes, BytesMut};

    use super::*;

    const TAG_CAPS: u8 = 1;
    const TAG_WATCHDOG: u8 = 2;
    const TAG_DISCONNECT: u8 = 3;
    const TAG_RESULT: u8 = 4;

    pub struct TestDictionary;

    fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u16(s.len() as u16);
        buf.put_slice(s.as_bytes());
    }

    fn get_string(buf: &mut Bytes) -> String {
        let len = buf.get_u16() as usize;
        let raw = buf.split_to(len);
        String::from_utf8_lossy(&raw).into_owned()
    }

    impl DictionaryAdapter for TestDictionary {
        fn decode_capabilities(&self, msg: &Message) -> AgentResult<Capabilities> {
            let mut buf = msg.payload.clone();
            if buf.remaining() < 1 || buf.get_u8() != TAG_CAPS {
                return Err(AgentError::Protocol("not a capabilities payload".into()));
            }
            // result code slot, present on CEA
            let _result = buf.get_u32();
            let origin_host = get_string(&mut buf);
            let origin_realm = get_string(&mut buf);
            let product_name = get_string(&mut buf);
            let vendor_id = buf.get_u32();
            let inband_security = buf.get_u8() != 0;
            let napps = buf.get_u16() as usize;
            let mut applications = Vec::with_capacity(napps);
            for _ in 0..napps {
                applications.push(buf.get_u32());
            }
            Ok(Capabilities {
                origin_host,
                origin_realm,
                host_addresses: Vec::new(),
                vendor_id,
                product_name,
                applications,
                inband_security,
            })
        }

        fn encode_capabilities(&self, caps: &Capabilities, result: Option<ResultCode>) -> Bytes {
            let mut buf = BytesMut::new();
            buf.put_u8(TAG_CAPS);
            buf.put_u32(result.map(|r| r as u32).unwrap_or(0));
            put_string(&mut buf, &caps.origin_host);
            put_string(&mut buf, &caps.origin_realm);
            put_string(&mut buf, &caps.product_name);
            buf.put_u32(caps.vendor_id);
            buf.put_u8(caps.inband_security as u8);
            buf.put_u16(caps.applications.len() as u16);
            for app in &caps.applications {
                buf.put_u32(*app);
            }
            buf.freeze()
        }

        fn encode_watchdog(&self, result: Option<ResultCode>) -> Bytes {
            let mut buf = BytesMut::new();
            buf.put_u8(TAG_WATCHDOG);
            buf.put_u32(result.map(|r| r as u32).unwrap_or(0));
            buf.freeze()
        }

        fn encode_disconnect(&self, cause: DisconnectCause) -> Bytes {
            let mut buf = BytesMut::new();
            buf.put_u8(TAG_DISCONNECT);
            buf.put_u32(cause as u32);
            buf.freeze()
        }

        fn encode_disconnect_answer(&self, result: ResultCode) -> Bytes {
            let mut buf = BytesMut::new();
            buf.put_u8(TAG_RESULT);
            buf.put_u32(result as u32);
            buf.freeze()
        }

        fn result_code(&self, msg: &Message) -> Option<u32> {
            let mut buf = msg.payload.clone();
            if buf.remaining() < 5 {
                return None;
            }
            let _tag = buf.get_u8();
            let code = buf.get_u32();
            (code != 0).then_some(code)
        }

        fn disconnect_cause(&self, msg: &Message) -> Option<DisconnectCause> {
            let mut buf = msg.payload.clone();
            if buf.remaining() < 5 || buf.get_u8() != TAG_DISCONNECT {
                return None;
            }
            match buf.get_u32() {
                0 => Some(DisconnectCause::Rebooting),
                1 => Some(DisconnectCause::Busy),
                2 => Some(DisconnectCause::DoNotWantToTalkToYou),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(host: &str, apps: &[u32]) -> Capabilities {
        Capabilities {
            origin_host: host.to_string(),
            origin_realm: "example.com".to_string(),
            applications: apps.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_success_keeps_common_applications() {
        let local = caps("mme.example.com", &[16777251, 16777272]);
        let remote = caps("hss.example.com", &[16777251, 4]);

        let merged = merge(&local, remote, None).unwrap();
        assert_eq!(merged.origin_host, "hss.example.com");
        assert_eq!(merged.applications, vec![16777251]);
    }

    #[test]
    fn test_merge_no_common_application() {
        let local = caps("mme.example.com", &[16777251]);
        let remote = caps("hss.example.com", &[4]);

        let err = merge(&local, remote, None).unwrap_err();
        match err {
            AgentError::CapabilityMismatch { code, .. } => {
                assert_eq!(code, ResultCode::NoCommonApplication)
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_merge_rejects_identity_mismatch() {
        let local = caps("mme.example.com", &[16777251]);
        let remote = caps("rogue.example.com", &[16777251]);

        let err = merge(&local, remote, Some("hss.example.com")).unwrap_err();
        match err {
            AgentError::CapabilityMismatch { code, .. } => {
                assert_eq!(code, ResultCode::UnknownPeer)
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_merge_rejects_own_identity() {
        let local = caps("mme.example.com", &[16777251]);
        let remote = caps("mme.example.com", &[16777251]);
        assert!(merge(&local, remote, None).is_err());
    }

    #[test]
    fn test_merge_rejects_empty_identity() {
        let local = caps("mme.example.com", &[16777251]);
        let remote = caps("", &[16777251]);
        assert!(merge(&local, remote, None).is_err());
    }

    #[test]
    fn test_testdict_capabilities_roundtrip() {
        use crate::message::base_cmd;
        let dict = testdict::TestDictionary;
        let original = caps("hss.example.com", &[16777251, 4]);

        let payload = dict.encode_capabilities(&original, Some(ResultCode::Success));
        let msg = Message::request(base_cmd::CAPABILITIES_EXCHANGE, 0, payload);

        let decoded = dict.decode_capabilities(&msg).unwrap();
        assert_eq!(decoded.origin_host, original.origin_host);
        assert_eq!(decoded.applications, original.applications);
        assert_eq!(dict.result_code(&msg), Some(2001));
    }
}
