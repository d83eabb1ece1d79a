//! Session-management datagrams.
//!
//! Connect and disconnect handshakes travel out-of-band over the Nexus's
//! UDP socket, never the datapath transport. Datagrams are fixed-size,
//! idempotent, and resent on a coarse timer, so the codec stays a plain
//! little-endian byte layout.

use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::transport::{RoutingInfo, MAX_ROUTING_INFO_SIZE};

/// Encoded datagram size.
pub const SM_PKT_SIZE: usize = 10 + MAX_ROUTING_INFO_SIZE;

const SM_MAGIC: u16 = 0xCE5A;

/// Session-management datagram kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
    Reject = 4,
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmPktType::ConnectReq),
            1 => Ok(SmPktType::ConnectResp),
            2 => Ok(SmPktType::DisconnectReq),
            3 => Ok(SmPktType::DisconnectResp),
            4 => Ok(SmPktType::Reject),
            _ => Err(Error::InvalidPacketType(value)),
        }
    }
}

/// Why a connect was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmReason {
    Ok = 0,
    TooManySessions = 1,
    UnknownRpcId = 2,
    /// The acceptor's transport could not resolve the initiator's
    /// routing info.
    ResolveFailed = 3,
}

impl From<u8> for SmReason {
    fn from(value: u8) -> Self {
        match value {
            1 => SmReason::TooManySessions,
            2 => SmReason::UnknownRpcId,
            3 => SmReason::ResolveFailed,
            _ => SmReason::Ok,
        }
    }
}

/// One session-management datagram.
///
/// `client_session_num` is always the connect-initiator's local session
/// number; `server_session_num` is meaningful once the acceptor has
/// allocated one. `routing_info` carries the sender's datapath routing
/// blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmPkt {
    pub kind: SmPktType,
    pub reason: SmReason,
    pub src_rpc_id: u8,
    pub dst_rpc_id: u8,
    pub client_session_num: u16,
    pub server_session_num: u16,
    pub routing_info: RoutingInfo,
}

impl SmPkt {
    pub fn encode(&self) -> [u8; SM_PKT_SIZE] {
        let mut out = [0u8; SM_PKT_SIZE];
        out[0..2].copy_from_slice(&SM_MAGIC.to_le_bytes());
        out[2] = self.kind as u8;
        out[3] = self.reason as u8;
        out[4] = self.src_rpc_id;
        out[5] = self.dst_rpc_id;
        out[6..8].copy_from_slice(&self.client_session_num.to_le_bytes());
        out[8..10].copy_from_slice(&self.server_session_num.to_le_bytes());
        out[10..].copy_from_slice(&self.routing_info.buf);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_PKT_SIZE {
            return Err(Error::BufferTooSmall {
                required: SM_PKT_SIZE,
                available: bytes.len(),
            });
        }
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != SM_MAGIC {
            return Err(Error::InvalidMagic {
                expected: (SM_MAGIC & 0xFF) as u8,
                got: (magic & 0xFF) as u8,
            });
        }
        let mut routing_info = RoutingInfo::default();
        routing_info.buf.copy_from_slice(&bytes[10..SM_PKT_SIZE]);
        Ok(Self {
            kind: SmPktType::try_from(bytes[2])?,
            reason: SmReason::from(bytes[3]),
            src_rpc_id: bytes[4],
            dst_rpc_id: bytes[5],
            client_session_num: u16::from_le_bytes([bytes[6], bytes[7]]),
            server_session_num: u16::from_le_bytes([bytes[8], bytes[9]]),
            routing_info,
        })
    }
}

/// An SM datagram together with where it came from, as routed by the
/// Nexus to the destination endpoint.
#[derive(Debug, Clone, Copy)]
pub struct SmEnvelope {
    pub pkt: SmPkt,
    pub from: SocketAddr,
}

/// Session lifecycle events reported to the application's SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    /// A session this endpoint initiated reached Connected.
    Connected,
    /// The peer rejected the connect.
    ConnectFailed(SmReason),
    /// A graceful disconnect completed.
    Disconnected,
    /// The session was reset; outstanding requests failed.
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sm_pkt_roundtrip() {
        let mut ri = RoutingInfo::default();
        ri.buf[0] = 0xAB;
        ri.buf[31] = 0xCD;

        let pkt = SmPkt {
            kind: SmPktType::ConnectReq,
            reason: SmReason::Ok,
            src_rpc_id: 3,
            dst_rpc_id: 7,
            client_session_num: 12,
            server_session_num: 0,
            routing_info: ri,
        };

        let bytes = pkt.encode();
        let back = SmPkt::decode(&bytes).unwrap();
        assert_eq!(pkt, back);
    }

    #[test]
    fn test_sm_pkt_bad_magic() {
        let pkt = SmPkt {
            kind: SmPktType::Reject,
            reason: SmReason::UnknownRpcId,
            src_rpc_id: 0,
            dst_rpc_id: 0,
            client_session_num: 0,
            server_session_num: 0,
            routing_info: RoutingInfo::default(),
        };
        let mut bytes = pkt.encode();
        bytes[0] ^= 0xFF;
        assert!(SmPkt::decode(&bytes).is_err());
    }

    #[test]
    fn test_sm_pkt_short() {
        assert!(SmPkt::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_all_kinds() {
        for kind in [
            SmPktType::ConnectReq,
            SmPktType::ConnectResp,
            SmPktType::DisconnectReq,
            SmPktType::DisconnectResp,
            SmPktType::Reject,
        ] {
            let pkt = SmPkt {
                kind,
                reason: SmReason::Ok,
                src_rpc_id: 1,
                dst_rpc_id: 2,
                client_session_num: 3,
                server_session_num: 4,
                routing_info: RoutingInfo::default(),
            };
            assert_eq!(SmPkt::decode(&pkt.encode()).unwrap().kind, kind);
        }
    }
}
