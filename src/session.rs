//! Sessions and session slots.
//!
//! A session is one endpoint pair: (local session number, remote session
//! number, remote routing info), plus a fixed array of slots for
//! concurrent requests and the session's credit pool. Request numbers
//! within a slot advance by the window size per request, so the owning
//! slot of any packet is `req_num % req_window` and generation wrap is
//! detectable by comparing request numbers.
//!
//! All state here is touched only by the owning endpoint's dispatch
//! thread.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::buffer::MsgBuffer;
use crate::cc::Timely;
use crate::config::RpcConfig;
use crate::rpc::Continuation;
use crate::transport::RoutingInfo;

/// Opaque handle to a session on one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub(crate) u16);

impl SessionHandle {
    #[inline]
    pub fn session_num(&self) -> u16 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent; resent on the SM timer until answered.
    ConnectInProgress,
    /// Normal traffic.
    Connected,
    /// Disconnect request sent; resent on the SM timer until answered.
    DisconnectInProgress,
    /// A fatal error is quiescing the session; no traffic.
    ResetInProgress,
    /// Terminal.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// A request queued behind a busy slot, started when one frees.
pub(crate) struct PendingReq {
    pub req_type: u8,
    pub req_msgbuf: MsgBuffer,
    pub resp_msgbuf: MsgBuffer,
    pub cont: Continuation,
    pub tag: u64,
}

/// Client-side per-slot accounting.
///
/// `num_tx`/`num_rx` count the unified transmit sequence of the exchange:
/// request packets first, then RFRs; receptions are credit returns and
/// response packets. At all times `num_rx <= num_tx <= num_rx + credits`.
#[derive(Default)]
pub(crate) struct ClientInfo {
    /// Request being transmitted. `Some` iff a request is outstanding.
    pub req_msgbuf: Option<MsgBuffer>,
    /// Application-provided response buffer under assembly.
    pub resp_msgbuf: Option<MsgBuffer>,
    pub cont: Option<Continuation>,
    pub tag: u64,
    pub req_type: u8,
    /// Packets physically handed to the transport.
    pub num_tx: usize,
    /// Packets accepted in order (credit returns + response packets).
    pub num_rx: usize,
    /// Scheduled packets still waiting in the timing wheel. Each holds a
    /// consumed credit.
    pub wheel_count: usize,
    /// TSC of the last `num_rx` advance.
    pub progress_tsc: u64,
    /// TSC at enqueue, for the completion RTT sample.
    pub enq_tsc: u64,
    /// Consecutive RTO retransmissions without progress.
    pub retries: u32,
    pub in_stallq: bool,
    /// Response packet count, learned from the first response packet.
    /// Zero until then.
    pub resp_num_pkts: u16,
}

/// Server-side per-slot state.
#[derive(Default)]
pub(crate) struct ServerInfo {
    /// Request under assembly.
    pub req_msgbuf: Option<MsgBuffer>,
    /// Response being served; kept for RFR retransmissions until the next
    /// request generation lands in this slot.
    pub resp_msgbuf: Option<MsgBuffer>,
    /// Next expected request packet index.
    pub expected_pkt: u16,
    pub req_num_pkts: u16,
    pub req_type: u8,
    /// The request is with a handler (inline or background); duplicate
    /// final packets are ignored until the response exists.
    pub in_handler: bool,
    /// Credits owed under the deferred credit-return policy.
    pub cr_owed: usize,
    pub cr_owed_since: u64,
}

/// One concurrent request slot.
pub(crate) struct SSlot {
    /// Request generation currently (or last) occupying the slot. Starts
    /// at the slot index; each new request adds `req_window`.
    pub cur_req_num: u64,
    pub ci: ClientInfo,
    pub si: ServerInfo,
}

impl SSlot {
    fn new(index: usize) -> Self {
        Self {
            cur_req_num: index as u64,
            ci: ClientInfo::default(),
            si: ServerInfo::default(),
        }
    }

    /// Client: is a request outstanding in this slot?
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.ci.req_msgbuf.is_some()
    }

    /// Drop all client request state, keeping the generation counter.
    pub fn reset_client(&mut self) {
        self.ci = ClientInfo::default();
    }

    pub fn reset_server(&mut self) {
        self.si = ServerInfo::default();
    }
}

pub(crate) struct Session {
    pub role: SessionRole,
    pub state: SessionState,
    pub local_session_num: u16,
    pub remote_session_num: u16,
    pub remote_routing_info: RoutingInfo,
    /// Peer's session-management address.
    pub remote_sm_addr: SocketAddr,
    pub remote_rpc_id: u8,
    /// Flow-control credits currently available.
    pub credits: usize,
    pub sslots: Vec<SSlot>,
    /// Requests waiting for a free slot, FIFO.
    pub backlog: VecDeque<PendingReq>,
    pub cc: Timely,
    /// TSC of the last SM request transmission, for SM retransmission.
    pub sm_req_tsc: u64,
}

impl Session {
    pub fn new(
        role: SessionRole,
        local_session_num: u16,
        remote_sm_addr: SocketAddr,
        remote_rpc_id: u8,
        config: &RpcConfig,
        freq_ghz: f64,
    ) -> Self {
        let state = match role {
            SessionRole::Client => SessionState::ConnectInProgress,
            // The server learns of the session from a ConnectReq it has
            // already accepted.
            SessionRole::Server => SessionState::Connected,
        };
        Self {
            role,
            state,
            local_session_num,
            remote_session_num: 0,
            remote_routing_info: RoutingInfo::default(),
            remote_sm_addr,
            remote_rpc_id,
            credits: config.session_credits,
            sslots: (0..config.req_window).map(SSlot::new).collect(),
            backlog: VecDeque::new(),
            cc: Timely::new(freq_ghz),
            sm_req_tsc: 0,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Slot owning `req_num`.
    #[inline]
    pub fn slot_of(&self, req_num: u64) -> usize {
        (req_num % self.sslots.len() as u64) as usize
    }

    /// A free slot for a new request, if any.
    pub fn free_sslot(&self) -> Option<usize> {
        self.sslots.iter().position(|s| !s.is_busy())
    }

    /// Credits consumed by in-flight and wheel-resident packets, summed
    /// over all slots.
    pub fn credits_in_flight(&self) -> usize {
        self.sslots
            .iter()
            .map(|s| (s.ci.num_tx - s.ci.num_rx) + s.ci.wheel_count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        Session::new(
            SessionRole::Client,
            3,
            "127.0.0.1:1".parse().unwrap(),
            0,
            &RpcConfig::default(),
            2.0,
        )
    }

    #[test]
    fn test_slot_assignment() {
        let sess = test_session();
        assert_eq!(sess.sslots.len(), 8);
        // First generation in slot i is i + req_window.
        for (i, slot) in sess.sslots.iter().enumerate() {
            assert_eq!(slot.cur_req_num, i as u64);
            assert_eq!(sess.slot_of(slot.cur_req_num + 8), i);
        }
    }

    #[test]
    fn test_free_slot_tracking() {
        use crate::buffer::HugeAlloc;
        use crate::transport::MemRegFns;

        let mut sess = test_session();
        assert_eq!(sess.free_sslot(), Some(0));

        let mut alloc = HugeAlloc::new(4096, MemRegFns::noop());
        sess.sslots[0].ci.req_msgbuf = Some(alloc.alloc_msg_buffer(64).unwrap());
        assert!(sess.sslots[0].is_busy());
        assert_eq!(sess.free_sslot(), Some(1));

        sess.sslots[0].reset_client();
        assert!(!sess.sslots[0].is_busy());
        assert_eq!(sess.free_sslot(), Some(0));
    }

    #[test]
    fn test_credit_accounting_starts_full() {
        let sess = test_session();
        assert_eq!(sess.credits, 8);
        assert_eq!(sess.credits_in_flight(), 0);
    }

    #[test]
    fn test_new_client_state() {
        let sess = test_session();
        assert_eq!(sess.state, SessionState::ConnectInProgress);
        assert!(!sess.is_connected());
        assert!(sess.is_client());
    }
}
