//! The per-endpoint RPC engine.
//!
//! One [`Rpc`] multiplexes many concurrent request/response exchanges
//! over a single transport queue pair from a single dispatch thread. Each
//! [`run_event_loop_once`] iteration runs to completion: RX demux, wheel
//! drain, stall-queue drain, TX batching, background reply intake, the
//! periodic packet-loss scan, and session-management processing. No locks
//! anywhere on the datapath; the only cross-thread edges are the
//! background worker queues.
//!
//! [`run_event_loop_once`]: Rpc::run_event_loop_once

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use tracing::{debug, info, trace, warn};

use crate::bg::BgWorkerPool;
use crate::buffer::{HugeAlloc, MsgBuffer};
use crate::config::{CrPolicy, RpcConfig};
use crate::error::{Error, Result};
use crate::nexus::{HandlerKind, Nexus};
use crate::packet::{data_size_to_num_pkts, PktHdr, PktType, PKT_HDR_SIZE};
use crate::session::{
    PendingReq, SSlot, Session, SessionHandle, SessionRole, SessionState,
};
use crate::sm::{SmEnvelope, SmEvent, SmPkt, SmPktType, SmReason};
use crate::timing::{cycles_to_us, ms_to_cycles, rdtsc, us_to_cycles};
use crate::transport::{RoutingInfo, Transport, TxBurstItem};
use crate::wheel::{TimingWheel, WheelEnt};

/// How a completed call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespStatus {
    /// The response buffer holds the peer's reply.
    Ok,
    /// The session died before a reply arrived; the response buffer is
    /// untouched.
    SessionReset,
}

/// Delivered to the continuation exactly once per enqueued request,
/// returning ownership of both buffers to the application.
pub struct CallResult {
    pub status: RespStatus,
    pub req_msgbuf: MsgBuffer,
    pub resp_msgbuf: MsgBuffer,
    pub tag: u64,
}

/// Response continuation; runs on the dispatch thread.
pub type Continuation = Box<dyn FnOnce(CallResult)>;

/// Session lifecycle callback.
pub type SmHandler = Box<dyn FnMut(SessionHandle, SmEvent)>;

/// An SM handler that ignores every event.
pub fn noop_sm_handler() -> SmHandler {
    Box::new(|_, _| {})
}

/// A received request, handed to the registered handler.
///
/// The handler reads the request via [`req_data`], writes its reply into
/// the pre-allocated response buffer ([`respond`] for the copy path, or
/// [`resp_data_mut`] + [`set_resp_size`] for in-place construction), and
/// returns. Background handlers receive the handle by move on a worker
/// thread; only the dispatch thread ever turns it into wire traffic.
///
/// [`req_data`]: ReqHandle::req_data
/// [`respond`]: ReqHandle::respond
/// [`resp_data_mut`]: ReqHandle::resp_data_mut
/// [`set_resp_size`]: ReqHandle::set_resp_size
pub struct ReqHandle {
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
    req_msgbuf: MsgBuffer,
    resp_msgbuf: MsgBuffer,
    responded: bool,
}

impl ReqHandle {
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// The assembled request payload.
    #[inline]
    pub fn req_data(&self) -> &[u8] {
        self.req_msgbuf.data()
    }

    /// Copy `data` in as the response.
    pub fn respond(&mut self, data: &[u8]) -> Result<()> {
        self.resp_msgbuf.copy_from(data)?;
        self.responded = true;
        Ok(())
    }

    /// Writable response region at the buffer's current size; combine
    /// with [`ReqHandle::set_resp_size`].
    #[inline]
    pub fn resp_data_mut(&mut self) -> &mut [u8] {
        self.resp_msgbuf.data_mut()
    }

    /// Declare the response length after in-place construction.
    pub fn set_resp_size(&mut self, size: usize) -> Result<()> {
        self.resp_msgbuf.resize(size)?;
        self.responded = true;
        Ok(())
    }
}

/// Datapath and session-management counters, monotonically increasing
/// over the endpoint's lifetime.
#[derive(Debug, Default, Clone)]
pub struct RpcStats {
    /// Requests completed with a response.
    pub requests_completed: u64,
    /// RTO-driven rollback events.
    pub retransmissions: u64,
    /// RTO expiries that turned out benign (`num_tx == num_rx`).
    pub rto_false_positives: u64,
    /// In-window packets dropped by the in-order filter (reordered,
    /// duplicate, or stale generation).
    pub reorder_drops: u64,
    /// Malformed or misaddressed packets dropped.
    pub protocol_violations: u64,
    /// Explicit credit returns transmitted.
    pub explicit_crs_sent: u64,
    /// Session-management datagram retransmissions.
    pub sm_retransmits: u64,
    /// Sessions torn down by reset.
    pub sessions_reset: u64,
    /// Times the wheel overflow list hit its warn cap.
    pub wheel_overflows: u64,
}

/// Outcome of accepting one client-side RX packet, decided while the
/// session is borrowed and acted on after.
enum RxVerdict {
    Kick,
    Complete {
        req_msgbuf: MsgBuffer,
        resp_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
        rtt_us: u64,
    },
}

/// A per-endpoint RPC engine, monomorphized over its transport.
pub struct Rpc<T: Transport> {
    nexus: Arc<Nexus>,
    rpc_id: u8,
    transport: T,
    alloc: HugeAlloc,
    config: RpcConfig,
    sessions: Vec<Option<Session>>,
    sm_queue: Arc<ArrayQueue<SmEnvelope>>,
    sm_handler: SmHandler,
    wheel: TimingWheel,
    wheel_scratch: Vec<WheelEnt>,
    tx_batch: Vec<TxBurstItem>,
    /// FIFO of (session, slot) pairs stalled on credits.
    stallq: VecDeque<(u16, usize)>,
    bg_pool: Option<BgWorkerPool>,
    /// Connect idempotency: (peer SM address, peer rpc id, peer session
    /// num) -> local server session num.
    srv_dedup: HashMap<(SocketAddr, u8, u16), u16>,
    local_routing_info: RoutingInfo,
    freq_ghz: f64,
    rto_cycles: u64,
    sm_timeout_cycles: u64,
    cr_defer_cycles: u64,
    /// Epoch for all timers in the current iteration.
    ev_loop_tsc: u64,
    ev_loop_iter: u64,
    /// Consumed RX ring entries not yet recycled.
    rx_held: usize,
    stats: RpcStats,
}

impl<T: Transport> Rpc<T> {
    pub fn new(
        nexus: Arc<Nexus>,
        rpc_id: u8,
        transport: T,
        config: RpcConfig,
        sm_handler: SmHandler,
    ) -> Result<Self> {
        let sm_queue = nexus.register_hook(rpc_id)?;
        let freq_ghz = nexus.freq_ghz();

        let alloc = HugeAlloc::new(transport.mtu(), transport.reg_fns());
        let mut local_routing_info = RoutingInfo::default();
        transport.fill_local_routing_info(&mut local_routing_info);

        let now = rdtsc();
        let width_cycles = us_to_cycles(config.wheel_bucket_us, freq_ghz).max(2);
        let width_bits = width_cycles.next_power_of_two().trailing_zeros();
        let mut wheel = TimingWheel::new(config.wheel_num_buckets, width_bits, now);
        wheel.set_overflow_warn(config.wheel_overflow_warn);

        let bg_pool = (config.num_bg_threads > 0)
            .then(|| BgWorkerPool::start(nexus.clone(), config.num_bg_threads));

        let rto_cycles = us_to_cycles(config.rto_us, freq_ghz);
        let sm_timeout_cycles = ms_to_cycles(config.sm_timeout_ms, freq_ghz);
        let cr_defer_cycles = us_to_cycles(config.cr_defer_us, freq_ghz);

        info!(rpc_id, mtu = transport.mtu(), "rpc endpoint up");

        Ok(Self {
            nexus,
            rpc_id,
            transport,
            alloc,
            sessions: Vec::new(),
            sm_queue,
            sm_handler,
            wheel,
            wheel_scratch: Vec::new(),
            tx_batch: Vec::with_capacity(config.tx_batch_size),
            stallq: VecDeque::new(),
            bg_pool,
            srv_dedup: HashMap::new(),
            local_routing_info,
            freq_ghz,
            rto_cycles,
            sm_timeout_cycles,
            cr_defer_cycles,
            ev_loop_tsc: now,
            ev_loop_iter: 0,
            rx_held: 0,
            stats: RpcStats::default(),
            config,
        })
    }

    #[inline]
    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    #[inline]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Counters snapshot.
    pub fn stats(&self) -> RpcStats {
        let mut stats = self.stats.clone();
        stats.wheel_overflows = self.wheel.overflow_events;
        stats
    }

    pub fn session_state(&self, handle: SessionHandle) -> Option<SessionState> {
        self.session(handle.0).map(|s| s.state)
    }

    /// Credits currently available on the session.
    pub fn available_credits(&self, handle: SessionHandle) -> Option<usize> {
        self.session(handle.0).map(|s| s.credits)
    }

    /// Credits held by in-flight and wheel-resident packets.
    pub fn credits_in_flight(&self, handle: SessionHandle) -> Option<usize> {
        self.session(handle.0).map(|s| s.credits_in_flight())
    }

    pub fn num_active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Allocate a registered message buffer for up to `max_data_size`
    /// payload bytes.
    pub fn alloc_msg_buffer(&mut self, max_data_size: usize) -> Result<MsgBuffer> {
        if max_data_size > self.config.max_msg_size {
            return Err(Error::MsgTooLarge {
                size: max_data_size,
                max: self.config.max_msg_size,
            });
        }
        self.alloc.alloc_msg_buffer(max_data_size)
    }

    /// Return a buffer to the allocator.
    pub fn free_msg_buffer(&mut self, buf: MsgBuffer) {
        drop(buf);
    }

    // ------------------------------------------------------------------
    // Session management
    // ------------------------------------------------------------------

    fn session(&self, sess_num: u16) -> Option<&Session> {
        self.sessions.get(sess_num as usize).and_then(|s| s.as_ref())
    }

    fn alloc_session_slot(&mut self) -> Result<u16> {
        if let Some(idx) = self.sessions.iter().position(|s| s.is_none()) {
            return Ok(idx as u16);
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(Error::TooManySessions);
        }
        self.sessions.push(None);
        Ok((self.sessions.len() - 1) as u16)
    }

    /// Open a session to `(sm_uri, remote_rpc_id)`. Returns immediately;
    /// the SM handler reports `Connected` (or `ConnectFailed`) once the
    /// handshake completes.
    pub fn create_session(&mut self, sm_uri: &str, remote_rpc_id: u8) -> Result<SessionHandle> {
        let remote_sm_addr = self.nexus.resolve_sm_addr(sm_uri)?;
        let sess_num = self.alloc_session_slot()?;

        let sess = Session::new(
            SessionRole::Client,
            sess_num,
            remote_sm_addr,
            remote_rpc_id,
            &self.config,
            self.freq_ghz,
        );
        self.sessions[sess_num as usize] = Some(sess);
        self.send_sm_req(sess_num);

        debug!(sess_num, %remote_sm_addr, remote_rpc_id, "session connect started");
        Ok(SessionHandle(sess_num))
    }

    /// Begin a graceful disconnect. Outstanding requests fail with
    /// `SessionReset` once the handshake completes.
    pub fn destroy_session(&mut self, handle: SessionHandle) -> Result<()> {
        let sess = self
            .sessions
            .get_mut(handle.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::SessionNotFound(handle.0))?;
        if !sess.is_client() || sess.state != SessionState::Connected {
            return Err(Error::SessionNotConnected(handle.0));
        }
        sess.state = SessionState::DisconnectInProgress;
        self.send_sm_req(handle.0);
        Ok(())
    }

    /// (Re)send the SM request matching the session's in-progress state.
    fn send_sm_req(&mut self, sess_num: u16) {
        let Some(sess) = self.sessions[sess_num as usize].as_mut() else {
            return;
        };
        let kind = match sess.state {
            SessionState::ConnectInProgress => SmPktType::ConnectReq,
            SessionState::DisconnectInProgress => SmPktType::DisconnectReq,
            _ => return,
        };
        let pkt = SmPkt {
            kind,
            reason: SmReason::Ok,
            src_rpc_id: self.rpc_id,
            dst_rpc_id: sess.remote_rpc_id,
            client_session_num: sess.local_session_num,
            server_session_num: sess.remote_session_num,
            routing_info: self.local_routing_info,
        };
        sess.sm_req_tsc = rdtsc();
        let dst = sess.remote_sm_addr;
        if let Err(e) = self.nexus.sm_send(dst, &pkt) {
            warn!(sess_num, error = %e, "sm send failed");
        }
    }

    // ------------------------------------------------------------------
    // Request enqueue and the client TX path
    // ------------------------------------------------------------------

    /// Enqueue a request on a connected session.
    ///
    /// Takes ownership of both buffers; the continuation returns them
    /// exactly once, with the response assembled into `resp_msgbuf` on
    /// success. If every slot of the session is busy the request waits in
    /// a FIFO backlog.
    pub fn enqueue_request(
        &mut self,
        handle: SessionHandle,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        resp_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> Result<()> {
        let sess = self
            .sessions
            .get_mut(handle.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::SessionNotFound(handle.0))?;
        if !sess.is_client() || !sess.is_connected() {
            return Err(Error::SessionNotConnected(handle.0));
        }

        let pending = PendingReq {
            req_type,
            req_msgbuf,
            resp_msgbuf,
            cont,
            tag,
        };

        match sess.free_sslot() {
            Some(slot_idx) => {
                self.start_request(handle.0, slot_idx, pending);
            }
            None => {
                sess.backlog.push_back(pending);
            }
        }
        Ok(())
    }

    /// Install a request into a free slot and kick its first window.
    fn start_request(&mut self, sess_num: u16, slot_idx: usize, pending: PendingReq) {
        let now = self.ev_loop_tsc;
        {
            let sess = self.sessions[sess_num as usize].as_mut().unwrap();
            let req_window = sess.sslots.len() as u64;
            let remote_session_num = sess.remote_session_num;
            let slot = &mut sess.sslots[slot_idx];
            debug_assert!(!slot.is_busy());

            slot.cur_req_num += req_window;
            let req_num = slot.cur_req_num;

            let mut req_msgbuf = pending.req_msgbuf;
            let msg_size = req_msgbuf.data_size();
            for i in 0..req_msgbuf.num_pkts() {
                let hdr = PktHdr::new(
                    pending.req_type,
                    msg_size,
                    remote_session_num,
                    PktType::Req,
                    i,
                    req_num,
                );
                req_msgbuf.set_pkt_hdr(i, &hdr);
            }

            slot.ci = crate::session::ClientInfo {
                req_msgbuf: Some(req_msgbuf),
                resp_msgbuf: Some(pending.resp_msgbuf),
                cont: Some(pending.cont),
                tag: pending.tag,
                req_type: pending.req_type,
                num_tx: 0,
                num_rx: 0,
                wheel_count: 0,
                progress_tsc: now,
                enq_tsc: now,
                retries: 0,
                in_stallq: false,
                resp_num_pkts: 0,
            };
        }
        self.kick_client(sess_num, slot_idx);
    }

    /// Total client transmissions for the slot's exchange: request
    /// packets, then one RFR per response packet past the first. Until
    /// the first response packet arrives only the request phase counts.
    fn client_total_tx(slot: &SSlot) -> usize {
        let nreq = slot.ci.req_msgbuf.as_ref().map_or(0, |m| m.num_pkts()) as usize;
        if slot.ci.resp_num_pkts == 0 {
            nreq
        } else {
            nreq + slot.ci.resp_num_pkts as usize - 1
        }
    }

    /// Schedule as many pending packets as credits allow: into the wheel
    /// when pacing, straight to the TX batch otherwise. Stalls FIFO when
    /// credits run out.
    fn kick_client(&mut self, sess_num: u16, slot_idx: usize) {
        loop {
            // Decide under the session borrow; emit after it ends.
            let mut item: Option<TxBurstItem> = None;
            let mut stall = false;
            {
                let Some(sess) = self.sessions[sess_num as usize].as_mut() else {
                    return;
                };
                if !sess.is_connected() {
                    return;
                }
                let slot = &sess.sslots[slot_idx];
                if !slot.is_busy() {
                    return;
                }
                let total = Self::client_total_tx(slot);
                let sched = slot.ci.num_tx + slot.ci.wheel_count;
                if sched >= total {
                    return;
                }
                if sess.credits == 0 {
                    if !slot.ci.in_stallq {
                        sess.sslots[slot_idx].ci.in_stallq = true;
                        stall = true;
                    } else {
                        return;
                    }
                } else {
                    sess.credits -= 1;
                    let t = sched as u16;
                    if self.config.enable_cc {
                        // Client wheel entries are transmission tokens:
                        // the packet index is assigned from `num_tx` at
                        // drain time, so tokens left over across a
                        // rollback still transmit the right packets.
                        let bytes = {
                            let slot = &sess.sslots[slot_idx];
                            let req_mb = slot.ci.req_msgbuf.as_ref().unwrap();
                            if t < req_mb.num_pkts() {
                                PKT_HDR_SIZE + req_mb.pkt_data_bytes(t)
                            } else {
                                PKT_HDR_SIZE
                            }
                        };
                        let abs_tx_tsc = sess.cc.pace(self.ev_loop_tsc, bytes);
                        let req_num = sess.sslots[slot_idx].cur_req_num;
                        self.wheel.insert(WheelEnt {
                            sess_num,
                            sslot_idx: slot_idx as u8,
                            req_num,
                            pkt_num: 0,
                            abs_tx_tsc,
                        });
                        sess.sslots[slot_idx].ci.wheel_count += 1;
                    } else {
                        let slot = &mut sess.sslots[slot_idx];
                        slot.ci.num_tx += 1;
                        item = Some(build_client_item(
                            sess.remote_routing_info,
                            sess.remote_session_num,
                            &sess.sslots[slot_idx],
                            t,
                        ));
                    }
                }
            }
            if stall {
                self.stallq.push_back((sess_num, slot_idx));
                return;
            }
            if let Some(item) = item {
                self.push_tx(item);
            }
        }
    }

    // ------------------------------------------------------------------
    // TX batch
    // ------------------------------------------------------------------

    fn push_tx(&mut self, item: TxBurstItem) {
        self.tx_batch.push(item);
        if self.tx_batch.len() >= self.config.tx_batch_size {
            self.do_tx_burst();
        }
    }

    fn do_tx_burst(&mut self) {
        if !self.tx_batch.is_empty() {
            self.transport.tx_burst(&self.tx_batch);
            self.tx_batch.clear();
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run one event-loop iteration to completion.
    pub fn run_event_loop_once(&mut self) {
        self.ev_loop_tsc = rdtsc();

        self.process_rx();
        self.process_wheel();
        self.process_stallq();
        if self.config.cr_policy == CrPolicy::Deferred {
            self.process_cr_timers();
        }
        self.do_tx_burst();
        self.process_bg_replies();
        if self.ev_loop_iter % self.config.rto_scan_cycles == 0 {
            self.pkt_loss_scan();
        }
        self.process_sm();

        self.ev_loop_iter += 1;
    }

    /// Poll for `ms` milliseconds of wall-clock time.
    pub fn run_event_loop(&mut self, ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            self.run_event_loop_once();
        }
    }

    // ------------------------------------------------------------------
    // RX path
    // ------------------------------------------------------------------

    fn process_rx(&mut self) {
        let n_new = self.transport.rx_burst();
        for i in 0..n_new {
            let idx = self.rx_held + i;
            // Copy the header out and keep a raw payload pointer; ring
            // entries stay untouched until post_recvs below.
            let parsed = {
                let pkt = self.transport.rx_pkt(idx);
                match PktHdr::from_bytes(pkt) {
                    Ok(hdr) => {
                        let payload = unsafe { pkt.as_ptr().add(PKT_HDR_SIZE) };
                        Some((hdr, payload, pkt.len() - PKT_HDR_SIZE))
                    }
                    Err(_) => None,
                }
            };
            let Some((hdr, payload, payload_len)) = parsed else {
                self.stats.protocol_violations += 1;
                continue;
            };

            match hdr.pkt_type() {
                PktType::Req => self.process_req_pkt(&hdr, payload, payload_len),
                PktType::Rfr => self.process_rfr(&hdr),
                PktType::Resp => self.process_resp_pkt(&hdr, payload, payload_len),
                PktType::ExplicitCr => self.process_cr(&hdr),
            }
        }
        self.rx_held += n_new;
        if self.rx_held >= self.config.recv_slack {
            self.transport.post_recvs(self.rx_held);
            self.rx_held = 0;
        }
    }

    /// Client side: a response data packet.
    fn process_resp_pkt(&mut self, hdr: &PktHdr, payload: *const u8, payload_len: usize) {
        let sess_num = hdr.dest_session_num();
        let mtu = self.transport.mtu();
        let now = self.ev_loop_tsc;
        let slot_idx;

        let verdict = {
            let Some(sess) = self
                .sessions
                .get_mut(sess_num as usize)
                .and_then(|s| s.as_mut())
            else {
                self.stats.protocol_violations += 1;
                return;
            };
            if !sess.is_client() || !sess.is_connected() {
                self.stats.reorder_drops += 1;
                return;
            }
            slot_idx = sess.slot_of(hdr.req_num());
            let slot = &mut sess.sslots[slot_idx];
            if slot.cur_req_num != hdr.req_num() || !slot.is_busy() {
                self.stats.reorder_drops += 1;
                return;
            }

            let nreq = slot.ci.req_msgbuf.as_ref().unwrap().num_pkts() as usize;
            let j = hdr.pkt_num() as usize;

            let accepted = if j == 0 {
                if slot.ci.num_rx >= nreq {
                    false // duplicate first response packet
                } else {
                    let msg_size = hdr.msg_size();
                    let resp_mb = slot.ci.resp_msgbuf.as_mut().unwrap();
                    if msg_size > resp_mb.max_data_size() {
                        warn!(
                            sess_num,
                            msg_size,
                            capacity = resp_mb.max_data_size(),
                            "response exceeds application buffer"
                        );
                        self.stats.protocol_violations += 1;
                        return;
                    }
                    // resize() cannot fail: checked against capacity.
                    resp_mb.resize(msg_size).unwrap();
                    copy_payload_into(resp_mb, 0, payload, payload_len);
                    // Credit jump: elided credit returns ride on the
                    // first response packet.
                    let returned = nreq - slot.ci.num_rx;
                    sess.credits += returned;
                    let slot = &mut sess.sslots[slot_idx];
                    slot.ci.num_rx = nreq;
                    slot.ci.resp_num_pkts = data_size_to_num_pkts(msg_size, mtu);
                    true
                }
            } else {
                let started = slot.ci.num_rx >= nreq;
                let expected = started && j == slot.ci.num_rx - nreq + 1;
                if expected && (j as u16) < slot.ci.resp_num_pkts {
                    let resp_mb = slot.ci.resp_msgbuf.as_mut().unwrap();
                    copy_payload_into(resp_mb, j as u16, payload, payload_len);
                    slot.ci.num_rx += 1;
                    sess.credits += 1;
                    true
                } else {
                    false
                }
            };

            if !accepted {
                self.stats.reorder_drops += 1;
                return;
            }

            let slot = &mut sess.sslots[slot_idx];
            slot.ci.progress_tsc = now;
            slot.ci.retries = 0;

            let total_rx = nreq + slot.ci.resp_num_pkts as usize - 1;
            if slot.ci.num_rx == total_rx {
                let rtt_us = cycles_to_us(now.wrapping_sub(slot.ci.enq_tsc), self.freq_ghz);
                RxVerdict::Complete {
                    req_msgbuf: slot.ci.req_msgbuf.take().unwrap(),
                    resp_msgbuf: slot.ci.resp_msgbuf.take().unwrap(),
                    cont: slot.ci.cont.take().unwrap(),
                    tag: slot.ci.tag,
                    rtt_us,
                }
            } else {
                RxVerdict::Kick
            }
        };

        self.finish_rx_verdict(sess_num, slot_idx, verdict);
    }

    /// Client side: an explicit credit return.
    fn process_cr(&mut self, hdr: &PktHdr) {
        let sess_num = hdr.dest_session_num();
        let now = self.ev_loop_tsc;
        let slot_idx;

        let accepted = {
            let Some(sess) = self
                .sessions
                .get_mut(sess_num as usize)
                .and_then(|s| s.as_mut())
            else {
                self.stats.protocol_violations += 1;
                return;
            };
            if !sess.is_client() || !sess.is_connected() {
                self.stats.reorder_drops += 1;
                return;
            }
            slot_idx = sess.slot_of(hdr.req_num());
            let slot = &mut sess.sslots[slot_idx];
            if slot.cur_req_num != hdr.req_num() || !slot.is_busy() {
                self.stats.reorder_drops += 1;
                return;
            }

            let nreq = slot.ci.req_msgbuf.as_ref().unwrap().num_pkts() as usize;
            let p = hdr.pkt_num() as usize;
            if slot.ci.num_rx + 1 < nreq && p == slot.ci.num_rx {
                slot.ci.num_rx += 1;
                slot.ci.progress_tsc = now;
                slot.ci.retries = 0;
                sess.credits += 1;
                true
            } else {
                false
            }
        };

        if accepted {
            self.kick_client(sess_num, slot_idx);
        } else {
            self.stats.reorder_drops += 1;
        }
    }

    fn finish_rx_verdict(&mut self, sess_num: u16, slot_idx: usize, verdict: RxVerdict) {
        match verdict {
            RxVerdict::Kick => self.kick_client(sess_num, slot_idx),
            RxVerdict::Complete {
                req_msgbuf,
                resp_msgbuf,
                cont,
                tag,
                rtt_us,
            } => {
                self.stats.requests_completed += 1;
                // TX items may still reference the completed buffers.
                self.do_tx_burst();
                {
                    let sess = self.sessions[sess_num as usize].as_mut().unwrap();
                    if self.config.enable_cc {
                        sess.cc.update(rtt_us);
                    }
                    sess.sslots[slot_idx].reset_client();
                }
                // A freed slot unblocks the backlog before the
                // continuation runs, keeping FIFO start order.
                let next = {
                    let sess = self.sessions[sess_num as usize].as_mut().unwrap();
                    sess.backlog.pop_front()
                };
                if let Some(pending) = next {
                    self.start_request(sess_num, slot_idx, pending);
                }
                cont(CallResult {
                    status: RespStatus::Ok,
                    req_msgbuf,
                    resp_msgbuf,
                    tag,
                });
            }
        }
    }

    /// Server side: a request data packet.
    fn process_req_pkt(&mut self, hdr: &PktHdr, payload: *const u8, payload_len: usize) {
        let sess_num = hdr.dest_session_num();
        let mtu = self.transport.mtu();

        enum SrvAction {
            None,
            SendCr(u16),
            ResendResp0,
            Dispatch,
        }

        let slot_idx;
        let action = {
            let Some(sess) = self
                .sessions
                .get_mut(sess_num as usize)
                .and_then(|s| s.as_mut())
            else {
                self.stats.protocol_violations += 1;
                return;
            };
            if sess.is_client() || !sess.is_connected() {
                self.stats.protocol_violations += 1;
                return;
            }
            slot_idx = sess.slot_of(hdr.req_num());
            let slot = &mut sess.sslots[slot_idx];
            let n = hdr.req_num();

            if n < slot.cur_req_num {
                // Out-of-window request number: a past generation.
                trace!(sess_num, req_num = n, "stale request generation dropped");
                self.stats.reorder_drops += 1;
                return;
            }

            if n > slot.cur_req_num {
                // New generation: the client received the previous
                // response, so its buffers can go. TX items from this
                // iteration may still point into the old response.
                if slot.si.resp_msgbuf.is_some() {
                    self.do_tx_burst();
                }
                let sess = self.sessions[sess_num as usize].as_mut().unwrap();
                let slot = &mut sess.sslots[slot_idx];
                slot.cur_req_num = n;
                slot.reset_server();
            }

            let sess = self.sessions[sess_num as usize].as_mut().unwrap();
            let slot = &mut sess.sslots[slot_idx];
            let pkt_num = hdr.pkt_num();

            if pkt_num < slot.si.expected_pkt {
                // Duplicate of an accepted packet: the original credit
                // return or first response packet was lost.
                let is_final = slot.si.req_num_pkts > 0 && pkt_num == slot.si.req_num_pkts - 1;
                if is_final {
                    if slot.si.resp_msgbuf.is_some() {
                        SrvAction::ResendResp0
                    } else {
                        // Handler still running; the response will go out
                        // when it finishes.
                        SrvAction::None
                    }
                } else {
                    SrvAction::SendCr(pkt_num)
                }
            } else if pkt_num > slot.si.expected_pkt {
                self.stats.reorder_drops += 1;
                return;
            } else {
                // In-order request packet.
                if slot.si.in_handler || slot.si.resp_msgbuf.is_some() {
                    self.stats.reorder_drops += 1;
                    return;
                }
                if slot.si.expected_pkt == 0 {
                    let msg_size = hdr.msg_size();
                    if msg_size > self.config.max_msg_size {
                        self.stats.protocol_violations += 1;
                        return;
                    }
                    let req_mb = match self.alloc.alloc_msg_buffer(msg_size) {
                        Ok(mb) => mb,
                        Err(e) => {
                            warn!(sess_num, error = %e, "request buffer allocation failed");
                            return;
                        }
                    };
                    let sess = self.sessions[sess_num as usize].as_mut().unwrap();
                    let slot = &mut sess.sslots[slot_idx];
                    slot.si.req_msgbuf = Some(req_mb);
                    slot.si.req_num_pkts = data_size_to_num_pkts(msg_size, mtu);
                    slot.si.req_type = hdr.req_type();
                }
                let sess = self.sessions[sess_num as usize].as_mut().unwrap();
                let slot = &mut sess.sslots[slot_idx];
                let req_mb = slot.si.req_msgbuf.as_mut().unwrap();
                copy_payload_into(req_mb, pkt_num, payload, payload_len);
                slot.si.expected_pkt += 1;

                if slot.si.expected_pkt < slot.si.req_num_pkts {
                    match self.config.cr_policy {
                        CrPolicy::Immediate => SrvAction::SendCr(pkt_num),
                        CrPolicy::Deferred => {
                            if slot.si.cr_owed == 0 {
                                slot.si.cr_owed_since = self.ev_loop_tsc;
                            }
                            slot.si.cr_owed += 1;
                            SrvAction::None
                        }
                    }
                } else {
                    // Owed credits ride on the first response packet.
                    slot.si.cr_owed = 0;
                    SrvAction::Dispatch
                }
            }
        };

        match action {
            SrvAction::None => {}
            SrvAction::SendCr(pkt_num) => self.send_explicit_cr(sess_num, slot_idx, pkt_num),
            SrvAction::ResendResp0 => self.tx_resp_pkt(sess_num, slot_idx, 0, false),
            SrvAction::Dispatch => self.dispatch_handler(sess_num, slot_idx),
        }
    }

    /// Server side: a request-for-response pulling one response packet.
    fn process_rfr(&mut self, hdr: &PktHdr) {
        let sess_num = hdr.dest_session_num();
        let serve = {
            let Some(sess) = self
                .sessions
                .get_mut(sess_num as usize)
                .and_then(|s| s.as_mut())
            else {
                self.stats.protocol_violations += 1;
                return;
            };
            if sess.is_client() || !sess.is_connected() {
                self.stats.protocol_violations += 1;
                return;
            }
            let slot_idx = sess.slot_of(hdr.req_num());
            let slot = &sess.sslots[slot_idx];
            let j = hdr.pkt_num();
            let ok = slot.cur_req_num == hdr.req_num()
                && j > 0
                && slot
                    .si
                    .resp_msgbuf
                    .as_ref()
                    .is_some_and(|mb| j < mb.num_pkts());
            ok.then_some((slot_idx, j))
        };
        match serve {
            Some((slot_idx, j)) => self.tx_resp_pkt(sess_num, slot_idx, j, self.config.enable_cc),
            None => self.stats.reorder_drops += 1,
        }
    }

    fn send_explicit_cr(&mut self, sess_num: u16, slot_idx: usize, pkt_num: u16) {
        let item = {
            let Some(sess) = self.session(sess_num) else { return };
            let slot = &sess.sslots[slot_idx];
            let hdr = PktHdr::new(
                slot.si.req_type,
                0,
                sess.remote_session_num,
                PktType::ExplicitCr,
                pkt_num,
                slot.cur_req_num,
            );
            TxBurstItem::ctrl(sess.remote_routing_info, hdr)
        };
        self.stats.explicit_crs_sent += 1;
        self.push_tx(item);
    }

    /// Transmit (or pace) one response packet.
    fn tx_resp_pkt(&mut self, sess_num: u16, slot_idx: usize, pkt_num: u16, paced: bool) {
        if paced {
            let ent = {
                let Some(sess) = self.sessions[sess_num as usize].as_mut() else {
                    return;
                };
                let bytes = {
                    let slot = &sess.sslots[slot_idx];
                    let Some(mb) = slot.si.resp_msgbuf.as_ref() else {
                        return;
                    };
                    PKT_HDR_SIZE + mb.pkt_data_bytes(pkt_num)
                };
                let abs_tx_tsc = sess.cc.pace(self.ev_loop_tsc, bytes);
                WheelEnt {
                    sess_num,
                    sslot_idx: slot_idx as u8,
                    req_num: sess.sslots[slot_idx].cur_req_num,
                    pkt_num,
                    abs_tx_tsc,
                }
            };
            self.wheel.insert(ent);
            return;
        }

        let item = {
            let Some(sess) = self.session(sess_num) else { return };
            let slot = &sess.sslots[slot_idx];
            let Some(mb) = slot.si.resp_msgbuf.as_ref() else {
                return;
            };
            TxBurstItem::new(
                sess.remote_routing_info,
                mb.pkt_hdr(pkt_num),
                mb.pkt_data_ptr(pkt_num),
                mb.pkt_data_bytes(pkt_num),
            )
        };
        self.push_tx(item);
    }

    // ------------------------------------------------------------------
    // Server handler dispatch & responses
    // ------------------------------------------------------------------

    /// The assembled request is ready: run its handler inline or hand it
    /// to the worker pool.
    fn dispatch_handler(&mut self, sess_num: u16, slot_idx: usize) {
        let (req_type, req_num) = {
            let sess = self.sessions[sess_num as usize].as_ref().unwrap();
            let slot = &sess.sslots[slot_idx];
            (slot.si.req_type, slot.cur_req_num)
        };

        let Some(entry) = self.nexus.handler(req_type).cloned() else {
            warn!(req_type, "request for unregistered handler dropped");
            self.stats.protocol_violations += 1;
            let sess = self.sessions[sess_num as usize].as_mut().unwrap();
            sess.sslots[slot_idx].reset_server();
            return;
        };

        let resp_msgbuf = match self.alloc.alloc_msg_buffer(entry.max_resp_size) {
            Ok(mb) => mb,
            Err(e) => {
                warn!(sess_num, error = %e, "response buffer allocation failed");
                let sess = self.sessions[sess_num as usize].as_mut().unwrap();
                sess.sslots[slot_idx].reset_server();
                return;
            }
        };

        let req_msgbuf = {
            let sess = self.sessions[sess_num as usize].as_mut().unwrap();
            let slot = &mut sess.sslots[slot_idx];
            slot.si.in_handler = true;
            slot.si.req_msgbuf.take().unwrap()
        };

        let mut handle = ReqHandle {
            session_num: sess_num,
            sslot_idx: slot_idx,
            req_num,
            req_type,
            req_msgbuf,
            resp_msgbuf,
            responded: false,
        };

        let run_inline = entry.kind == HandlerKind::Foreground || self.bg_pool.is_none();
        if run_inline {
            (entry.handler)(&mut handle);
            self.enqueue_response(handle);
        } else {
            let queues = self.bg_pool.as_ref().unwrap().queues().clone();
            if let Err(handle) = queues.req_q.push(handle) {
                // Worker queue saturated; degrade to inline execution
                // rather than dropping the request.
                let mut handle = handle;
                (entry.handler)(&mut handle);
                self.enqueue_response(handle);
            }
        }
    }

    /// Put a handler's finished response on the wire (first packet now,
    /// the rest pulled by RFRs).
    pub fn enqueue_response(&mut self, handle: ReqHandle) {
        let ReqHandle {
            session_num,
            sslot_idx,
            req_num,
            req_type,
            req_msgbuf,
            mut resp_msgbuf,
            responded,
        } = handle;

        let ok = {
            match self
                .sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                // The session may have disconnected, or the slot may have
                // moved to a newer generation, while a worker held the
                // request. The response is moot either way.
                None => false,
                Some(sess) => {
                    let slot = &mut sess.sslots[sslot_idx];
                    if slot.cur_req_num != req_num {
                        false
                    } else {
                        slot.si.in_handler = false;
                        responded
                    }
                }
            }
        };
        drop(req_msgbuf);
        if !ok {
            debug!(session_num, req_num, "response dropped (stale or unanswered)");
            return;
        }

        {
            let sess = self.sessions[session_num as usize].as_mut().unwrap();
            let msg_size = resp_msgbuf.data_size();
            for i in 0..resp_msgbuf.num_pkts() {
                let hdr = PktHdr::new(
                    req_type,
                    msg_size,
                    sess.remote_session_num,
                    PktType::Resp,
                    i,
                    req_num,
                );
                resp_msgbuf.set_pkt_hdr(i, &hdr);
            }
            sess.sslots[sslot_idx].si.resp_msgbuf = Some(resp_msgbuf);
        }
        self.tx_resp_pkt(session_num, sslot_idx, 0, self.config.enable_cc);
    }

    /// Absorb responses completed by background workers.
    fn process_bg_replies(&mut self) {
        let Some(pool) = self.bg_pool.as_ref() else {
            return;
        };
        let queues = pool.queues().clone();
        while let Some(handle) = queues.resp_q.pop() {
            self.enqueue_response(handle);
        }
    }

    // ------------------------------------------------------------------
    // Wheel & stall queue
    // ------------------------------------------------------------------

    fn process_wheel(&mut self) {
        let mut due = std::mem::take(&mut self.wheel_scratch);
        due.clear();
        self.wheel.reap(self.ev_loop_tsc, &mut due);

        for ent in due.drain(..) {
            let item = {
                let Some(sess) = self
                    .sessions
                    .get_mut(ent.sess_num as usize)
                    .and_then(|s| s.as_mut())
                else {
                    continue; // session gone; its credits went with it
                };
                let slot_idx = ent.sslot_idx as usize;
                if sess.is_client() {
                    let valid = sess.is_connected()
                        && sess.sslots[slot_idx].cur_req_num == ent.req_num
                        && sess.sslots[slot_idx].is_busy();
                    if !valid {
                        // A stale token from a completed or rolled-over
                        // request; its credit comes home.
                        sess.credits += 1;
                        continue;
                    }
                    // The token transmits the next untransmitted packet.
                    let t = {
                        let slot = &mut sess.sslots[slot_idx];
                        slot.ci.wheel_count -= 1;
                        let t = slot.ci.num_tx as u16;
                        if slot.ci.num_tx >= Self::client_total_tx(slot) {
                            // Over-scheduled token (duplicate coverage);
                            // nothing left to send.
                            sess.credits += 1;
                            continue;
                        }
                        slot.ci.num_tx += 1;
                        t
                    };
                    Some(build_client_item(
                        sess.remote_routing_info,
                        sess.remote_session_num,
                        &sess.sslots[slot_idx],
                        t,
                    ))
                } else {
                    let slot = &sess.sslots[slot_idx];
                    let valid = sess.is_connected()
                        && slot.cur_req_num == ent.req_num
                        && slot
                            .si
                            .resp_msgbuf
                            .as_ref()
                            .is_some_and(|mb| ent.pkt_num < mb.num_pkts());
                    if !valid {
                        continue; // server packets hold no credits
                    }
                    let mb = slot.si.resp_msgbuf.as_ref().unwrap();
                    Some(TxBurstItem::new(
                        sess.remote_routing_info,
                        mb.pkt_hdr(ent.pkt_num),
                        mb.pkt_data_ptr(ent.pkt_num),
                        mb.pkt_data_bytes(ent.pkt_num),
                    ))
                }
            };
            if let Some(item) = item {
                self.push_tx(item);
            }
        }

        self.wheel_scratch = due;
    }

    /// Drain the stall queue FIFO; slots still creditless re-enter at the
    /// back.
    fn process_stallq(&mut self) {
        let n = self.stallq.len();
        for _ in 0..n {
            let Some((sess_num, slot_idx)) = self.stallq.pop_front() else {
                break;
            };
            let live = {
                match self
                    .sessions
                    .get_mut(sess_num as usize)
                    .and_then(|s| s.as_mut())
                {
                    Some(sess) => {
                        let slot = &mut sess.sslots[slot_idx];
                        slot.ci.in_stallq = false;
                        slot.is_busy() && sess.is_connected()
                    }
                    None => false,
                }
            };
            if live {
                self.kick_client(sess_num, slot_idx);
            }
        }
    }

    /// Deferred credit-return policy: send batched credits once owed for
    /// longer than the threshold.
    fn process_cr_timers(&mut self) {
        let now = self.ev_loop_tsc;
        let mut owed: Vec<(u16, usize, u16, usize)> = Vec::new();
        for (i, sess) in self.sessions.iter_mut().enumerate() {
            let Some(sess) = sess.as_mut() else { continue };
            if sess.is_client() {
                continue;
            }
            for (slot_idx, slot) in sess.sslots.iter_mut().enumerate() {
                if slot.si.cr_owed > 0
                    && now.wrapping_sub(slot.si.cr_owed_since) > self.cr_defer_cycles
                {
                    let base = slot.si.expected_pkt - slot.si.cr_owed as u16;
                    owed.push((i as u16, slot_idx, base, slot.si.cr_owed));
                    slot.si.cr_owed = 0;
                }
            }
        }
        for (sess_num, slot_idx, base, count) in owed {
            for k in 0..count {
                self.send_explicit_cr(sess_num, slot_idx, base + k as u16);
            }
        }
    }

    // ------------------------------------------------------------------
    // Packet-loss detection & retransmission
    // ------------------------------------------------------------------

    fn pkt_loss_scan(&mut self) {
        let now = self.ev_loop_tsc;
        let mut suspects: Vec<(u16, usize)> = Vec::new();
        let mut sm_resends: Vec<u16> = Vec::new();

        for (i, sess) in self.sessions.iter().enumerate() {
            let Some(sess) = sess.as_ref() else { continue };
            if !sess.is_client() {
                continue;
            }
            match sess.state {
                SessionState::Connected => {
                    for (slot_idx, slot) in sess.sslots.iter().enumerate() {
                        if !slot.is_busy() || slot.ci.num_tx == 0 {
                            continue;
                        }
                        if now.wrapping_sub(slot.ci.progress_tsc) > self.rto_cycles {
                            suspects.push((i as u16, slot_idx));
                        }
                    }
                }
                SessionState::ConnectInProgress | SessionState::DisconnectInProgress => {
                    if now.wrapping_sub(sess.sm_req_tsc) > self.sm_timeout_cycles {
                        sm_resends.push(i as u16);
                    }
                }
                SessionState::ResetInProgress | SessionState::Disconnected => {}
            }
        }

        for (sess_num, slot_idx) in suspects {
            self.pkt_loss_retransmit(sess_num, slot_idx);
        }
        for sess_num in sm_resends {
            self.stats.sm_retransmits += 1;
            self.send_sm_req(sess_num);
        }
    }

    /// Roll back and re-inject a slot that made no progress for an RTO.
    fn pkt_loss_retransmit(&mut self, sess_num: u16, slot_idx: usize) {
        let now = self.ev_loop_tsc;

        enum Verdict {
            FalsePositive,
            Reset,
            Rollback,
        }

        let verdict = {
            let Some(sess) = self.sessions[sess_num as usize].as_mut() else {
                return;
            };
            let slot = &mut sess.sslots[slot_idx];
            let delta = slot.ci.num_tx - slot.ci.num_rx;
            if delta == 0 {
                // Stalled on credits, paced packets still in the wheel,
                // or a background worker owns the response.
                Verdict::FalsePositive
            } else {
                slot.ci.retries += 1;
                if slot.ci.retries > self.config.max_retries {
                    Verdict::Reset
                } else {
                    sess.credits += delta;
                    slot.ci.num_tx = slot.ci.num_rx;
                    slot.ci.progress_tsc = now;
                    Verdict::Rollback
                }
            }
        };

        match verdict {
            Verdict::FalsePositive => {
                self.stats.rto_false_positives += 1;
                trace!(sess_num, slot_idx, "loss scan false positive");
            }
            Verdict::Reset => {
                warn!(sess_num, slot_idx, "retransmission budget exhausted");
                self.reset_session(sess_num);
            }
            Verdict::Rollback => {
                self.stats.retransmissions += 1;
                debug!(sess_num, slot_idx, "packet loss suspected; rolling back");
                // No rolled-back packet may reach the wire twice: purge
                // the local batch, then the transport queue.
                self.do_tx_burst();
                self.transport.tx_flush();
                self.kick_client(sess_num, slot_idx);
            }
        }
    }

    /// Quiesce a session after an unrecoverable failure. Every orphaned
    /// continuation runs exactly once with `SessionReset`.
    fn reset_session(&mut self, sess_num: u16) {
        let Some(mut sess) = self
            .sessions
            .get_mut(sess_num as usize)
            .and_then(|s| s.take())
        else {
            return;
        };
        sess.state = SessionState::ResetInProgress;

        // In-flight TX items may reference buffers owned by this session,
        // and wheel entries must not drain into a reused session slot.
        self.do_tx_burst();
        self.transport.tx_flush();
        self.wheel.purge_session(sess_num);
        self.stallq.retain(|&(s, _)| s != sess_num);

        let mut orphans: Vec<(Continuation, MsgBuffer, MsgBuffer, u64)> = Vec::new();
        for slot in &mut sess.sslots {
            if slot.is_busy() {
                orphans.push((
                    slot.ci.cont.take().unwrap(),
                    slot.ci.req_msgbuf.take().unwrap(),
                    slot.ci.resp_msgbuf.take().unwrap(),
                    slot.ci.tag,
                ));
            }
            slot.reset_client();
            slot.reset_server();
        }
        while let Some(pending) = sess.backlog.pop_front() {
            orphans.push((
                pending.cont,
                pending.req_msgbuf,
                pending.resp_msgbuf,
                pending.tag,
            ));
        }

        self.stats.sessions_reset += 1;
        self.srv_dedup.retain(|_, v| *v != sess_num);
        info!(sess_num, orphans = orphans.len(), "session reset");

        for (cont, req_msgbuf, resp_msgbuf, tag) in orphans {
            cont(CallResult {
                status: RespStatus::SessionReset,
                req_msgbuf,
                resp_msgbuf,
                tag,
            });
        }
        (self.sm_handler)(SessionHandle(sess_num), SmEvent::Reset);
    }

    // ------------------------------------------------------------------
    // Session-management processing
    // ------------------------------------------------------------------

    fn process_sm(&mut self) {
        self.nexus.poll_sm();
        while let Some(env) = self.sm_queue.pop() {
            self.handle_sm(env);
        }
    }

    fn handle_sm(&mut self, env: SmEnvelope) {
        match env.pkt.kind {
            SmPktType::ConnectReq => self.sm_connect_req(env),
            SmPktType::ConnectResp => self.sm_connect_resp(env),
            SmPktType::DisconnectReq => self.sm_disconnect_req(env),
            SmPktType::DisconnectResp => self.sm_disconnect_resp(env),
            SmPktType::Reject => self.sm_reject(env),
        }
    }

    fn sm_reply(&self, dst: SocketAddr, pkt: SmPkt) {
        if let Err(e) = self.nexus.sm_send(dst, &pkt) {
            warn!(%dst, error = %e, "sm reply failed");
        }
    }

    /// Server: a client wants a session. Idempotent under datagram
    /// retransmission.
    fn sm_connect_req(&mut self, env: SmEnvelope) {
        let req = env.pkt;
        let key = (env.from, req.src_rpc_id, req.client_session_num);

        if let Some(&sess_num) = self.srv_dedup.get(&key) {
            // Duplicate connect: re-send the same acceptance.
            let resp = SmPkt {
                kind: SmPktType::ConnectResp,
                reason: SmReason::Ok,
                src_rpc_id: self.rpc_id,
                dst_rpc_id: req.src_rpc_id,
                client_session_num: req.client_session_num,
                server_session_num: sess_num,
                routing_info: self.local_routing_info,
            };
            self.sm_reply(env.from, resp);
            return;
        }

        let mut peer_routing = req.routing_info;
        if !self.transport.resolve_remote_routing_info(&mut peer_routing) {
            let reject = SmPkt {
                kind: SmPktType::Reject,
                reason: SmReason::ResolveFailed,
                src_rpc_id: self.rpc_id,
                dst_rpc_id: req.src_rpc_id,
                client_session_num: req.client_session_num,
                server_session_num: 0,
                routing_info: RoutingInfo::default(),
            };
            self.sm_reply(env.from, reject);
            return;
        }

        let sess_num = match self.alloc_session_slot() {
            Ok(n) => n,
            Err(_) => {
                let reject = SmPkt {
                    kind: SmPktType::Reject,
                    reason: SmReason::TooManySessions,
                    src_rpc_id: self.rpc_id,
                    dst_rpc_id: req.src_rpc_id,
                    client_session_num: req.client_session_num,
                    server_session_num: 0,
                    routing_info: RoutingInfo::default(),
                };
                self.sm_reply(env.from, reject);
                return;
            }
        };

        let mut sess = Session::new(
            SessionRole::Server,
            sess_num,
            env.from,
            req.src_rpc_id,
            &self.config,
            self.freq_ghz,
        );
        sess.remote_session_num = req.client_session_num;
        sess.remote_routing_info = peer_routing;
        self.sessions[sess_num as usize] = Some(sess);
        self.srv_dedup.insert(key, sess_num);

        info!(sess_num, from = %env.from, "server session accepted");
        let resp = SmPkt {
            kind: SmPktType::ConnectResp,
            reason: SmReason::Ok,
            src_rpc_id: self.rpc_id,
            dst_rpc_id: req.src_rpc_id,
            client_session_num: req.client_session_num,
            server_session_num: sess_num,
            routing_info: self.local_routing_info,
        };
        self.sm_reply(env.from, resp);
    }

    /// Client: the server accepted our connect.
    fn sm_connect_resp(&mut self, env: SmEnvelope) {
        let resp = env.pkt;
        let sess_num = resp.client_session_num;
        let resolved = {
            let Some(sess) = self
                .sessions
                .get_mut(sess_num as usize)
                .and_then(|s| s.as_mut())
            else {
                return;
            };
            if sess.state != SessionState::ConnectInProgress {
                return; // duplicate response
            }
            let mut peer_routing = resp.routing_info;
            if self.transport.resolve_remote_routing_info(&mut peer_routing) {
                sess.remote_session_num = resp.server_session_num;
                sess.remote_routing_info = peer_routing;
                sess.state = SessionState::Connected;
                true
            } else {
                false
            }
        };
        if resolved {
            info!(sess_num, "session connected");
            (self.sm_handler)(SessionHandle(sess_num), SmEvent::Connected);
        } else {
            warn!(sess_num, "peer routing info unresolvable");
            self.reset_session(sess_num);
        }
    }

    /// Server: the client is leaving. Reply even when the session is
    /// unknown so a lost response never wedges the peer.
    fn sm_disconnect_req(&mut self, env: SmEnvelope) {
        let req = env.pkt;
        let sess_num = req.server_session_num;

        let known = self
            .sessions
            .get(sess_num as usize)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| {
                s.role == SessionRole::Server && s.remote_session_num == req.client_session_num
            });
        if known {
            self.do_tx_burst();
            self.transport.tx_flush();
            self.wheel.purge_session(sess_num);
            self.sessions[sess_num as usize] = None;
            self.srv_dedup.retain(|_, v| *v != sess_num);
            info!(sess_num, "server session closed");
        }

        let resp = SmPkt {
            kind: SmPktType::DisconnectResp,
            reason: SmReason::Ok,
            src_rpc_id: self.rpc_id,
            dst_rpc_id: req.src_rpc_id,
            client_session_num: req.client_session_num,
            server_session_num: sess_num,
            routing_info: RoutingInfo::default(),
        };
        self.sm_reply(env.from, resp);
    }

    /// Client: graceful disconnect completed. Orphaned requests fail now.
    fn sm_disconnect_resp(&mut self, env: SmEnvelope) {
        let sess_num = env.pkt.client_session_num;
        let in_progress = self
            .sessions
            .get(sess_num as usize)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| s.state == SessionState::DisconnectInProgress);
        if !in_progress {
            return;
        }

        let mut sess = self.sessions[sess_num as usize].take().unwrap();
        self.do_tx_burst();
        self.transport.tx_flush();
        self.wheel.purge_session(sess_num);
        self.stallq.retain(|&(s, _)| s != sess_num);

        let mut orphans: Vec<(Continuation, MsgBuffer, MsgBuffer, u64)> = Vec::new();
        for slot in &mut sess.sslots {
            if slot.is_busy() {
                orphans.push((
                    slot.ci.cont.take().unwrap(),
                    slot.ci.req_msgbuf.take().unwrap(),
                    slot.ci.resp_msgbuf.take().unwrap(),
                    slot.ci.tag,
                ));
            }
            slot.reset_client();
        }
        while let Some(pending) = sess.backlog.pop_front() {
            orphans.push((
                pending.cont,
                pending.req_msgbuf,
                pending.resp_msgbuf,
                pending.tag,
            ));
        }

        info!(sess_num, orphans = orphans.len(), "session disconnected");
        for (cont, req_msgbuf, resp_msgbuf, tag) in orphans {
            cont(CallResult {
                status: RespStatus::SessionReset,
                req_msgbuf,
                resp_msgbuf,
                tag,
            });
        }
        (self.sm_handler)(SessionHandle(sess_num), SmEvent::Disconnected);
    }

    /// Client: the server refused the connect.
    fn sm_reject(&mut self, env: SmEnvelope) {
        let sess_num = env.pkt.client_session_num;
        let in_progress = self
            .sessions
            .get(sess_num as usize)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| s.state == SessionState::ConnectInProgress);
        if !in_progress {
            return;
        }
        self.sessions[sess_num as usize] = None;
        warn!(sess_num, reason = ?env.pkt.reason, "connect rejected");
        (self.sm_handler)(
            SessionHandle(sess_num),
            SmEvent::ConnectFailed(env.pkt.reason),
        );
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        self.do_tx_burst();
        self.transport.tx_flush();
        self.nexus.unregister_hook(self.rpc_id);
    }
}

/// Build the TX item for transmit-sequence index `t` of a client slot:
/// a request packet while `t` is inside the request, an RFR afterwards.
fn build_client_item(
    routing: RoutingInfo,
    remote_session_num: u16,
    slot: &SSlot,
    t: u16,
) -> TxBurstItem {
    let req_mb = slot.ci.req_msgbuf.as_ref().unwrap();
    let nreq = req_mb.num_pkts();
    if t < nreq {
        TxBurstItem::new(
            routing,
            req_mb.pkt_hdr(t),
            req_mb.pkt_data_ptr(t),
            req_mb.pkt_data_bytes(t),
        )
    } else {
        let resp_pkt = t - nreq + 1;
        let hdr = PktHdr::new(
            slot.ci.req_type,
            0,
            remote_session_num,
            PktType::Rfr,
            resp_pkt,
            slot.cur_req_num,
        );
        TxBurstItem::ctrl(routing, hdr)
    }
}

/// Copy one received packet's payload into its place in a message buffer.
/// The length is clamped to the buffer's geometry, never the sender's
/// claim.
fn copy_payload_into(mb: &mut MsgBuffer, pkt_num: u16, payload: *const u8, payload_len: usize) {
    let expect = mb.pkt_data_bytes(pkt_num);
    let n = expect.min(payload_len);
    if n == 0 {
        return;
    }
    let offset = mb.pkt_data_offset(pkt_num);
    // SAFETY: `payload` points into an RX ring entry that outlives this
    // call; the destination range is inside the buffer's payload region.
    unsafe {
        std::ptr::copy_nonoverlapping(payload, mb.data_mut().as_mut_ptr().add(offset), n);
    }
}
