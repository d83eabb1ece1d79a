//! The transport contract.
//!
//! The engine drives a NIC-family driver (InfiniBand, RoCE, OmniPath, or
//! the in-process [`sim`] fabric) through this narrow interface: batched
//! TX, a polled RX ring with explicit RECV reposting, opaque routing-info
//! exchange, and memory-registration callbacks for the pinned-buffer
//! allocator. The event loop is monomorphized over the implementation, so
//! nothing here is dispatched dynamically on the hot path.
//!
//! [`sim`]: crate::sim

use std::sync::Arc;

use crate::packet::{PktHdr, PKT_HDR_SIZE};

/// Space reserved for routing info of any transport family.
///
/// Holds both cluster-wide members (e.g. LID + QPN) and locally resolved
/// ones (e.g. an address-handle pointer), written in place by
/// [`Transport::resolve_remote_routing_info`].
pub const MAX_ROUTING_INFO_SIZE: usize = 32;

/// RECV queue depth. The engine keeps it full, reposting in batches.
pub const RECV_QUEUE_DEPTH: usize = 2048;

/// SEND queue depth.
pub const SEND_QUEUE_DEPTH: usize = 128;

/// Every transport must accept a bare-header TX item of this size inline;
/// explicit credit returns have no DMA-able message buffer behind them.
pub const MIN_INLINE_SIZE: usize = PKT_HDR_SIZE;

const _: () = assert!(RECV_QUEUE_DEPTH.is_power_of_two());
const _: () = assert!(SEND_QUEUE_DEPTH.is_power_of_two());

/// Opaque routing info blob, exchanged over the session-management channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingInfo {
    pub buf: [u8; MAX_ROUTING_INFO_SIZE],
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self {
            buf: [0; MAX_ROUTING_INFO_SIZE],
        }
    }
}

/// Memory-registration record for one pinned region: the lkey the NIC
/// wants on every descriptor, plus an opaque handle for deregistration.
#[derive(Debug, Clone, Copy)]
pub struct MemRegInfo {
    pub lkey: u32,
    pub handle: u64,
}

/// Registration callbacks handed to the allocator at endpoint creation.
/// Called once per slab, never on the per-message path.
#[derive(Clone)]
pub struct MemRegFns {
    pub reg: Arc<dyn Fn(*mut u8, usize) -> MemRegInfo + Send + Sync>,
    pub dereg: Arc<dyn Fn(MemRegInfo) + Send + Sync>,
}

impl MemRegFns {
    /// Registration functions for transports without memory registration.
    pub fn noop() -> Self {
        Self {
            reg: Arc::new(|_, _| MemRegInfo { lkey: 0, handle: 0 }),
            dereg: Arc::new(|_| {}),
        }
    }
}

/// One packet in a TX batch.
///
/// The header travels by value; the payload is referenced in place from
/// the owning message buffer (null for bare-header control packets). The
/// pointer stays valid until the transport finishes the burst: the owning
/// slot keeps the buffer alive until its exchange completes, and rollback
/// paths call `tx_flush` before any buffer is reused.
#[derive(Debug, Clone, Copy)]
pub struct TxBurstItem {
    pub routing_info: RoutingInfo,
    pub hdr: PktHdr,
    pub payload: *const u8,
    pub data_bytes: usize,
    /// Drop instead of transmitting. Testing only.
    pub drop: bool,
}

impl TxBurstItem {
    pub fn new(routing_info: RoutingInfo, hdr: PktHdr, payload: *const u8, data_bytes: usize) -> Self {
        Self {
            routing_info,
            hdr,
            payload,
            data_bytes,
            drop: false,
        }
    }

    /// A bare-header control packet (RFR, explicit credit return).
    pub fn ctrl(routing_info: RoutingInfo, hdr: PktHdr) -> Self {
        Self::new(routing_info, hdr, std::ptr::null(), 0)
    }
}

/// A mostly-reliable datagram transport.
///
/// Implementations post descriptors to one NIC queue pair (or emulate
/// one). All methods are called from the owning endpoint's dispatch thread
/// only.
pub trait Transport {
    /// Maximum packet size including the 16-byte header.
    fn mtu(&self) -> usize;

    /// Write locally valid routing info for this endpoint.
    fn fill_local_routing_info(&self, ri: &mut RoutingInfo);

    /// Convert cluster-wide routing info into locally usable form, in
    /// place. Called once per session during connect. Returns false if the
    /// peer cannot be resolved.
    fn resolve_remote_routing_info(&self, ri: &mut RoutingInfo) -> bool;

    /// Memory (de)registration functions for the allocator.
    fn reg_fns(&self) -> MemRegFns;

    /// Transmit a batch of at most [`SEND_QUEUE_DEPTH`] packets.
    fn tx_burst(&mut self, batch: &[TxBurstItem]);

    /// Drain the send queue, returning ownership of every in-flight TX
    /// buffer. Expensive; called only on retransmission rollback and
    /// shutdown.
    fn tx_flush(&mut self);

    /// Number of newly arrived packets in the RX ring.
    fn rx_burst(&mut self) -> usize;

    /// The `idx`-th unconsumed ring entry (header + payload). Valid until
    /// the entry is recycled by [`Transport::post_recvs`].
    fn rx_pkt(&self, idx: usize) -> &[u8];

    /// Recycle the `n` oldest ring entries.
    fn post_recvs(&mut self, n: usize);

    /// Maximum payload bytes per packet.
    #[inline]
    fn max_data_per_pkt(&self) -> usize {
        self.mtu() - PKT_HDR_SIZE
    }
}
