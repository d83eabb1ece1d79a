//! In-process datagram fabric.
//!
//! [`SimFabric`] emulates a lossy-but-mostly-reliable switch between
//! endpoints in one process: per-port bounded queues (overflow drops,
//! like a shallow switch buffer), optional seeded uniform loss, and
//! fault-injection hooks used by the reliability tests. [`SimTransport`]
//! realizes the [`Transport`] contract over one fabric port.
//!
//! NIC-family drivers live outside this crate; the fabric stands in for
//! them wherever the engine itself is under test.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::queue::ArrayQueue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::packet::{PktHdr, PKT_HDR_SIZE};
use crate::transport::{
    MemRegFns, RoutingInfo, Transport, TxBurstItem, RECV_QUEUE_DEPTH,
};

/// Decides, per would-be transmission, whether to drop it.
pub type DropFilter = Box<dyn FnMut(&PktHdr) -> bool + Send>;

struct Faults {
    loss_rate: f64,
    rng: StdRng,
    drop_first_copies: bool,
    /// Wire images already seen once, keyed by destination + header bytes.
    /// A retransmission repeats the header exactly, so it passes.
    seen: HashSet<(u32, [u8; PKT_HDR_SIZE])>,
    filter: Option<DropFilter>,
}

impl Faults {
    fn new() -> Self {
        Self {
            loss_rate: 0.0,
            rng: StdRng::seed_from_u64(0),
            drop_first_copies: false,
            seen: HashSet::new(),
            filter: None,
        }
    }

    fn should_drop(&mut self, dst: u32, hdr: &PktHdr) -> bool {
        if let Some(f) = self.filter.as_mut() {
            if f(hdr) {
                return true;
            }
        }
        if self.drop_first_copies && self.seen.insert((dst, hdr.to_bytes())) {
            return true;
        }
        self.loss_rate > 0.0 && self.rng.gen::<f64>() < self.loss_rate
    }
}

struct Port {
    q: ArrayQueue<Vec<u8>>,
}

struct FabricInner {
    ports: Mutex<HashMap<u32, Arc<Port>>>,
    next_port: AtomicU32,
    faults: Mutex<Faults>,
    drops: AtomicU64,
}

/// An in-process datagram fabric shared by a set of [`SimTransport`]s.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<FabricInner>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                ports: Mutex::new(HashMap::new()),
                next_port: AtomicU32::new(1),
                faults: Mutex::new(Faults::new()),
                drops: AtomicU64::new(0),
            }),
        }
    }

    /// Drop each packet independently with probability `rate`, from a
    /// seeded generator.
    pub fn set_loss_rate(&self, rate: f64, seed: u64) {
        let mut faults = self.inner.faults.lock().unwrap();
        faults.loss_rate = rate;
        faults.rng = StdRng::seed_from_u64(seed);
    }

    /// Drop the first copy of every distinct packet; retransmissions pass.
    pub fn set_drop_first_copies(&self, enable: bool) {
        let mut faults = self.inner.faults.lock().unwrap();
        faults.drop_first_copies = enable;
        faults.seen.clear();
    }

    /// Install (or clear) an arbitrary header-predicate drop filter.
    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        self.inner.faults.lock().unwrap().filter = filter;
    }

    /// Total packets dropped by fault injection or queue overflow.
    pub fn drop_count(&self) -> u64 {
        self.inner.drops.load(Ordering::Relaxed)
    }

    fn register_port(&self) -> (u32, Arc<Port>) {
        let id = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let port = Arc::new(Port {
            q: ArrayQueue::new(RECV_QUEUE_DEPTH),
        });
        self.inner.ports.lock().unwrap().insert(id, port.clone());
        (id, port)
    }

    fn unregister_port(&self, id: u32) {
        self.inner.ports.lock().unwrap().remove(&id);
    }

    fn port(&self, id: u32) -> Option<Arc<Port>> {
        self.inner.ports.lock().unwrap().get(&id).cloned()
    }

    fn deliver(&self, dst: u32, hdr: &PktHdr, frame: Vec<u8>) {
        if self.inner.faults.lock().unwrap().should_drop(dst, hdr) {
            self.inner.drops.fetch_add(1, Ordering::Relaxed);
            trace!(dst, pkt_num = hdr.pkt_num(), req_num = hdr.req_num(), "fabric dropped packet");
            return;
        }
        match self.port(dst) {
            // A full port queue is a shallow switch buffer: drop.
            Some(port) => {
                if port.q.push(frame).is_err() {
                    self.inner.drops.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Unknown destination (peer gone): the fabric is lossy.
            None => {
                self.inner.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

fn port_of(ri: &RoutingInfo) -> u32 {
    u32::from_le_bytes([ri.buf[0], ri.buf[1], ri.buf[2], ri.buf[3]])
}

/// A [`Transport`] over one [`SimFabric`] port.
pub struct SimTransport {
    fabric: SimFabric,
    port_id: u32,
    port: Arc<Port>,
    /// Fetched-but-unrecycled RX ring entries.
    ring: VecDeque<Vec<u8>>,
    mtu: usize,
    /// Times `tx_flush` was called. Testing only.
    pub tx_flush_count: u64,
}

impl SimTransport {
    pub fn new(fabric: &SimFabric, mtu: usize) -> Self {
        assert!(mtu > PKT_HDR_SIZE);
        let (port_id, port) = fabric.register_port();
        Self {
            fabric: fabric.clone(),
            port_id,
            port,
            ring: VecDeque::with_capacity(RECV_QUEUE_DEPTH),
            mtu,
            tx_flush_count: 0,
        }
    }

    pub fn port_id(&self) -> u32 {
        self.port_id
    }
}

impl Transport for SimTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn fill_local_routing_info(&self, ri: &mut RoutingInfo) {
        ri.buf = [0; crate::transport::MAX_ROUTING_INFO_SIZE];
        ri.buf[0..4].copy_from_slice(&self.port_id.to_le_bytes());
    }

    fn resolve_remote_routing_info(&self, ri: &mut RoutingInfo) -> bool {
        // Port ids are already locally meaningful; resolution is just an
        // existence check.
        self.fabric.port(port_of(ri)).is_some()
    }

    fn reg_fns(&self) -> MemRegFns {
        MemRegFns::noop()
    }

    fn tx_burst(&mut self, batch: &[TxBurstItem]) {
        for item in batch {
            if item.drop {
                self.fabric.inner.drops.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            debug_assert!(PKT_HDR_SIZE + item.data_bytes <= self.mtu);
            let mut frame = Vec::with_capacity(PKT_HDR_SIZE + item.data_bytes);
            frame.extend_from_slice(&item.hdr.to_bytes());
            if item.data_bytes > 0 {
                debug_assert!(!item.payload.is_null());
                let payload =
                    unsafe { std::slice::from_raw_parts(item.payload, item.data_bytes) };
                frame.extend_from_slice(payload);
            }
            self.fabric.deliver(port_of(&item.routing_info), &item.hdr, frame);
        }
    }

    fn tx_flush(&mut self) {
        // Delivery is synchronous; nothing is in flight to drain.
        self.tx_flush_count += 1;
    }

    fn rx_burst(&mut self) -> usize {
        let mut n = 0;
        while self.ring.len() < RECV_QUEUE_DEPTH {
            match self.port.q.pop() {
                Some(frame) => {
                    self.ring.push_back(frame);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn rx_pkt(&self, idx: usize) -> &[u8] {
        &self.ring[idx]
    }

    fn post_recvs(&mut self, n: usize) {
        debug_assert!(n <= self.ring.len());
        for _ in 0..n {
            self.ring.pop_front();
        }
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.fabric.unregister_port(self.port_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PktType;

    fn routing_to(t: &SimTransport) -> RoutingInfo {
        let mut ri = RoutingInfo::default();
        ri.buf[0..4].copy_from_slice(&t.port_id().to_le_bytes());
        ri
    }

    fn req_item(dst: RoutingInfo, pkt_num: u16, payload: &[u8]) -> TxBurstItem {
        let hdr = PktHdr::new(0, payload.len(), 0, PktType::Req, pkt_num, 0);
        TxBurstItem::new(dst, hdr, payload.as_ptr(), payload.len())
    }

    #[test]
    fn test_loopback_delivery() {
        let fabric = SimFabric::new();
        let mut a = SimTransport::new(&fabric, 4096);
        let mut b = SimTransport::new(&fabric, 4096);

        let payload = b"hello fabric";
        a.tx_burst(&[req_item(routing_to(&b), 3, payload)]);

        assert_eq!(b.rx_burst(), 1);
        let pkt = b.rx_pkt(0);
        let hdr = PktHdr::from_bytes(pkt).unwrap();
        assert_eq!(hdr.pkt_num(), 3);
        assert_eq!(&pkt[PKT_HDR_SIZE..], payload);
        b.post_recvs(1);
        assert_eq!(b.rx_burst(), 0);
    }

    #[test]
    fn test_drop_flag() {
        let fabric = SimFabric::new();
        let mut a = SimTransport::new(&fabric, 4096);
        let mut b = SimTransport::new(&fabric, 4096);

        let mut item = req_item(routing_to(&b), 0, b"x");
        item.drop = true;
        a.tx_burst(&[item]);

        assert_eq!(b.rx_burst(), 0);
        assert_eq!(fabric.drop_count(), 1);
    }

    #[test]
    fn test_first_copy_dropped_retransmit_passes() {
        let fabric = SimFabric::new();
        let mut a = SimTransport::new(&fabric, 4096);
        let mut b = SimTransport::new(&fabric, 4096);
        fabric.set_drop_first_copies(true);

        a.tx_burst(&[req_item(routing_to(&b), 5, b"pay")]);
        assert_eq!(b.rx_burst(), 0);

        // Identical header: this is the retransmission.
        a.tx_burst(&[req_item(routing_to(&b), 5, b"pay")]);
        assert_eq!(b.rx_burst(), 1);
    }

    #[test]
    fn test_unknown_port_is_lossy() {
        let fabric = SimFabric::new();
        let mut a = SimTransport::new(&fabric, 4096);
        let dst = {
            let b = SimTransport::new(&fabric, 4096);
            routing_to(&b)
            // b dropped: port unregistered
        };
        a.tx_burst(&[req_item(dst, 0, b"gone")]);
        assert_eq!(fabric.drop_count(), 1);
    }

    #[test]
    fn test_resolve_routing() {
        let fabric = SimFabric::new();
        let a = SimTransport::new(&fabric, 4096);
        let b = SimTransport::new(&fabric, 4096);

        let mut ri = RoutingInfo::default();
        b.fill_local_routing_info(&mut ri);
        assert!(a.resolve_remote_routing_info(&mut ri));

        ri.buf[0..4].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        assert!(!a.resolve_remote_routing_info(&mut ri));
    }
}
