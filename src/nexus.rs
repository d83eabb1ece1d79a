//! Process-wide state shared by all endpoints.
//!
//! One [`Nexus`] exists per process. It owns the UDP control socket used
//! for session management, the request-handler registry, and the
//! TSC-frequency calibration. Handlers are registered during startup,
//! before the Nexus is shared; steady state only reads. There are no
//! ambient singletons: every endpoint receives its `Arc<Nexus>`
//! explicitly.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use crossbeam::queue::ArrayQueue;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rpc::ReqHandle;
use crate::sm::{SmEnvelope, SmPkt, SmPktType, SmReason, SM_PKT_SIZE};
use crate::transport::RoutingInfo;

/// Per-endpoint SM routing queue depth.
const SM_QUEUE_DEPTH: usize = 64;

/// Where a request handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// On the dispatch thread, inline with the event loop. For handlers
    /// that finish in a few microseconds.
    Foreground,
    /// On the endpoint's worker pool, off the dispatch thread.
    Background,
}

/// Request handler callback. Fills the response buffer inside the handle.
pub type ReqHandler = Arc<dyn Fn(&mut ReqHandle) + Send + Sync>;

#[derive(Clone)]
pub struct ReqHandlerEntry {
    pub handler: ReqHandler,
    pub kind: HandlerKind,
    /// Response buffer capacity pre-allocated before dispatch, so
    /// background workers never touch the endpoint allocator.
    pub max_resp_size: usize,
}

pub struct Nexus {
    socket: UdpSocket,
    local_addr: SocketAddr,
    handlers: Vec<Option<ReqHandlerEntry>>,
    /// rpc_id -> SM datagram queue of the registered endpoint. Whichever
    /// endpoint polls the shared socket routes datagrams here.
    hooks: Mutex<HashMap<u8, Arc<ArrayQueue<SmEnvelope>>>>,
    freq_ghz: f64,
}

impl Nexus {
    /// Bind the session-management socket and calibrate the TSC.
    ///
    /// `bind` is typically `"0.0.0.0:<sm_port>"`, or port 0 to let the OS
    /// choose.
    pub fn new(bind: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let freq_ghz = crate::timing::measure_freq_ghz();
        debug!(%local_addr, freq_ghz, "nexus up");

        Ok(Self {
            socket,
            local_addr,
            handlers: vec![None; 256],
            hooks: Mutex::new(HashMap::new()),
            freq_ghz,
        })
    }

    /// The address peers use as this process's session-management URI.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// Register a handler for `req_type`. Must happen before the Nexus is
    /// shared with endpoints.
    pub fn register_req_handler<F>(
        &mut self,
        req_type: u8,
        kind: HandlerKind,
        max_resp_size: usize,
        handler: F,
    ) where
        F: Fn(&mut ReqHandle) + Send + Sync + 'static,
    {
        self.handlers[req_type as usize] = Some(ReqHandlerEntry {
            handler: Arc::new(handler),
            kind,
            max_resp_size,
        });
    }

    pub(crate) fn handler(&self, req_type: u8) -> Option<&ReqHandlerEntry> {
        self.handlers[req_type as usize].as_ref()
    }

    /// Hook an endpoint into SM routing. Fails on a duplicate rpc_id.
    pub(crate) fn register_hook(&self, rpc_id: u8) -> Result<Arc<ArrayQueue<SmEnvelope>>> {
        let mut hooks = self.hooks.lock().unwrap();
        if hooks.contains_key(&rpc_id) {
            return Err(Error::InvalidConfig(format!(
                "rpc id {rpc_id} already registered"
            )));
        }
        let q = Arc::new(ArrayQueue::new(SM_QUEUE_DEPTH));
        hooks.insert(rpc_id, q.clone());
        Ok(q)
    }

    pub(crate) fn unregister_hook(&self, rpc_id: u8) {
        self.hooks.lock().unwrap().remove(&rpc_id);
    }

    /// Resolve a `"host:port"` session-management URI.
    pub(crate) fn resolve_sm_addr(&self, uri: &str) -> Result<SocketAddr> {
        uri.to_socket_addrs()
            .map_err(|_| Error::InvalidRemote(uri.to_string()))?
            .next()
            .ok_or_else(|| Error::InvalidRemote(uri.to_string()))
    }

    /// Send one SM datagram.
    pub(crate) fn sm_send(&self, dst: SocketAddr, pkt: &SmPkt) -> Result<()> {
        self.socket.send_to(&pkt.encode(), dst)?;
        Ok(())
    }

    /// Drain the shared socket, routing datagrams to the owning
    /// endpoint's queue. Called from any endpoint's event loop.
    pub(crate) fn poll_sm(&self) {
        let mut buf = [0u8; SM_PKT_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(x) => x,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "sm socket recv failed");
                    return;
                }
            };
            let pkt = match SmPkt::decode(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%from, error = %e, "malformed sm datagram");
                    continue;
                }
            };

            let hook = self.hooks.lock().unwrap().get(&pkt.dst_rpc_id).cloned();
            match hook {
                Some(q) => {
                    // A full queue is recovered by the sender's SM timer.
                    let _ = q.push(SmEnvelope { pkt, from });
                }
                None => {
                    if pkt.kind == SmPktType::ConnectReq {
                        let reject = SmPkt {
                            kind: SmPktType::Reject,
                            reason: SmReason::UnknownRpcId,
                            src_rpc_id: pkt.dst_rpc_id,
                            dst_rpc_id: pkt.src_rpc_id,
                            client_session_num: pkt.client_session_num,
                            server_session_num: 0,
                            routing_info: RoutingInfo::default(),
                        };
                        let _ = self.sm_send(from, &reject);
                    }
                    debug!(
                        dst_rpc_id = pkt.dst_rpc_id,
                        %from,
                        "sm datagram for unknown endpoint"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nexus_bind_ephemeral() {
        let nexus = Nexus::new("127.0.0.1:0").unwrap();
        assert_ne!(nexus.local_addr().port(), 0);
    }

    #[test]
    fn test_hook_registration() {
        let nexus = Nexus::new("127.0.0.1:0").unwrap();
        let _q = nexus.register_hook(1).unwrap();
        assert!(nexus.register_hook(1).is_err());
        nexus.unregister_hook(1);
        assert!(nexus.register_hook(1).is_ok());
    }

    #[test]
    fn test_sm_routing() {
        let nexus_a = Nexus::new("127.0.0.1:0").unwrap();
        let nexus_b = Nexus::new("127.0.0.1:0").unwrap();
        let q = nexus_b.register_hook(2).unwrap();

        let pkt = SmPkt {
            kind: SmPktType::ConnectReq,
            reason: SmReason::Ok,
            src_rpc_id: 1,
            dst_rpc_id: 2,
            client_session_num: 9,
            server_session_num: 0,
            routing_info: RoutingInfo::default(),
        };
        nexus_a.sm_send(nexus_b.local_addr(), &pkt).unwrap();

        // UDP on loopback is fast but asynchronous.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            nexus_b.poll_sm();
            if let Some(env) = q.pop() {
                assert_eq!(env.pkt, pkt);
                assert_eq!(env.from, nexus_a.local_addr());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "datagram never arrived");
        }
    }

    #[test]
    fn test_unknown_rpc_id_rejected() {
        let nexus_a = Nexus::new("127.0.0.1:0").unwrap();
        let nexus_b = Nexus::new("127.0.0.1:0").unwrap();
        let q = nexus_a.register_hook(1).unwrap();

        let pkt = SmPkt {
            kind: SmPktType::ConnectReq,
            reason: SmReason::Ok,
            src_rpc_id: 1,
            dst_rpc_id: 99, // not registered on b
            client_session_num: 4,
            server_session_num: 0,
            routing_info: RoutingInfo::default(),
        };
        nexus_a.sm_send(nexus_b.local_addr(), &pkt).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            nexus_b.poll_sm();
            nexus_a.poll_sm();
            if let Some(env) = q.pop() {
                assert_eq!(env.pkt.kind, SmPktType::Reject);
                assert_eq!(env.pkt.reason, SmReason::UnknownRpcId);
                assert_eq!(env.pkt.client_session_num, 4);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "reject never arrived");
        }
    }
}
