//! # lancet — a low-latency datagram RPC engine
//!
//! Request/response semantics over a lossy-but-mostly-reliable datagram
//! fabric, built for microsecond latencies: a single polling dispatch
//! thread multiplexes many concurrent exchanges over one transport queue
//! pair, with credit-based flow control per session, rate-paced
//! transmission through a timing wheel, RTO-driven loss recovery, and
//! out-of-band UDP session management.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use lancet::{
//!     noop_sm_handler, HandlerKind, Nexus, Rpc, RpcConfig, SimFabric, SimTransport,
//! };
//!
//! # fn main() -> lancet::Result<()> {
//! // Process-wide state: SM socket + handler registry.
//! let mut nexus = Nexus::new("0.0.0.0:31850")?;
//! nexus.register_req_handler(1, HandlerKind::Foreground, 4096, |req| {
//!     let echo = req.req_data().to_vec();
//!     req.respond(&echo).unwrap();
//! });
//! let nexus = Arc::new(nexus);
//!
//! // One endpoint over one transport.
//! let fabric = SimFabric::new();
//! let transport = SimTransport::new(&fabric, 4096);
//! let mut rpc = Rpc::new(nexus, 0, transport, RpcConfig::default(), noop_sm_handler())?;
//!
//! let session = rpc.create_session("server-host:31850", 1)?;
//! let req = rpc.alloc_msg_buffer(64)?;
//! let resp = rpc.alloc_msg_buffer(64)?;
//! rpc.enqueue_request(
//!     session,
//!     1,
//!     req,
//!     resp,
//!     Box::new(|result| {
//!         println!("reply: {} bytes", result.resp_msgbuf.data().len());
//!     }),
//!     0,
//! )?;
//!
//! loop {
//!     rpc.run_event_loop_once();
//! }
//! # }
//! ```
//!
//! ## Layout
//!
//! - [`packet`]: 16-byte wire header
//! - [`buffer`]: multi-packet message buffers over registered memory
//! - [`transport`]: the consumed transport contract
//! - [`sim`]: in-process fabric with fault injection
//! - [`session`]: sessions, slots, credit accounting
//! - [`wheel`]: timing wheel for paced transmission
//! - [`cc`]: Timely-style congestion control
//! - [`nexus`]: process-wide registry and SM socket
//! - [`sm`]: session-management datagram format
//! - [`rpc`]: the event-loop engine and API surface

pub mod buffer;
pub mod cc;
pub mod config;
pub mod error;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sim;
pub mod sm;
pub mod timing;
pub mod transport;
pub mod wheel;

mod bg;

pub use buffer::{HugeAlloc, MsgBuffer};
pub use config::{CrPolicy, RpcConfig};
pub use error::{Error, Result};
pub use nexus::{HandlerKind, Nexus};
pub use packet::{PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{
    noop_sm_handler, CallResult, Continuation, ReqHandle, RespStatus, Rpc, RpcStats, SmHandler,
};
pub use session::{SessionHandle, SessionState};
pub use sim::{SimFabric, SimTransport};
pub use sm::{SmEvent, SmReason};
pub use transport::{MemRegFns, MemRegInfo, RoutingInfo, Transport, TxBurstItem};
