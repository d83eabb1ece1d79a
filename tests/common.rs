//! Shared harness: a client/server endpoint pair wired through the
//! in-process fabric, with both event loops driven from the test thread.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lancet::{
    HandlerKind, Nexus, Rpc, RpcConfig, SessionHandle, SessionState, SimFabric, SimTransport,
    SmEvent,
};

pub const MTU: usize = 4096;
pub const ECHO: u8 = 1;
pub const CLIENT_ID: u8 = 0;
pub const SERVER_ID: u8 = 1;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestPair {
    pub fabric: SimFabric,
    pub client: Rpc<SimTransport>,
    pub server: Rpc<SimTransport>,
    pub server_uri: String,
    /// (session_num, event) pairs observed by the client's SM handler.
    pub sm_events: Rc<RefCell<Vec<(u16, SmEvent)>>>,
}

/// Build a pair whose server echoes request type [`ECHO`].
pub fn echo_pair(client_cfg: RpcConfig, server_cfg: RpcConfig, max_resp: usize) -> TestPair {
    echo_pair_kind(client_cfg, server_cfg, max_resp, HandlerKind::Foreground)
}

pub fn echo_pair_kind(
    client_cfg: RpcConfig,
    server_cfg: RpcConfig,
    max_resp: usize,
    kind: HandlerKind,
) -> TestPair {
    init_tracing();

    let mut server_nexus = Nexus::new("127.0.0.1:0").unwrap();
    server_nexus.register_req_handler(ECHO, kind, max_resp, |req| {
        let echo = req.req_data().to_vec();
        req.respond(&echo).unwrap();
    });
    let server_nexus = Arc::new(server_nexus);
    let client_nexus = Arc::new(Nexus::new("127.0.0.1:0").unwrap());

    let fabric = SimFabric::new();
    let server = Rpc::new(
        server_nexus.clone(),
        SERVER_ID,
        SimTransport::new(&fabric, MTU),
        server_cfg,
        lancet::noop_sm_handler(),
    )
    .unwrap();

    let sm_events: Rc<RefCell<Vec<(u16, SmEvent)>>> = Rc::new(RefCell::new(Vec::new()));
    let events = sm_events.clone();
    let client = Rpc::new(
        client_nexus,
        CLIENT_ID,
        SimTransport::new(&fabric, MTU),
        client_cfg,
        Box::new(move |h: SessionHandle, e| events.borrow_mut().push((h.session_num(), e))),
    )
    .unwrap();

    let server_uri = server_nexus.local_addr().to_string();
    TestPair {
        fabric,
        client,
        server,
        server_uri,
        sm_events,
    }
}

/// Drive both event loops until `cond` holds or `timeout` elapses.
pub fn run_until<F>(
    client: &mut Rpc<SimTransport>,
    server: &mut Rpc<SimTransport>,
    timeout: Duration,
    mut cond: F,
) -> bool
where
    F: FnMut(&mut Rpc<SimTransport>, &mut Rpc<SimTransport>) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        for _ in 0..64 {
            client.run_event_loop_once();
            server.run_event_loop_once();
        }
        if cond(client, server) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
    }
}

/// Open a session and drive both loops through the connect handshake.
pub fn connect(pair: &mut TestPair) -> SessionHandle {
    let h = pair
        .client
        .create_session(&pair.server_uri, SERVER_ID)
        .unwrap();
    let connected = run_until(
        &mut pair.client,
        &mut pair.server,
        Duration::from_secs(2),
        |c, _| c.session_state(h) == Some(SessionState::Connected),
    );
    assert!(connected, "session never connected");
    h
}

/// Deterministic non-trivial byte pattern.
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(seed) % 251) as u8)
        .collect()
}

/// Issue one echo request and wait for its continuation.
///
/// Panics unless the response is byte-identical to the request.
pub fn echo_once(pair: &mut TestPair, session: SessionHandle, payload: &[u8]) {
    let mut req = pair.client.alloc_msg_buffer(payload.len().max(1)).unwrap();
    req.copy_from(payload).unwrap();
    let resp = pair.client.alloc_msg_buffer(payload.len().max(1)).unwrap();

    let done = Rc::new(RefCell::new(false));
    let done_c = done.clone();
    let expected = payload.to_vec();

    pair.client
        .enqueue_request(
            session,
            ECHO,
            req,
            resp,
            Box::new(move |result| {
                assert_eq!(result.status, lancet::RespStatus::Ok);
                assert_eq!(result.resp_msgbuf.data(), &expected[..], "echo mismatch");
                *done_c.borrow_mut() = true;
            }),
            0,
        )
        .unwrap();

    let finished = run_until(
        &mut pair.client,
        &mut pair.server,
        Duration::from_secs(10),
        |_, _| *done.borrow(),
    );
    assert!(finished, "echo of {} bytes timed out", payload.len());
}

/// Credit conservation at a quiescent point: every credit is home and
/// nothing is in flight.
pub fn assert_credits_quiescent(pair: &TestPair, session: SessionHandle) {
    let total = pair.client.config().session_credits;
    assert_eq!(pair.client.available_credits(session), Some(total));
    assert_eq!(pair.client.credits_in_flight(session), Some(0));
}
