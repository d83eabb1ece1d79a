//! Microbenchmarks: header codec, wheel churn, and loopback echo over
//! the in-process fabric.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use lancet::packet::{data_size_to_num_pkts, PktHdr, PktType, PKT_HDR_SIZE};
use lancet::wheel::{TimingWheel, WheelEnt};
use lancet::{
    noop_sm_handler, HandlerKind, Nexus, RespStatus, Rpc, RpcConfig, SessionState, SimFabric,
    SimTransport,
};

const MTU: usize = 4096;
const ECHO: u8 = 1;

fn bench_pkt_hdr(c: &mut Criterion) {
    let mut group = c.benchmark_group("pkt_hdr");
    group.throughput(Throughput::Bytes(PKT_HDR_SIZE as u64));

    group.bench_function("encode", |b| {
        let mut buf = [0u8; PKT_HDR_SIZE];
        b.iter(|| {
            let hdr = PktHdr::new(
                black_box(7),
                black_box(4080),
                black_box(3),
                PktType::Req,
                black_box(12),
                black_box(0xABCDE),
            );
            unsafe { hdr.write_to(buf.as_mut_ptr()) };
            black_box(&buf);
        });
    });

    group.bench_function("decode", |b| {
        let hdr = PktHdr::new(7, 4080, 3, PktType::Resp, 12, 0xABCDE);
        let bytes = hdr.to_bytes();
        b.iter(|| {
            let hdr = unsafe { PktHdr::read_from(black_box(bytes.as_ptr())) };
            black_box(hdr.req_num());
        });
    });

    group.bench_function("data_size_to_num_pkts", |b| {
        b.iter(|| black_box(data_size_to_num_pkts(black_box(100_000), MTU)));
    });

    group.finish();
}

fn bench_wheel(c: &mut Criterion) {
    c.bench_function("wheel_insert_reap_64", |b| {
        let mut wheel = TimingWheel::new(4096, 12, 0);
        let mut out = Vec::with_capacity(64);
        let mut now = 1u64 << 20;
        b.iter(|| {
            for i in 0..64u16 {
                wheel.insert(WheelEnt {
                    sess_num: 0,
                    sslot_idx: 0,
                    req_num: 8,
                    pkt_num: i,
                    abs_tx_tsc: now + (i as u64) * 512,
                });
            }
            now += 64 * 512;
            out.clear();
            wheel.reap(now, &mut out);
            black_box(out.len());
        });
    });
}

struct EchoPair {
    client: Rpc<SimTransport>,
    server: Rpc<SimTransport>,
    session: lancet::SessionHandle,
}

fn echo_pair() -> EchoPair {
    let mut server_nexus = Nexus::new("127.0.0.1:0").unwrap();
    server_nexus.register_req_handler(ECHO, HandlerKind::Foreground, MTU, |req| {
        let echo = req.req_data().to_vec();
        req.respond(&echo).unwrap();
    });
    let server_nexus = Arc::new(server_nexus);
    let client_nexus = Arc::new(Nexus::new("127.0.0.1:0").unwrap());

    let fabric = SimFabric::new();
    let server = Rpc::new(
        server_nexus.clone(),
        1,
        SimTransport::new(&fabric, MTU),
        RpcConfig::default(),
        noop_sm_handler(),
    )
    .unwrap();
    let mut client = Rpc::new(
        client_nexus,
        0,
        SimTransport::new(&fabric, MTU),
        RpcConfig::default(),
        noop_sm_handler(),
    )
    .unwrap();

    let uri = server_nexus.local_addr().to_string();
    let session = client.create_session(&uri, 1).unwrap();

    let mut pair = EchoPair {
        client,
        server,
        session,
    };
    while pair.client.session_state(session) != Some(SessionState::Connected) {
        pair.client.run_event_loop_once();
        pair.server.run_event_loop_once();
    }
    pair
}

fn bench_echo(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo_loopback");

    for size in [64usize, 1024, 4000] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            let mut pair = echo_pair();
            let payload = vec![0x5Au8; size];
            b.iter(|| {
                let mut req = pair.client.alloc_msg_buffer(size).unwrap();
                req.copy_from(&payload).unwrap();
                let resp = pair.client.alloc_msg_buffer(size).unwrap();

                let done = Rc::new(RefCell::new(false));
                let done_c = done.clone();
                pair.client
                    .enqueue_request(
                        pair.session,
                        ECHO,
                        req,
                        resp,
                        Box::new(move |result| {
                            assert_eq!(result.status, RespStatus::Ok);
                            *done_c.borrow_mut() = true;
                        }),
                        0,
                    )
                    .unwrap();
                while !*done.borrow() {
                    pair.client.run_event_loop_once();
                    pair.server.run_event_loop_once();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pkt_hdr, bench_wheel, bench_echo);
criterion_main!(benches);
