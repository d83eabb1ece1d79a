//! Background worker pool.
//!
//! Handlers registered as [`HandlerKind::Background`] run here instead of
//! on the dispatch thread. Hand-off is by move through a pair of
//! lock-free queues: the dispatch thread pushes request handles in,
//! workers push completed handles onto the reply queue, and the event
//! loop's reply intake puts the responses on the TX path. Workers never
//! touch the transport or any session state.
//!
//! [`HandlerKind::Background`]: crate::nexus::HandlerKind::Background

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use tracing::warn;

use crate::nexus::Nexus;
use crate::rpc::ReqHandle;

/// Depth of each hand-off queue.
const BG_QUEUE_DEPTH: usize = 512;

pub(crate) struct BgQueues {
    /// dispatch -> workers
    pub req_q: ArrayQueue<ReqHandle>,
    /// workers -> dispatch
    pub resp_q: ArrayQueue<ReqHandle>,
    stop: AtomicBool,
}

pub(crate) struct BgWorkerPool {
    queues: Arc<BgQueues>,
    workers: Vec<JoinHandle<()>>,
}

impl BgWorkerPool {
    pub fn start(nexus: Arc<Nexus>, num_threads: usize) -> Self {
        let queues = Arc::new(BgQueues {
            req_q: ArrayQueue::new(BG_QUEUE_DEPTH),
            resp_q: ArrayQueue::new(BG_QUEUE_DEPTH),
            stop: AtomicBool::new(false),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let nexus = nexus.clone();
                let queues = queues.clone();
                std::thread::Builder::new()
                    .name(format!("rpc-bg-{i}"))
                    .spawn(move || worker_loop(nexus, queues))
                    .expect("spawn background worker")
            })
            .collect();

        Self { queues, workers }
    }

    pub fn queues(&self) -> &Arc<BgQueues> {
        &self.queues
    }
}

impl Drop for BgWorkerPool {
    fn drop(&mut self) {
        self.queues.stop.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(nexus: Arc<Nexus>, queues: Arc<BgQueues>) {
    while !queues.stop.load(Ordering::Acquire) {
        let mut handle = match queues.req_q.pop() {
            Some(h) => h,
            None => {
                // Idle; the dispatch loop is the latency-critical side.
                std::thread::sleep(Duration::from_micros(20));
                continue;
            }
        };

        match nexus.handler(handle.req_type()) {
            Some(entry) => (entry.handler)(&mut handle),
            // Dispatch only hands off requests with a registered handler.
            None => warn!(req_type = handle.req_type(), "handler vanished"),
        }

        if queues.resp_q.push(handle).is_err() {
            // Reply queue full: the dispatch thread is far behind. The
            // client recovers the lost response by retransmission after
            // its RTO, the same as a dropped packet.
            warn!("background reply queue full; response dropped");
        }
    }
}
