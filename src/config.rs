//! Endpoint configuration.

/// Policy for returning credits when no response data is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrPolicy {
    /// Return a credit the moment a non-final request packet is accepted.
    /// The response cannot be ready while the request is still arriving,
    /// so there is nothing to piggyback on.
    Immediate,
    /// Batch owed credits and send them only once they have been owed for
    /// longer than `cr_defer_us` with no response ready. Credits elided
    /// here ride implicitly on the first response packet.
    Deferred,
}

/// RPC endpoint configuration.
///
/// Controls request multiplexing, flow control, pacing, and reliability
/// parameters for one endpoint.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Concurrent request slots per session. Request numbers within a slot
    /// advance by this amount, so `req_num % req_window` is the slot index.
    /// Default: 8
    pub req_window: usize,
    /// Flow-control credits per session.
    /// Default: 8
    pub session_credits: usize,
    /// Retransmission timeout in microseconds.
    /// Default: 5000 (5 ms)
    pub rto_us: u64,
    /// RTO retransmissions tolerated per request before the session is
    /// reset. Default: 5
    pub max_retries: u32,
    /// Event-loop iterations between packet-loss scans.
    /// Default: 256
    pub rto_scan_cycles: u64,
    /// Session-management retransmission timeout in milliseconds.
    /// Default: 1000
    pub sm_timeout_ms: u64,
    /// Enable Timely congestion control (rate-paced transmission through
    /// the timing wheel). Default: false
    pub enable_cc: bool,
    /// Explicit credit-return policy. Default: Immediate
    pub cr_policy: CrPolicy,
    /// Deferral threshold for `CrPolicy::Deferred`, in microseconds.
    /// Default: 20
    pub cr_defer_us: u64,
    /// Maximum number of sessions on the endpoint.
    /// Default: 256
    pub max_sessions: usize,
    /// TX batch capacity; the batch is flushed when it fills.
    /// Default: 32
    pub tx_batch_size: usize,
    /// Consumed RX ring entries are recycled in batches of at least this
    /// many. Default: 32
    pub recv_slack: usize,
    /// Maximum message payload size accepted by `enqueue_request` and
    /// handler responses. Default: 8 MiB
    pub max_msg_size: usize,
    /// Number of background worker threads for handlers registered as
    /// background. Default: 0
    pub num_bg_threads: usize,
    /// Timing-wheel bucket count (power of two). Default: 4096
    pub wheel_num_buckets: usize,
    /// Timing-wheel bucket width in microseconds. Default: 2
    pub wheel_bucket_us: u64,
    /// Overflow-list length above which a warning is logged.
    /// Default: 4096
    pub wheel_overflow_warn: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            session_credits: 8,
            rto_us: 5000,
            max_retries: 5,
            rto_scan_cycles: 256,
            sm_timeout_ms: 1000,
            enable_cc: false,
            cr_policy: CrPolicy::Immediate,
            cr_defer_us: 20,
            max_sessions: 256,
            tx_batch_size: 32,
            recv_slack: 32,
            max_msg_size: 8 << 20,
            num_bg_threads: 0,
            wheel_num_buckets: 4096,
            wheel_bucket_us: 2,
            wheel_overflow_warn: 4096,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_req_window(mut self, req_window: usize) -> Self {
        self.req_window = req_window;
        self
    }

    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    pub fn with_rto_us(mut self, rto_us: u64) -> Self {
        self.rto_us = rto_us;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_sm_timeout_ms(mut self, sm_timeout_ms: u64) -> Self {
        self.sm_timeout_ms = sm_timeout_ms;
        self
    }

    pub fn with_cc(mut self, enable_cc: bool) -> Self {
        self.enable_cc = enable_cc;
        self
    }

    pub fn with_cr_policy(mut self, cr_policy: CrPolicy) -> Self {
        self.cr_policy = cr_policy;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    pub fn with_bg_threads(mut self, num_bg_threads: usize) -> Self {
        self.num_bg_threads = num_bg_threads;
        self
    }

    pub fn with_rto_scan_cycles(mut self, rto_scan_cycles: u64) -> Self {
        self.rto_scan_cycles = rto_scan_cycles;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::default()
            .with_req_window(16)
            .with_session_credits(64)
            .with_rto_us(10000)
            .with_max_retries(3)
            .with_cc(true);

        assert_eq!(config.req_window, 16);
        assert_eq!(config.session_credits, 64);
        assert_eq!(config.rto_us, 10000);
        assert_eq!(config.max_retries, 3);
        assert!(config.enable_cc);
    }
}
