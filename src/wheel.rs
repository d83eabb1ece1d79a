//! Timing wheel for rate-paced transmission.
//!
//! A calendar queue over TSC time: the wheel is a ring of buckets, each
//! covering `1 << width_bits` cycles. Insertion is O(1): the bucket index
//! is `(abs_tx_tsc - base_tsc) >> width_bits` from the current base.
//! Entries whose transmit time is past the wheel horizon go to an overflow
//! list that is re-examined on every reap.
//!
//! Paced transmission smooths bursts that would otherwise cause incast
//! drops on shallow-buffered switches; the engine drains due buckets into
//! its TX batch once per event-loop iteration.

use std::collections::VecDeque;

use tracing::warn;

/// One paced packet: enough state to rebuild the packet at drain time and
/// to detect that the owning request has since completed or rolled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelEnt {
    /// Local session number of the owning session.
    pub sess_num: u16,
    /// Slot index within the session.
    pub sslot_idx: u8,
    /// Request generation the packet belongs to.
    pub req_num: u64,
    /// Transmit-sequence index (client) or response packet index (server).
    pub pkt_num: u16,
    /// Absolute TSC at which the packet becomes due.
    pub abs_tx_tsc: u64,
}

pub struct TimingWheel {
    buckets: Vec<VecDeque<WheelEnt>>,
    mask: usize,
    width_bits: u32,
    /// Start time of the bucket at `base_idx`.
    base_tsc: u64,
    base_idx: usize,
    /// Wheel coverage in cycles.
    horizon: u64,
    overflow: VecDeque<WheelEnt>,
    overflow_warn: usize,
    len: usize,
    /// Times the overflow list crossed the warn threshold.
    pub overflow_events: u64,
}

impl TimingWheel {
    /// Create a wheel with `num_buckets` (rounded up to a power of two)
    /// buckets of `1 << width_bits` cycles each, anchored at `start_tsc`.
    pub fn new(num_buckets: usize, width_bits: u32, start_tsc: u64) -> Self {
        let num_buckets = num_buckets.next_power_of_two().max(2);
        Self {
            buckets: (0..num_buckets).map(|_| VecDeque::new()).collect(),
            mask: num_buckets - 1,
            width_bits,
            base_tsc: start_tsc,
            base_idx: 0,
            horizon: (num_buckets as u64) << width_bits,
            overflow: VecDeque::new(),
            overflow_warn: usize::MAX,
            len: 0,
            overflow_events: 0,
        }
    }

    /// Set the overflow-list length that triggers a warning.
    pub fn set_overflow_warn(&mut self, cap: usize) {
        self.overflow_warn = cap.max(1);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a paced packet. Entries already due land in the base bucket
    /// and come out on the next reap.
    pub fn insert(&mut self, ent: WheelEnt) {
        self.len += 1;
        if ent.abs_tx_tsc >= self.base_tsc.wrapping_add(self.horizon) {
            self.overflow.push_back(ent);
            if self.overflow.len() == self.overflow_warn {
                self.overflow_events += 1;
                warn!(
                    overflow_len = self.overflow.len(),
                    "timing wheel overflow list at cap; pacing rate suspiciously low"
                );
            }
            return;
        }
        let delta = (ent.abs_tx_tsc.saturating_sub(self.base_tsc) >> self.width_bits) as usize;
        let idx = (self.base_idx + delta) & self.mask;
        self.buckets[idx].push_back(ent);
    }

    /// Move every entry that is due at `now` into `out`, preserving
    /// insertion order within a bucket and time order across buckets.
    pub fn reap(&mut self, now: u64, out: &mut Vec<WheelEnt>) {
        let width = 1u64 << self.width_bits;

        // Empty wheel: snap the base forward instead of walking buckets
        // across an idle gap.
        if self.len == 0 {
            if now > self.base_tsc {
                self.base_tsc = now & !(width - 1);
            }
            return;
        }

        self.admit_overflow();

        // Buckets fully in the past.
        while self.base_tsc.wrapping_add(width) <= now {
            while let Some(ent) = self.buckets[self.base_idx].pop_front() {
                self.len -= 1;
                out.push(ent);
            }
            self.base_idx = (self.base_idx + 1) & self.mask;
            self.base_tsc = self.base_tsc.wrapping_add(width);
            self.admit_overflow();
        }

        // The bucket `now` falls in: drain without advancing, so entries
        // inserted for immediate transmission leave the same iteration.
        if self.base_tsc <= now {
            while let Some(ent) = self.buckets[self.base_idx].pop_front() {
                self.len -= 1;
                out.push(ent);
            }
        }
    }

    /// Pull overflow entries that now fit the wheel horizon into buckets.
    fn admit_overflow(&mut self) {
        let mut remaining = self.overflow.len();
        while remaining > 0 {
            remaining -= 1;
            let ent = match self.overflow.pop_front() {
                Some(e) => e,
                None => break,
            };
            if ent.abs_tx_tsc >= self.base_tsc.wrapping_add(self.horizon) {
                self.overflow.push_back(ent);
            } else {
                let delta =
                    (ent.abs_tx_tsc.saturating_sub(self.base_tsc) >> self.width_bits) as usize;
                let idx = (self.base_idx + delta) & self.mask;
                self.buckets[idx].push_back(ent);
            }
        }
    }

    /// Remove every entry belonging to `sess_num`. Called when a session
    /// is torn down, so no entry can drain into a reused session slot.
    pub fn purge_session(&mut self, sess_num: u16) -> usize {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|e| e.sess_num != sess_num);
            removed += before - bucket.len();
        }
        let before = self.overflow.len();
        self.overflow.retain(|e| e.sess_num != sess_num);
        removed += before - self.overflow.len();
        self.len -= removed;
        removed
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.overflow.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ent(pkt_num: u16, abs: u64) -> WheelEnt {
        WheelEnt {
            sess_num: 0,
            sslot_idx: 0,
            req_num: 0,
            pkt_num,
            abs_tx_tsc: abs,
        }
    }

    #[test]
    fn test_immediate_entries_reaped() {
        let mut wheel = TimingWheel::new(8, 4, 1000);
        wheel.insert(ent(0, 1000));
        wheel.insert(ent(1, 1001));

        let mut out = Vec::new();
        wheel.reap(1000, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].pkt_num, 0);
        assert_eq!(out[1].pkt_num, 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_future_entries_wait() {
        let mut wheel = TimingWheel::new(8, 4, 0);
        wheel.insert(ent(0, 100));

        let mut out = Vec::new();
        wheel.reap(50, &mut out);
        assert!(out.is_empty());

        wheel.reap(120, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_time_ordering() {
        let mut wheel = TimingWheel::new(16, 4, 0);
        // Insert in increasing-time order across distinct buckets; ties
        // within a bucket stay FIFO.
        for (i, t) in [(0u16, 10u64), (1, 12), (2, 40), (3, 80), (4, 81)] {
            wheel.insert(ent(i, t));
        }

        let mut out = Vec::new();
        wheel.reap(200, &mut out);
        let nums: Vec<u16> = out.iter().map(|e| e.pkt_num).collect();
        assert_eq!(nums, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_list() {
        let mut wheel = TimingWheel::new(4, 4, 0);
        // Horizon is 64 cycles; 1000 is far future.
        wheel.insert(ent(7, 1000));
        assert_eq!(wheel.len(), 1);

        let mut out = Vec::new();
        wheel.reap(500, &mut out);
        assert!(out.is_empty());

        wheel.reap(1100, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pkt_num, 7);
    }

    #[test]
    fn test_purge_session() {
        let mut wheel = TimingWheel::new(8, 4, 0);
        wheel.insert(WheelEnt {
            sess_num: 1,
            sslot_idx: 0,
            req_num: 0,
            pkt_num: 0,
            abs_tx_tsc: 20,
        });
        wheel.insert(WheelEnt {
            sess_num: 2,
            sslot_idx: 0,
            req_num: 0,
            pkt_num: 1,
            abs_tx_tsc: 30,
        });
        wheel.insert(WheelEnt {
            sess_num: 1,
            sslot_idx: 1,
            req_num: 0,
            pkt_num: 2,
            abs_tx_tsc: 10_000, // overflow list
        });

        assert_eq!(wheel.purge_session(1), 2);
        assert_eq!(wheel.len(), 1);

        let mut out = Vec::new();
        wheel.reap(100, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sess_num, 2);
    }

    #[test]
    fn test_overflow_warn_counts() {
        let mut wheel = TimingWheel::new(4, 4, 0);
        wheel.set_overflow_warn(2);
        wheel.insert(ent(0, 10_000));
        wheel.insert(ent(1, 10_000));
        wheel.insert(ent(2, 10_000));
        assert_eq!(wheel.overflow_events, 1);
    }
}
