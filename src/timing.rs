//! TSC sampling and conversion.
//!
//! All datapath timers use the CPU cycle counter as their time base; it is
//! sampled once per event-loop iteration and compared against thresholds
//! pre-converted to cycles.

use std::time::{Duration, Instant};

/// Read the cycle counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the cycle-counter frequency in GHz.
///
/// One-shot calibration against the monotonic clock; called once at Nexus
/// creation and shared by every endpoint in the process.
pub fn measure_freq_ghz() -> f64 {
    let start_tsc = rdtsc();
    let start = Instant::now();
    std::thread::sleep(Duration::from_millis(10));
    let cycles = rdtsc().wrapping_sub(start_tsc);
    let nanos = start.elapsed().as_nanos() as f64;
    (cycles as f64 / nanos).max(0.1)
}

#[inline]
pub fn us_to_cycles(us: u64, freq_ghz: f64) -> u64 {
    (us as f64 * freq_ghz * 1000.0) as u64
}

#[inline]
pub fn ms_to_cycles(ms: u64, freq_ghz: f64) -> u64 {
    us_to_cycles(ms * 1000, freq_ghz)
}

#[inline]
pub fn cycles_to_us(cycles: u64, freq_ghz: f64) -> u64 {
    (cycles as f64 / (freq_ghz * 1000.0)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_freq_sane() {
        let ghz = measure_freq_ghz();
        // Anything from an emulator to a fast server core.
        assert!(ghz > 0.1 && ghz < 10.0, "freq {ghz} GHz out of range");
    }

    #[test]
    fn test_conversions() {
        let ghz = 2.0;
        assert_eq!(us_to_cycles(1, ghz), 2000);
        assert_eq!(ms_to_cycles(1, ghz), 2_000_000);
        assert_eq!(cycles_to_us(2000, ghz), 1);
    }
}
