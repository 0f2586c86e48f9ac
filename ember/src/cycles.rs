/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Cycle-granular timekeeping.
//!
//! All deadlines and run-time accounting in the runtime are expressed in
//! processor cycles. The counter is read straight off the time-stamp counter
//! (`rdtsc` on x86_64, `cntvct_el0` on aarch64), and converted to wall-clock
//! units through a process-wide frequency detected once at startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::debug;

/// Cycles-per-second for this process. Zero until detection or calibration.
static FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);

/// Reads the current value of the processor's time-stamp counter.
///
/// Safe to call from a signal handler; this is a single unprivileged
/// instruction on both supported architectures.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn now() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads the current value of the generic virtual counter.
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn now() -> u64 {
    let value: u64;
    unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) value, options(nomem, nostack)) };
    value
}

/// Detects the counter frequency from the platform.
///
/// On x86_64 this is the nominal `cpu MHz` entry of the first core in
/// `/proc/cpuinfo`; all cores are assumed to run at the same speed and the
/// time-stamp counter is assumed invariant at that rate. On aarch64 the
/// architecture reports the counter frequency directly in `cntfrq_el0`.
///
/// # Return
///
/// The frequency in Hz, or `None` if the platform did not report one.
#[cfg(target_arch = "x86_64")]
fn detect() -> Option<u64> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("cpu MHz") {
            let mhz: f64 = rest.split(':').nth(1)?.trim().parse().ok()?;
            if mhz <= 0.0 {
                return None;
            }
            return Some((mhz * 1_000_000.0) as u64);
        }
    }
    None
}

#[cfg(target_arch = "aarch64")]
fn detect() -> Option<u64> {
    let value: u64;
    unsafe { core::arch::asm!("mrs {}, cntfrq_el0", out(reg) value, options(nomem, nostack)) };
    if value == 0 {
        return None;
    }
    Some(value)
}

/// Detects and records the counter frequency.
///
/// # Return
///
/// The frequency in Hz, or `None` if detection failed. Callers that cannot
/// proceed without a frequency should treat `None` as fatal.
pub fn init() -> Option<u64> {
    let hz = detect()?;
    FREQUENCY_HZ.store(hz, Ordering::Relaxed);
    debug!("cycle counter running at {} Hz", hz);
    Some(hz)
}

/// Measures the counter frequency against the monotonic clock.
///
/// Used by embedders and tests on hosts where the platform does not report a
/// frequency. Spins for roughly 50 milliseconds. If a frequency has already
/// been recorded, that one wins and the measurement is discarded.
pub fn calibrate() -> u64 {
    let existing = FREQUENCY_HZ.load(Ordering::Relaxed);
    if existing != 0 {
        return existing;
    }

    let wall_start = Instant::now();
    let cycle_start = now();
    while wall_start.elapsed() < Duration::from_millis(50) {
        std::hint::spin_loop();
    }
    let elapsed_cycles = now().wrapping_sub(cycle_start);
    let elapsed = wall_start.elapsed();
    let hz = ((elapsed_cycles as f64) / elapsed.as_secs_f64()) as u64;

    match FREQUENCY_HZ.compare_exchange(0, hz, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(_) => {
            debug!("cycle counter calibrated at {} Hz", hz);
            hz
        }
        // Another thread beat us to it.
        Err(existing) => existing,
    }
}

/// Records a frequency by any means available: platform detection first,
/// wall-clock calibration as a fallback.
pub fn ensure() -> u64 {
    let existing = FREQUENCY_HZ.load(Ordering::Relaxed);
    if existing != 0 {
        return existing;
    }
    match init() {
        Some(hz) => hz,
        None => calibrate(),
    }
}

/// The recorded counter frequency in Hz. Panics if neither `init()` nor
/// `calibrate()` has run.
#[inline]
pub fn frequency_hz() -> u64 {
    let hz = FREQUENCY_HZ.load(Ordering::Relaxed);
    assert!(hz != 0, "cycle counter frequency has not been recorded");
    hz
}

/// Cycles per microsecond, never less than one.
#[inline]
pub fn per_usec() -> u64 {
    (frequency_hz() / 1_000_000).max(1)
}

/// Converts a duration in microseconds to cycles.
#[inline]
pub fn usec_to_cycles(usec: u64) -> u64 {
    usec * per_usec()
}

/// Converts a cycle count to microseconds.
#[inline]
pub fn to_usec(cycles: u64) -> u64 {
    cycles / per_usec()
}

/// Converts a cycle count to seconds.
#[inline]
pub fn to_seconds(cycles: u64) -> f64 {
    cycles as f64 / frequency_hz() as f64
}

/// A sampling cycle counter for hot paths.
///
/// Accumulates elapsed cycles across `start()`/`stop()` pairs and emits one
/// debug line per `measurement_count` samples, so the log cost stays off the
/// fast path.
pub struct CycleCounter {
    label: &'static str,
    total: u64,
    start_time: u64,
    run_count: u64,
    measurement_count: u64,
}

impl CycleCounter {
    pub fn new(label: &'static str, measurement_count: u64) -> CycleCounter {
        CycleCounter {
            label,
            total: 0,
            start_time: 0,
            run_count: 0,
            measurement_count: measurement_count.max(1),
        }
    }

    #[inline]
    pub fn start(&mut self) {
        self.start_time = now();
    }

    /// Stops the current sample.
    ///
    /// # Return
    ///
    /// The number of cycles elapsed since the matching `start()`.
    pub fn stop(&mut self) -> u64 {
        let elapsed = now().wrapping_sub(self.start_time);
        self.total += elapsed;
        self.run_count += 1;
        if self.run_count == self.measurement_count {
            debug!(
                "{}: {:.2} us/op over {} ops",
                self.label,
                to_seconds(self.total / self.run_count) * 1e6,
                self.run_count
            );
            self.run_count = 0;
            self.total = 0;
        }
        elapsed
    }

    /// Mean cycles per sample in the current measurement window.
    pub fn average(&self) -> u64 {
        if self.run_count == 0 {
            return 0;
        }
        self.total / self.run_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic_enough() {
        let first = now();
        let second = now();
        assert!(second >= first);
    }

    #[test]
    fn calibration_produces_a_sane_frequency() {
        let hz = ensure();
        // Anything from an embedded 1 MHz generic timer to a 10 GHz core.
        assert!(hz > 1_000_000, "frequency {} too low", hz);
        assert!(hz < 10_000_000_000, "frequency {} too high", hz);
        assert!(per_usec() >= 1);
    }

    #[test]
    fn unit_conversions_round_trip() {
        ensure();
        let cycles = usec_to_cycles(1_000);
        let usec = to_usec(cycles);
        assert!((900..=1_100).contains(&usec), "1000us became {}us", usec);
    }

    #[test]
    fn cycle_counter_averages() {
        ensure();
        let mut counter = CycleCounter::new("test", 1_000_000);
        counter.start();
        std::thread::sleep(Duration::from_millis(1));
        let elapsed = counter.stop();
        assert!(elapsed > 0);
        assert_eq!(counter.average(), elapsed);
    }
}
