//! One-shot cycle-counter calibration.
//!
//! Runs once at startup: pin to the current CPU so the two counter samples
//! come from the same core, bracket a sleep with a serialized read on each
//! side, and derive cycles-per-microsecond with 64-bit division. Producers
//! never need the result; it exists so consumers can convert raw cycles to
//! time after the fact.

use std::time::Duration;

use hires_common::cycles;
use hires_common::layout::CPU_ID_UNKNOWN;
use log::{debug, warn};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use thiserror::Error;

/// Default measurement interval.
pub const DEFAULT_CALIBRATION_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("non-positive elapsed interval during calibration")]
    NonPositiveInterval,
}

/// Pin the calling thread to one CPU for the duration of `f`.
///
/// Best effort: in restricted environments affinity calls can fail, in
/// which case the measurement proceeds unpinned with a warning. A migration
/// mid-measurement surfaces as a bogus delta and is caught by the elapsed
/// check.
fn pinned<T>(f: impl FnOnce() -> T) -> T {
    let pid = Pid::from_raw(0);
    let cpu = cycles::current_cpu();
    if cpu == CPU_ID_UNKNOWN {
        warn!("calibration: current CPU unknown, measuring unpinned");
        return f();
    }

    let saved = match sched_getaffinity(pid) {
        Ok(set) => set,
        Err(err) => {
            warn!("calibration: sched_getaffinity failed ({err}), measuring unpinned");
            return f();
        }
    };
    let mut target = CpuSet::new();
    if target.set(cpu as usize).is_err() || sched_setaffinity(pid, &target).is_err() {
        warn!("calibration: could not pin to cpu {cpu}, measuring unpinned");
        return f();
    }

    let out = f();

    if let Err(err) = sched_setaffinity(pid, &saved) {
        warn!("calibration: failed to restore affinity mask: {err}");
    }
    out
}

/// Measure cycles-per-microsecond over `interval`.
///
/// On a non-positive elapsed interval the caller is expected to publish
/// zero and fail later frequency queries; logging keeps working on raw
/// cycles either way.
pub fn calibrate_cycles_per_us(interval: Duration) -> Result<u64, CalibrationError> {
    let (t0, c0) = pinned(|| {
        cycles::cpu_serialize();
        (cycles::monotonic_ns(), cycles::rdtsc())
    });

    // Migration during the sleep is fine; only the samples must be pinned.
    std::thread::sleep(interval);

    let (c1, t1) = pinned(|| {
        let (c1, _) = cycles::rdtscp();
        (c1, cycles::monotonic_ns())
    });

    let elapsed_ns = t1.saturating_sub(t0);
    if elapsed_ns == 0 || c1 <= c0 {
        return Err(CalibrationError::NonPositiveInterval);
    }

    let cycles_per_us = (c1 - c0).saturating_mul(1000) / elapsed_ns;
    debug!(
        "calibration: {} cycles over {} ns -> {} cycles/us",
        c1 - c0,
        elapsed_ns,
        cycles_per_us
    );
    Ok(cycles_per_us)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_finds_a_plausible_frequency() {
        let cycles_per_us = calibrate_cycles_per_us(Duration::from_millis(50)).unwrap();
        // Anything from a slow VM clock to a 10 GHz part.
        assert!(cycles_per_us > 0);
        assert!(cycles_per_us < 20_000);
    }

    #[test]
    fn repeated_calibrations_roughly_agree() {
        let a = calibrate_cycles_per_us(Duration::from_millis(40)).unwrap();
        let b = calibrate_cycles_per_us(Duration::from_millis(40)).unwrap();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        // 25% slack absorbs scheduler noise on loaded hosts.
        assert!(hi - lo <= hi / 4 + 1, "calibrations diverged: {a} vs {b}");
    }
}
