//! Cycle-counter primitives shared by both sides of the boundary.
//!
//! Producers stamp entries with raw cycles; conversion to wall time happens
//! post-hoc using the cycles-per-microsecond value published by the region
//! owner. On x86_64 these are the RDTSC/RDTSCP instructions; elsewhere the
//! reads fall back to monotonic nanoseconds, which keeps the protocol intact
//! at reduced resolution.

use std::ptr;
use std::time::Duration;

use crate::layout::CPU_ID_UNKNOWN;

/// Plain (non-serializing) cycle read.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Serializing cycle read. Returns the cycle count and the IA32_TSC_AUX
/// word, whose low 12 bits Linux initializes to the logical CPU number.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtscp() -> (u64, u32) {
    let mut aux = 0u32;
    let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
    (tsc, aux & 0xfff)
}

/// Serialize the pipeline before a plain cycle read.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn cpu_serialize() {
    unsafe {
        core::arch::x86_64::__cpuid(0);
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    monotonic_ns()
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtscp() -> (u64, u32) {
    (monotonic_ns(), current_cpu())
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn cpu_serialize() {}

/// CLOCK_MONOTONIC in nanoseconds.
pub fn monotonic_ns() -> u64 {
    use nix::time::{clock_gettime, ClockId};
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64),
        Err(_) => 0,
    }
}

/// Logical CPU the calling thread runs on, or [`CPU_ID_UNKNOWN`].
///
/// Tries the raw `getcpu` syscall first, then the libc wrapper.
pub fn current_cpu() -> u32 {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_getcpu,
            &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint,
            ptr::null_mut::<libc::c_void>(),
        )
    };
    if rc == 0 {
        return cpu;
    }
    let rc = unsafe { libc::sched_getcpu() };
    if rc >= 0 {
        rc as u32
    } else {
        CPU_ID_UNKNOWN
    }
}

/// Convert raw cycles to microseconds. Returns 0 when the frequency is
/// unknown (uncalibrated).
#[inline]
pub fn to_micros(cycles: u64, cycles_per_us: u64) -> u64 {
    if cycles_per_us == 0 {
        return 0;
    }
    cycles / cycles_per_us
}

/// Convert raw cycles to nanoseconds. Returns 0 when the frequency is
/// unknown.
#[inline]
pub fn to_nanos(cycles: u64, cycles_per_us: u64) -> u64 {
    if cycles_per_us == 0 {
        return 0;
    }
    cycles.saturating_mul(1000) / cycles_per_us
}

/// Convert microseconds to raw cycles.
#[inline]
pub fn from_micros(us: u64, cycles_per_us: u64) -> u64 {
    us.saturating_mul(cycles_per_us)
}

/// Estimate cycles-per-microsecond without pinning, by sampling the counter
/// around a sleep. A client-side fallback for when the region owner reports
/// the frequency as not calibrated; never used to stamp entries.
pub fn estimate_cycles_per_us(interval: Duration) -> Option<u64> {
    cpu_serialize();
    let t0 = monotonic_ns();
    let c0 = rdtsc();
    std::thread::sleep(interval);
    let (c1, _) = rdtscp();
    let t1 = monotonic_ns();

    let elapsed_ns = t1.saturating_sub(t0);
    if elapsed_ns == 0 {
        return None;
    }
    Some(c1.saturating_sub(c0).saturating_mul(1000) / elapsed_ns)
}
