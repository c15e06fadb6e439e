//! Clocks for the hot path.
//!
//! Every timestamp in the crate is a plain `u64` nanosecond count.
//! Dispatch loops, timers and the rate counters run on the monotonic
//! clock; the wall clock exists only for stamping messages that leave the
//! process and is never used for ordering inside the bus.

/// Nanosecond timestamp or duration.
pub type Nanos = u64;

pub const NANOS_PER_MICRO: Nanos = 1_000;
pub const NANOS_PER_MILLI: Nanos = 1_000_000;
pub const NANOS_PER_SEC: Nanos = 1_000_000_000;

#[cfg(unix)]
fn clock_ns(clock: libc::clockid_t) -> Nanos {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    ts.tv_sec as Nanos * NANOS_PER_SEC + ts.tv_nsec as Nanos
}

/// Monotonic timestamp in ns. The epoch is arbitrary; only differences
/// are meaningful, and they never go backwards.
#[cfg(unix)]
#[inline(never)]
pub fn mono_time_ns() -> Nanos {
    clock_ns(libc::CLOCK_MONOTONIC)
}

/// Wall-clock timestamp in ns since the Unix epoch. Subject to clock
/// adjustments.
#[cfg(unix)]
#[inline(never)]
pub fn wall_time_ns() -> Nanos {
    clock_ns(libc::CLOCK_REALTIME)
}

/// Spins until the monotonic clock reaches `deadline_ns`; returns the
/// timestamp observed on exit.
///
/// For pacing producers at sub-scheduler resolutions. Burns the core; do
/// not call from non-critical threads.
#[cfg(unix)]
#[inline(always)]
pub fn busy_wait_until(deadline_ns: Nanos) -> Nanos {
    loop {
        let now = mono_time_ns();
        if now >= deadline_ns {
            return now;
        }
        core::hint::spin_loop();
    }
}
