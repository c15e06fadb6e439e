//! Sliding-window rate counting and two-mode burst governance.
//!
//! [`RingCounter`] counts events over a rolling window of `B` discrete
//! buckets; [`BurstControl`] layers a mode machine on top: admit up to a
//! limit per window, then reject everything for a cooldown window until
//! traffic has died down.

use crate::time::Nanos;

/// Fixed-window event counter over `B` buckets.
///
/// The window is divided into `B` slices of `ceil(window / B)` ns each
/// (never less than 1 ns). Advancing time lazily clears aged buckets, so
/// the total always reflects the trailing window only.
#[derive(Debug)]
pub struct RingCounter<const B: usize> {
    buckets: [u64; B],
    limit: u64,
    resolution: Nanos,
    last_tick: u64,
    total: u64,
}

impl<const B: usize> RingCounter<B> {
    /// `window` is the rolling window length in ns; `limit` the number of
    /// admitted events per window.
    pub fn new(window: Nanos, limit: u64) -> Self {
        assert!(B > 0, "at least one bucket is required");
        Self {
            buckets: [0; B],
            limit,
            resolution: ((window + B as u64 - 1) / B as u64).max(1),
            last_tick: 0,
            total: 0,
        }
    }

    #[inline(always)]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline(always)]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[inline(always)]
    pub fn resolution(&self) -> Nanos {
        self.resolution
    }

    /// True when `t` is too old to be represented: more than `B`
    /// resolutions behind the last observed tick.
    #[inline(always)]
    pub fn is_stale(&self, t: Nanos) -> bool {
        let tick = t / self.resolution;
        tick < self.last_tick && self.last_tick - tick >= B as u64
    }

    /// Advances the window to `t`, clearing buckets that aged out. Past
    /// timestamps within the window leave the head untouched.
    fn roll_to(&mut self, t: Nanos) {
        let tick = t / self.resolution;
        if tick <= self.last_tick {
            return;
        }
        let diff = tick - self.last_tick;
        if diff >= B as u64 {
            self.buckets = [0; B];
            self.total = 0;
        } else {
            for i in 1..=diff {
                let idx = ((self.last_tick + i) % B as u64) as usize;
                self.total -= self.buckets[idx];
                self.buckets[idx] = 0;
            }
        }
        self.last_tick = tick;
    }

    /// Counts an event at `t` regardless of the limit. Stale timestamps
    /// are dropped. Returns whether the event was counted.
    pub fn observe(&mut self, t: Nanos) -> bool {
        if self.is_stale(t) {
            return false;
        }
        self.roll_to(t);
        let idx = ((t / self.resolution) % B as u64) as usize;
        self.buckets[idx] += 1;
        self.total += 1;
        true
    }

    /// Admits an event at `t` if the window total is below the limit.
    ///
    /// Returns `false` both for a rejected event (limit reached) and for a
    /// stale timestamp; stale timestamps do not advance the window. A past
    /// timestamp within the window is credited to its own bucket.
    pub fn increment(&mut self, t: Nanos) -> bool {
        if self.is_stale(t) {
            return false;
        }
        self.roll_to(t);
        if self.total >= self.limit {
            return false;
        }
        let idx = ((t / self.resolution) % B as u64) as usize;
        self.buckets[idx] += 1;
        self.total += 1;
        true
    }

    /// Rolls the window forward to `t` and returns the surviving total.
    pub fn total_at(&mut self, t: Nanos) -> u64 {
        self.roll_to(t);
        self.total
    }

    pub fn clear(&mut self) {
        self.buckets = [0; B];
        self.total = 0;
        self.last_tick = 0;
    }

    #[cfg(test)]
    fn bucket_sum(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Cooldown,
}

/// Snapshot of a burst controller.
#[derive(Debug, Clone, Copy)]
pub struct BurstState {
    pub mode: Mode,
    /// Entry time of the current cooldown; 0 in normal mode.
    pub cooldown_start: Nanos,
    /// Window total of the active counter.
    pub total: u64,
}

/// Two-mode burst governor.
///
/// In normal mode events are admitted until the heatup window fills; the
/// breaching event flips the controller into cooldown, where every event
/// is rejected but still counted. Cooldown ends on the first evaluation
/// that is at least a cooldown window past entry with the cooldown
/// window's total at or below its limit; that event is admitted into a
/// fresh normal window.
#[derive(Debug)]
pub struct BurstControl<const B: usize> {
    heatup: RingCounter<B>,
    cooldown: RingCounter<B>,
    cooldown_window: Nanos,
    mode: Mode,
    cooldown_start: Nanos,
}

impl<const B: usize> BurstControl<B> {
    pub fn new(
        heatup_window: Nanos,
        heatup_limit: u64,
        cooldown_window: Nanos,
        cooldown_limit: u64,
    ) -> Self {
        Self {
            heatup: RingCounter::new(heatup_window, heatup_limit),
            cooldown: RingCounter::new(cooldown_window, cooldown_limit),
            cooldown_window,
            mode: Mode::Normal,
            cooldown_start: 0,
        }
    }

    pub fn state(&self) -> BurstState {
        match self.mode {
            Mode::Normal => BurstState {
                mode: Mode::Normal,
                cooldown_start: 0,
                total: self.heatup.total(),
            },
            Mode::Cooldown => BurstState {
                mode: Mode::Cooldown,
                cooldown_start: self.cooldown_start,
                total: self.cooldown.total(),
            },
        }
    }

    /// Evaluates one event at `t`; returns whether it is admitted.
    pub fn evaluate(&mut self, t: Nanos) -> bool {
        match self.mode {
            Mode::Normal => {
                if self.heatup.is_stale(t) {
                    // Too old to attribute; dropped without a mode change.
                    return false;
                }
                if self.heatup.increment(t) {
                    return true;
                }
                // Heatup limit breached: enter cooldown, count the
                // breaching event into the fresh cooldown window.
                self.mode = Mode::Cooldown;
                self.cooldown_start = t;
                self.heatup.clear();
                self.cooldown.clear();
                self.cooldown.observe(t);
                false
            }
            Mode::Cooldown => {
                if t >= self.cooldown_start + self.cooldown_window
                    && self.cooldown.total_at(t) <= self.cooldown.limit()
                {
                    // Quiet long enough: back to normal, admitting this
                    // event into an empty heatup window.
                    self.mode = Mode::Normal;
                    self.cooldown_start = 0;
                    self.heatup.clear();
                    self.cooldown.clear();
                    self.heatup.increment(t);
                    return true;
                }
                self.cooldown.observe(t);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NANOS_PER_MILLI;

    #[test]
    fn resolution_is_ceiling_with_floor_one() {
        let c: RingCounter<16> = RingCounter::new(100, 1);
        assert_eq!(c.resolution(), 7); // ceil(100 / 16)
        let c: RingCounter<16> = RingCounter::new(8, 1);
        assert_eq!(c.resolution(), 1); // floored at 1
        let c: RingCounter<4> = RingCounter::new(100 * NANOS_PER_MILLI, 10);
        assert_eq!(c.resolution(), 25 * NANOS_PER_MILLI);
    }

    #[test]
    fn total_matches_bucket_sum_after_every_increment() {
        let mut c: RingCounter<8> = RingCounter::new(800, 1000);
        for t in (0..4000u64).step_by(37) {
            c.increment(t);
            assert_eq!(c.total(), c.bucket_sum());
        }
    }

    #[test]
    fn limit_gates_admission_within_window() {
        let limit = 5;
        let mut c: RingCounter<16> = RingCounter::new(100 * NANOS_PER_MILLI, limit);
        // All timestamps inside one window: exactly `limit` admissions.
        for i in 0..10u64 {
            let admitted = c.increment(i * NANOS_PER_MILLI);
            assert_eq!(admitted, i < limit, "event {}", i);
        }
        assert_eq!(c.total(), limit);
    }

    #[test]
    fn window_roll_frees_capacity() {
        let mut c: RingCounter<10> = RingCounter::new(100, 2);
        assert!(c.increment(0));
        assert!(c.increment(1));
        assert!(!c.increment(2));

        // One full window later everything has aged out.
        assert!(c.increment(200));
        assert_eq!(c.total(), 1);
    }

    #[test]
    fn partial_roll_clears_only_aged_buckets() {
        let mut c: RingCounter<10> = RingCounter::new(100, 100);
        // One event per bucket across the window.
        for t in (0..100u64).step_by(10) {
            assert!(c.increment(t));
        }
        assert_eq!(c.total(), 10);

        // Half a window later the ticks that advanced past the head have
        // reclaimed their buckets: ticks 10..15 land on the buckets that
        // held t = 0..59, leaving the events at t = 60..99.
        assert_eq!(c.total_at(150), 4);
        assert_eq!(c.total(), c.bucket_sum());
    }

    #[test]
    fn stale_timestamps_are_dropped() {
        let mut c: RingCounter<10> = RingCounter::new(100, 100);
        assert!(c.increment(5_000));
        // More than B resolutions in the past: dropped, window unmoved.
        assert!(!c.increment(3_000));
        assert_eq!(c.total(), 1);

        // Within the window: credited without advancing the head.
        assert!(c.increment(4_950));
        assert_eq!(c.total(), 2);
        // The head did not move backwards: a fresh event at the head tick
        // still lands in the newest bucket.
        assert!(c.increment(5_001));
        assert_eq!(c.total(), 3);
    }

    #[test]
    fn burst_lifecycle() {
        // Heatup: 100 ms window, 5 events. Cooldown: 100 ms window, 2.
        let mut bc: BurstControl<16> = BurstControl::new(
            100 * NANOS_PER_MILLI,
            5,
            100 * NANOS_PER_MILLI,
            2,
        );

        // Five admissions at t = 0..4 ms.
        for i in 0..5u64 {
            assert!(bc.evaluate(i * NANOS_PER_MILLI), "event {}", i);
        }
        assert_eq!(bc.state().mode, Mode::Normal);
        assert_eq!(bc.state().total, 5);

        // The sixth call breaches and enters cooldown.
        assert!(!bc.evaluate(5 * NANOS_PER_MILLI));
        assert_eq!(bc.state().mode, Mode::Cooldown);
        assert_eq!(bc.state().cooldown_start, 5 * NANOS_PER_MILLI);

        // Still rejected halfway through the cooldown window.
        assert!(!bc.evaluate(55 * NANOS_PER_MILLI));
        assert!(!bc.evaluate(104 * NANOS_PER_MILLI));
        assert_eq!(bc.state().mode, Mode::Cooldown);

        // Past the window the early events have aged out of the cooldown
        // counter; the total (events at 55 ms and 104 ms) is within the
        // exit limit, so this call is admitted into a fresh normal window.
        assert!(bc.evaluate(110 * NANOS_PER_MILLI));
        assert_eq!(bc.state().mode, Mode::Normal);
        assert_eq!(bc.state().total, 1);
    }

    #[test]
    fn cooldown_persists_while_traffic_continues() {
        let mut bc: BurstControl<16> =
            BurstControl::new(100 * NANOS_PER_MILLI, 2, 100 * NANOS_PER_MILLI, 1);

        assert!(bc.evaluate(0));
        assert!(bc.evaluate(0));
        assert!(!bc.evaluate(NANOS_PER_MILLI)); // enters cooldown

        // Sustained traffic keeps the cooldown total above its limit, so
        // even calls past the window stay rejected.
        let mut t = 2 * NANOS_PER_MILLI;
        for _ in 0..40 {
            assert!(!bc.evaluate(t));
            t += 10 * NANOS_PER_MILLI;
        }
        assert_eq!(bc.state().mode, Mode::Cooldown);
    }

    #[test]
    fn no_admission_before_cooldown_window_elapses() {
        let mut bc: BurstControl<16> =
            BurstControl::new(10 * NANOS_PER_MILLI, 1, 100 * NANOS_PER_MILLI, 100);

        let t0 = 7 * NANOS_PER_MILLI;
        assert!(bc.evaluate(t0));
        assert!(!bc.evaluate(t0 + 1)); // breach, cooldown entered
        let start = bc.state().cooldown_start;
        assert_eq!(start, t0 + 1);

        // Generous exit limit: only the elapsed-window condition gates.
        assert!(!bc.evaluate(start + 99 * NANOS_PER_MILLI));
        assert!(bc.evaluate(start + 100 * NANOS_PER_MILLI));
        assert_eq!(bc.state().mode, Mode::Normal);
    }
}
