// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Idle strategies for duty-cycle loops and for callers spinning on a
// driver response. The backoff strategy escalates busy spin -> CPU pause ->
// thread yield -> park, and resets as soon as there is work.

use std::time::Duration;

/// What a loop does when a duty cycle produced no work.
pub trait IdleStrategy: Send {
    /// Idle after a duty cycle that did `work_count` units of work.
    fn idle_work(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
        } else {
            self.idle();
        }
    }

    /// Idle unconditionally.
    fn idle(&mut self);

    /// Back to the cheapest idle state.
    fn reset(&mut self);
}

impl<T: IdleStrategy + ?Sized> IdleStrategy for Box<T> {
    fn idle_work(&mut self, work_count: usize) {
        (**self).idle_work(work_count)
    }

    fn idle(&mut self) {
        (**self).idle()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Spin, then pause, then yield, then park for an escalating period.
#[derive(Debug, Clone)]
pub struct BackoffIdleStrategy {
    max_spins: u32,
    max_yields: u32,
    min_park: Duration,
    max_park: Duration,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl BackoffIdleStrategy {
    pub fn new(max_spins: u32, max_yields: u32, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(10, 20, Duration::from_micros(1), Duration::from_millis(1))
    }
}

impl IdleStrategy for BackoffIdleStrategy {
    fn idle(&mut self) {
        if self.spins < self.max_spins {
            if self.spins >= self.max_spins / 2 {
                std::hint::spin_loop();
            }
            self.spins += 1;
        } else if self.yields < self.max_yields {
            std::thread::yield_now();
            self.yields += 1;
        } else {
            std::thread::sleep(self.park);
            self.park = (self.park * 2).min(self.max_park);
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}

/// Always sleep for a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct SleepingIdleStrategy {
    period: Duration,
}

impl SleepingIdleStrategy {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl IdleStrategy for SleepingIdleStrategy {
    fn idle(&mut self) {
        std::thread::sleep(self.period);
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinIdleStrategy;

impl IdleStrategy for BusySpinIdleStrategy {
    fn idle(&mut self) {
        std::hint::spin_loop();
    }

    fn reset(&mut self) {}
}

/// Does nothing; for loops whose pacing comes from elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpIdleStrategy;

impl IdleStrategy for NoOpIdleStrategy {
    fn idle(&mut self) {}

    fn reset(&mut self) {}
}
