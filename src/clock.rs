// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Monotonic and wall clocks used by the conductor's liveness checks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond clock.
pub trait NanoClock: Send + Sync {
    fn nano_time(&self) -> i64;
}

/// Milliseconds since the Unix epoch.
pub trait EpochClock: Send + Sync {
    fn time(&self) -> i64;
}

/// True while `now` has not passed `since + interval`. Saturates, so an
/// interval of `i64::MAX` never elapses.
pub fn elapsed_before(since: i64, interval: i64, now: i64) -> bool {
    since.saturating_add(interval).saturating_sub(now) >= 0
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNanoClock;

impl NanoClock for SystemNanoClock {
    fn nano_time(&self) -> i64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as i64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Serves as both nano and epoch
/// clock; the epoch reading is the nano reading in milliseconds.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ns: i64) -> Self {
        Self {
            nanos: AtomicI64::new(start_ns),
        }
    }

    pub fn advance_ns(&self, delta: i64) {
        self.nanos.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn advance_ms(&self, delta: i64) {
        self.advance_ns(delta * 1_000_000);
    }
}

impl NanoClock for ManualClock {
    fn nano_time(&self) -> i64 {
        self.nanos.load(Ordering::Acquire)
    }
}

impl EpochClock for ManualClock {
    fn time(&self) -> i64 {
        self.nanos.load(Ordering::Acquire) / 1_000_000
    }
}
