// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic clock, anchored once per process.
//!
//! Token TTLs, fiber timers, and blocking-op deadlines all read the same
//! source, so a deadline computed before a suspension stays comparable
//! after it.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process. Monotonic.
#[inline]
pub fn monotonic_ns() -> u64 {
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Milliseconds since the first call in this process.
#[inline]
pub fn monotonic_ms() -> u64 {
    monotonic_ns() / 1_000_000
}

/// Absolute deadline `ms` milliseconds from now, in clock nanoseconds.
#[inline]
pub fn deadline_after_ms(ms: u64) -> u64 {
    monotonic_ns().saturating_add(ms.saturating_mul(1_000_000))
}

/// Remaining time until `deadline_ns`, or `None` when it already passed.
#[inline]
pub fn until(deadline_ns: u64) -> Option<Duration> {
    let now = monotonic_ns();
    if now >= deadline_ns {
        None
    } else {
        Some(Duration::from_nanos(deadline_ns - now))
    }
}
