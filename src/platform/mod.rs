// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The platform port: the small set of primitives a host environment must
//! supply so the pipeline core and its timers can run without depending on
//! a particular OS or async runtime. A [`SystemPlatform`] backed by
//! `std::time`/`std::thread`/`std::sync` is provided for production use;
//! tests substitute a fake that advances time and entropy deterministically.

use rand::Rng;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Monotonic clock, sleep, randomness, and one-shot timer scheduling, as
/// required by the timer facility and the example reconnect policy's
/// jittered backoff.
pub trait Platform: Send + Sync {
    /// Milliseconds since an arbitrary but fixed epoch, monotonically
    /// non-decreasing for the lifetime of the process.
    fn clock_msec(&self) -> i64;

    /// Blocks the calling thread for at least `millis` milliseconds.
    fn sleep_msec(&self, millis: u32);

    /// Returns a value suitable for jitter/backoff use. Not required to be
    /// cryptographically secure.
    fn get_random(&self) -> i32;
}

/// Production [`Platform`] implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

impl SystemPlatform {
    /// Builds a new [`SystemPlatform`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// A fixed reference point set on first use, so `clock_msec` can report
/// elapsed milliseconds from `Instant`'s monotonic clock rather than
/// `SystemTime`'s wall clock, which can jump backward under NTP adjustment.
fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

impl Platform for SystemPlatform {
    fn clock_msec(&self) -> i64 {
        i64::try_from(process_start().elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn sleep_msec(&self, millis: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(millis)));
    }

    fn get_random(&self) -> i32 {
        rand::thread_rng().gen_range(1..=i32::MAX)
    }
}

/// Returns an [`Instant`] `millis` milliseconds in the future. Kept
/// separate from the [`Platform`] trait because timer deadlines need
/// `Instant`'s monotonic, panic-free arithmetic, not the portable clock.
pub(crate) fn deadline_from_now(millis: u32) -> Instant {
    Instant::now() + Duration::from_millis(u64::from(millis))
}

#[cfg(test)]
pub(crate) mod fake {
    //! A deterministic [`Platform`] for tests, grounded in the precondition
    //! and determinism requirements exercised by the reference platform
    //! test suite (monotonic clock, non-zero random).

    use super::Platform;
    use std::sync::atomic::{AtomicI64, Ordering};

    pub struct FakePlatform {
        clock: AtomicI64,
        next_random: AtomicI64,
    }

    impl FakePlatform {
        pub fn new() -> Self {
            Self {
                clock: AtomicI64::new(0),
                next_random: AtomicI64::new(1),
            }
        }

        pub fn advance(&self, millis: i64) {
            self.clock.fetch_add(millis, Ordering::SeqCst);
        }

        pub fn set_next_random(&self, value: i32) {
            self.next_random.store(i64::from(value), Ordering::SeqCst);
        }
    }

    impl Platform for FakePlatform {
        fn clock_msec(&self) -> i64 {
            self.clock.load(Ordering::SeqCst)
        }

        fn sleep_msec(&self, millis: u32) {
            self.advance(i64::from(millis));
        }

        fn get_random(&self) -> i32 {
            self.next_random.load(Ordering::SeqCst) as i32
        }
    }
}
