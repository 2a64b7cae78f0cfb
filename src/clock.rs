//! Wall-clock indirection.
//!
//! Every timestamp the scheduler writes or compares against (claim eligibility,
//! lifecycle stamps, cron due checks, heartbeats) is read through a [`Clock`],
//! so tests can pin or shift time without touching the system clock.

use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Source of the current UTC time.
pub trait Clock: Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that is either frozen at a fixed instant or runs at wall-clock
/// speed shifted by an offset. Meant for tests.
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockTime>>,
}

#[derive(Debug, Clone, Copy)]
enum MockTime {
    Fixed(DateTime<Utc>),
    Offset(Duration),
}

impl MockClock {
    /// A clock frozen at `at` until it is moved with [`MockClock::set`] or
    /// [`MockClock::advance`].
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockTime::Fixed(at))),
        }
    }

    /// A running clock shifted by `offset` from the system time.
    pub fn offset(offset: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockTime::Offset(offset))),
        }
    }

    /// Freeze the clock at `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.lock() = MockTime::Fixed(at);
    }

    /// Move the clock forward by `by`, whichever mode it is in.
    pub fn advance(&self, by: Duration) {
        let mut time = self.lock();
        *time = match *time {
            MockTime::Fixed(at) => MockTime::Fixed(at + by),
            MockTime::Offset(offset) => MockTime::Offset(offset + by),
        };
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTime> {
        // The guarded value is `Copy` and always valid, so a poisoned lock is harmless.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        match *self.lock() {
            MockTime::Fixed(at) => at,
            MockTime::Offset(offset) => Utc::now() + offset,
        }
    }
}
