//! Blocking readiness wait for socket caller threads.
//!
//! A caller [arms](ReadinessWaiter::arm) the readiness it is interested in, asks the flow context
//! to watch the flow, then [waits](ReadinessWaiter::wait). The context thread calls
//! [`signal`](ReadinessWaiter::signal) which only flips atomics and notifies, it never blocks and
//! never takes a lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use event_listener::{Event, Listener};

use crate::flow::Readiness;

/// Outcome of [`ReadinessWaiter::wait`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitOutcome {
    /// Some of the requested readiness was posted. The condition may be gone already, callers
    /// retry their operation instead of trusting it.
    Ready(Readiness),
    TimedOut,
}

#[derive(Debug, Default)]
pub struct ReadinessWaiter {
    armed: AtomicU8,
    posted: AtomicU8,
    event: Event,
}

impl ReadinessWaiter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register interest in `interest`, only armed readiness is posted by [`signal`](Self::signal).
    ///
    /// Stale posted readiness in `interest` is dropped, a sticky [`Readiness::ERROR`] is kept.
    pub fn arm(&self, interest: Readiness) {
        let stale = interest.without(Readiness::ERROR).bits();
        self.posted.fetch_and(!stale, Ordering::AcqRel);
        self.armed.fetch_or(interest.bits(), Ordering::AcqRel);
    }

    pub fn disarm(&self, interest: Readiness) {
        self.armed.fetch_and(!interest.bits(), Ordering::AcqRel);
    }

    pub fn armed(&self) -> Readiness {
        Readiness::from_bits(self.armed.load(Ordering::Acquire))
    }

    /// Post `events` and wake waiters whose interest intersects them.
    ///
    /// Returns false when nobody armed any of `events`. Fired interest is disarmed, a caller arms
    /// again for the next readiness transition.
    pub fn signal(&self, events: Readiness) -> bool {
        let hit = self.armed.fetch_and(!events.bits(), Ordering::AcqRel) & events.bits();
        if hit == 0 {
            return false;
        }

        self.posted.fetch_or(hit, Ordering::AcqRel);
        self.event.notify(usize::MAX);

        true
    }

    /// Post a sticky [`Readiness::ERROR`] regardless of armed interest.
    ///
    /// Used when the flow fails or goes away, every current and future wait returns at once.
    pub fn interrupt(&self) {
        self.posted
            .fetch_or(Readiness::ERROR.bits(), Ordering::AcqRel);
        self.event.notify(usize::MAX);
    }

    /// Block until readiness intersecting `interest` is posted or `timeout` elapses.
    ///
    /// `None` waits forever, a zero timeout only checks what is already posted.
    pub fn wait(&self, interest: Readiness, timeout: Option<Duration>) -> WaitOutcome {
        if let Some(ready) = self.take(interest) {
            return WaitOutcome::Ready(ready);
        }

        let deadline = match timeout {
            Some(Duration::ZERO) => return WaitOutcome::TimedOut,
            Some(timeout) => Instant::now().checked_add(timeout),
            None => None,
        };

        loop {
            let listener = self.event.listen();

            // signal may land between the first check and listen
            if let Some(ready) = self.take(interest) {
                return WaitOutcome::Ready(ready);
            }

            match deadline {
                None => listener.wait(),
                Some(deadline) => {
                    if listener.wait_deadline(deadline).is_none() {
                        return match self.take(interest) {
                            Some(ready) => WaitOutcome::Ready(ready),
                            None => WaitOutcome::TimedOut,
                        };
                    }
                }
            }

            if let Some(ready) = self.take(interest) {
                return WaitOutcome::Ready(ready);
            }
        }
    }

    /// Consume posted readiness in `interest`, [`Readiness::ERROR`] stays posted.
    fn take(&self, interest: Readiness) -> Option<Readiness> {
        let posted = self.posted.load(Ordering::Acquire) & interest.bits();
        if posted == 0 {
            return None;
        }

        let consumed = posted & !Readiness::ERROR.bits();
        self.posted.fetch_and(!consumed, Ordering::AcqRel);

        Some(Readiness::from_bits(posted))
    }
}
