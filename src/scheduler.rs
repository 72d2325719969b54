use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushDecision {
    /// Flush the cache right away.
    Now,
    /// A single deferred flush is armed for this deadline.
    Deferred(Instant),
}

/// Debounce-with-rate-cap policy over one shared deferred timer.
///
/// The scheduler only tracks deadlines; the pipeline actor waits on
/// [`FlushScheduler::deadline`] and calls [`FlushScheduler::fire`] when it
/// passes. Because the actor re-reads the deadline on every loop iteration,
/// cancelling or re-arming takes effect before any older deadline can fire.
#[derive(Debug)]
pub struct FlushScheduler {
    interval: Duration,
    last_flush_at: Option<Instant>,
    deferred: Option<Instant>,
}

impl FlushScheduler {
    pub fn new(interval: Duration) -> Self {
        FlushScheduler {
            interval,
            last_flush_at: None,
            deferred: None,
        }
    }

    /// Called after every cache upsert.
    pub fn on_upsert(&mut self, now: Instant) -> FlushDecision {
        let quiet = self
            .last_flush_at
            .is_none_or(|last| now.duration_since(last) > self.interval);

        if quiet {
            self.deferred = None;
            self.last_flush_at = Some(now);
            FlushDecision::Now
        } else {
            let deadline = now + self.interval;
            self.deferred = Some(deadline);
            FlushDecision::Deferred(deadline)
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deferred
    }

    /// Consumes the deferred flush if it is due. Only immediate flushes move
    /// the window anchor.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deferred {
            Some(deadline) if deadline <= now => {
                self.deferred = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deferred = None;
    }
}
