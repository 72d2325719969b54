use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Disarmed,
    /// Scanning; the scan source is stopped when the deadline passes.
    Waiting(Instant),
    /// Stopped; the scan source is started again when the deadline passes.
    Settling(Instant),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogAction {
    StopScan,
    StartScan,
}

/// Periodically cycles the scan source to stay under the platform's limit on
/// continuous scan sessions.
///
/// Like the flush scheduler this only tracks deadlines; the pipeline actor
/// performs the actions it returns.
#[derive(Debug)]
pub struct ScanWatchdog {
    interval: Duration,
    settle_delay: Duration,
    phase: Phase,
}

impl ScanWatchdog {
    pub fn new(interval: Duration, settle_delay: Duration) -> Self {
        ScanWatchdog {
            interval,
            settle_delay,
            phase: Phase::Disarmed,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.phase = Phase::Waiting(now + self.interval);
    }

    pub fn disarm(&mut self) {
        self.phase = Phase::Disarmed;
    }

    /// Skips the wait: the scan should be stopped now and restarted after
    /// the settle delay.
    pub fn restart_now(&mut self, now: Instant) -> WatchdogAction {
        self.phase = Phase::Settling(now + self.settle_delay);
        WatchdogAction::StopScan
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.phase != Phase::Disarmed
    }

    #[cfg(test)]
    pub fn is_settling(&self) -> bool {
        matches!(self.phase, Phase::Settling(_))
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Disarmed => None,
            Phase::Waiting(deadline) | Phase::Settling(deadline) => Some(deadline),
        }
    }

    /// Advances the cycle if its deadline has passed.
    pub fn fire(&mut self, now: Instant) -> Option<WatchdogAction> {
        match self.phase {
            Phase::Waiting(deadline) if deadline <= now => Some(self.restart_now(now)),
            Phase::Settling(deadline) if deadline <= now => {
                self.arm(now);
                Some(WatchdogAction::StartScan)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(240);
    const SETTLE: Duration = Duration::from_secs(1);

    #[test]
    fn test_cycle() {
        let start = Instant::now();
        let mut watchdog = ScanWatchdog::new(INTERVAL, SETTLE);
        assert_eq!(watchdog.deadline(), None);
        assert_eq!(watchdog.fire(start + INTERVAL), None);

        watchdog.arm(start);
        assert_eq!(watchdog.deadline(), Some(start + INTERVAL));
        assert_eq!(watchdog.fire(start + INTERVAL - SETTLE), None);

        let stopped_at = start + INTERVAL;
        assert_eq!(watchdog.fire(stopped_at), Some(WatchdogAction::StopScan));
        assert!(watchdog.is_settling());
        assert_eq!(watchdog.deadline(), Some(stopped_at + SETTLE));

        let started_at = stopped_at + SETTLE;
        assert_eq!(watchdog.fire(started_at), Some(WatchdogAction::StartScan));
        assert!(!watchdog.is_settling());
        assert_eq!(watchdog.deadline(), Some(started_at + INTERVAL));
    }

    #[test]
    fn test_disarm_cancels_pending_restart() {
        let start = Instant::now();
        let mut watchdog = ScanWatchdog::new(INTERVAL, SETTLE);
        watchdog.arm(start);
        watchdog.restart_now(start);
        watchdog.disarm();
        assert!(!watchdog.is_armed());
        assert_eq!(watchdog.fire(start + INTERVAL * 2), None);
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let start = Instant::now();
        let mut watchdog = ScanWatchdog::new(INTERVAL, SETTLE);
        watchdog.arm(start);
        let later = start + Duration::from_secs(30);
        watchdog.arm(later);
        assert_eq!(watchdog.fire(start + INTERVAL), None);
        assert_eq!(watchdog.deadline(), Some(later + INTERVAL));
    }
}
