/// Progress-file activity monitor.
///
/// Fed one progress snapshot per supervisor tick. Tracks two independent
/// clocks: time since the file last grew or was touched (no-activity timeout)
/// and time since monitoring began (per-attempt ceiling). Process liveness is
/// not its concern; the supervisor checks that first on every tick.
use crate::progress::ProgressSnapshot;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// Idle time after which a live worker is declared hung.
    pub stale_timeout: Duration,
    /// Hard cap on one attempt, regardless of activity.
    pub max_duration: Duration,
}

/// What one observation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Size or mtime moved since the previous tick.
    Active,
    /// Nothing moved, still inside the no-activity timeout.
    Quiet { idle: Duration },
    /// Nothing moved for longer than the no-activity timeout.
    Stale { idle: Duration },
    /// The attempt ran past its ceiling.
    Expired { elapsed: Duration },
}

pub struct Watchdog {
    settings: WatchdogSettings,
    started: Instant,
    last_activity: Instant,
    last: ProgressSnapshot,
    warned: bool,
}

impl Watchdog {
    /// Start watching. `baseline` is the snapshot taken when monitoring
    /// began; the idle clock starts now, not at the file's mtime.
    pub fn new(settings: WatchdogSettings, baseline: ProgressSnapshot, now: Instant) -> Self {
        Self {
            settings,
            started: now,
            last_activity: now,
            last: baseline,
            warned: false,
        }
    }

    pub fn observe(&mut self, snapshot: ProgressSnapshot, now: Instant) -> WatchdogVerdict {
        let advanced = snapshot.advanced_since(&self.last);
        if advanced {
            self.last_activity = now;
            self.warned = false;
        }
        self.last = snapshot;

        let idle = now.saturating_duration_since(self.last_activity);
        let elapsed = now.saturating_duration_since(self.started);

        if idle > self.settings.stale_timeout {
            WatchdogVerdict::Stale { idle }
        } else if elapsed > self.settings.max_duration {
            WatchdogVerdict::Expired { elapsed }
        } else if advanced {
            WatchdogVerdict::Active
        } else {
            WatchdogVerdict::Quiet { idle }
        }
    }

    /// True exactly once per quiet stretch, when idle time first passes half
    /// of the no-activity timeout.
    pub fn should_warn(&mut self, idle: Duration) -> bool {
        if !self.warned && idle >= self.settings.stale_timeout / 2 {
            self.warned = true;
            return true;
        }
        false
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn last_snapshot(&self) -> &ProgressSnapshot {
        &self.last
    }
}
