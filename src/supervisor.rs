/// Generation supervisor: one attempt at generating one work unit.
///
/// Launching -> Resolving -> Monitoring -> {Completed, Crashed, Hung, Abandoned}.
///
/// Monitoring polls on a fixed tick. Every tick checks, in order: cancellation,
/// process liveness, the progress file, then the two watchdog clocks. Liveness
/// always wins, so a dead worker next to a long-stale file is a crash, not a
/// hang.
use crate::process::{ProcessControl, ProcessRecord};
use crate::progress::ProgressChannel;
use crate::season::Season;
use crate::status::{HarnessState, StatusTracker};
use crate::watchdog::{Watchdog, WatchdogSettings, WatchdogVerdict};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    Crashed,
    Hung,
    Abandoned,
}

/// Terminal result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub kind: OutcomeKind,
    pub reason: String,
}

impl AttemptOutcome {
    pub fn completed(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Completed, reason)
    }

    pub fn crashed(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Crashed, reason)
    }

    pub fn hung(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Hung, reason)
    }

    pub fn abandoned(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Abandoned, reason)
    }

    fn new(kind: OutcomeKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Crashed and Hung are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, OutcomeKind::Crashed | OutcomeKind::Hung)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub executable: PathBuf,
    pub tick: Duration,
    pub watchdog: WatchdogSettings,
    /// How long a worker may keep running after signalling completion before
    /// it is stopped.
    pub exit_grace: Duration,
}

pub struct GenerationSupervisor<P: ProcessControl> {
    process: P,
    channel: Arc<ProgressChannel>,
    settings: SupervisorSettings,
    status: StatusTracker,
}

impl<P: ProcessControl> GenerationSupervisor<P> {
    pub fn new(
        process: P,
        channel: Arc<ProgressChannel>,
        settings: SupervisorSettings,
        status: StatusTracker,
    ) -> Self {
        Self {
            process,
            channel,
            settings,
            status,
        }
    }

    pub fn channel(&self) -> &Arc<ProgressChannel> {
        &self.channel
    }

    #[cfg(test)]
    pub fn process(&self) -> &P {
        &self.process
    }

    /// Run one attempt to a terminal outcome.
    pub async fn run_attempt(
        &mut self,
        work_unit: Season,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        self.status.set_attempt(attempt);
        self.status.update(HarnessState::Launching);

        self.channel.reset_ownership();
        if let Err(e) = self.channel.ensure_exists() {
            return AttemptOutcome::crashed(format!(
                "launch failed: cannot create {}: {e}",
                self.channel.path().display()
            ));
        }
        let existing = self.channel.snapshot();
        if existing.entries > 0 {
            tracing::info!(
                %work_unit,
                entries = existing.entries,
                last_entry = existing.last_entry.as_deref().unwrap_or(""),
                "resuming from existing progress"
            );
        }

        let executable = self.settings.executable.clone();
        let launched = match self.process.launch(&executable).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(%work_unit, attempt, error = %e, "launch failed");
                return AttemptOutcome::crashed(format!("launch failed: {e}"));
            }
        };

        self.status.update(HarnessState::Resolving);
        let worker = match self.process.resolve_effective_worker(launched.clone()).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(%work_unit, attempt, error = %e, "launcher handoff failed");
                self.process.terminate(&launched).await;
                return AttemptOutcome::crashed(format!(
                    "worker not found after launcher exit: {e}"
                ));
            }
        };

        self.status.set_worker_pid(Some(worker.pid));
        self.status.update(HarnessState::Monitoring);
        tracing::info!(
            %work_unit,
            attempt,
            pid = worker.pid,
            name = %worker.name,
            started = %worker.started_at,
            "monitoring generation"
        );

        let outcome = self.monitor(&worker, cancel).await;
        self.wind_down(&worker, &outcome).await;
        self.status.set_worker_pid(None);

        match outcome.kind {
            OutcomeKind::Completed => tracing::info!(%work_unit, attempt, reason = %outcome.reason, "attempt completed"),
            OutcomeKind::Abandoned => tracing::warn!(%work_unit, attempt, reason = %outcome.reason, "attempt abandoned"),
            _ => tracing::warn!(%work_unit, attempt, outcome = ?outcome.kind, reason = %outcome.reason, "attempt failed"),
        }
        outcome
    }

    async fn monitor(&mut self, worker: &ProcessRecord, cancel: &CancellationToken) -> AttemptOutcome {
        let mut watchdog = Watchdog::new(
            self.settings.watchdog,
            self.channel.snapshot(),
            Instant::now(),
        );

        loop {
            if cancel.is_cancelled() {
                return AttemptOutcome::abandoned("cancelled by user");
            }

            if !self.process.is_alive(worker) {
                let reason = match self.process.exit_code() {
                    Some(code) => format!("process terminated (exit code {code})"),
                    None => "process terminated (exit code unavailable)".to_string(),
                };
                return AttemptOutcome::crashed(reason);
            }

            let snapshot = self.channel.snapshot();
            let now = Instant::now();
            if !snapshot.exists {
                if self.channel.owns_deletion() {
                    return AttemptOutcome::crashed("progress file removed by supervisor cleanup");
                }
                return AttemptOutcome::completed(format!(
                    "progress file removed by worker after {:.1} min",
                    watchdog.elapsed(now).as_secs_f64() / 60.0
                ));
            }

            let entries = snapshot.entries;
            let last_entry = snapshot.last_entry.clone();
            let previous_entries = watchdog.last_snapshot().entries;

            match watchdog.observe(snapshot, now) {
                WatchdogVerdict::Active => {
                    if entries != previous_entries {
                        tracing::info!(
                            entries,
                            last_entry = last_entry.as_deref().unwrap_or(""),
                            "generation progressing"
                        );
                        self.status.set_progress_entries(entries);
                        self.status.update(HarnessState::Monitoring);
                    }
                }
                WatchdogVerdict::Quiet { idle } => {
                    if watchdog.should_warn(idle) {
                        tracing::warn!(
                            idle_secs = idle.as_secs(),
                            timeout_secs = self.settings.watchdog.stale_timeout.as_secs(),
                            "no progress-file activity"
                        );
                    }
                }
                WatchdogVerdict::Stale { idle } => {
                    return AttemptOutcome::hung(format!(
                        "no progress-file activity for {:.1}s",
                        idle.as_secs_f64()
                    ));
                }
                WatchdogVerdict::Expired { elapsed } => {
                    return AttemptOutcome::hung(format!(
                        "attempt exceeded its {:.1}s ceiling after {:.1}s",
                        self.settings.watchdog.max_duration.as_secs_f64(),
                        elapsed.as_secs_f64()
                    ));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return AttemptOutcome::abandoned("cancelled by user");
                }
                _ = tokio::time::sleep(self.settings.tick) => {}
            }
        }
    }

    /// Leave no worker behind once the attempt is decided.
    async fn wind_down(&mut self, worker: &ProcessRecord, outcome: &AttemptOutcome) {
        if outcome.kind == OutcomeKind::Completed {
            // The game normally quits by itself once the cache is written.
            let deadline = Instant::now() + self.settings.exit_grace;
            while Instant::now() < deadline {
                if !self.process.is_alive(worker) {
                    tracing::info!(pid = worker.pid, "worker exited after completion");
                    return;
                }
                tokio::time::sleep(self.settings.tick.min(Duration::from_millis(500))).await;
            }
            tracing::info!(pid = worker.pid, "worker still running after completion, stopping it");
        }
        self.process.terminate(worker).await;
    }
}
